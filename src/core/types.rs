// Domain types for the document audit pipeline

use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::errors::{ErrorKind, StageName};
use crate::core::geometry::{AffineTransform, BBox, ProjectedRegion, Region};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<crate::orchestration::BatchOrchestrator>,
    pub store: Arc<crate::orchestration::ResultStore>,
    pub source: Arc<dyn crate::services::ingestion::DocumentSource>,
    pub metrics: crate::utils::Metrics,
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Encoding of the raw document bytes, sniffed from magic numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Tiff,
    Pdf,
    /// Recognised by the image codec family but not decodable here
    OtherImage,
    Unknown,
}

impl SourceFormat {
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(b"%PDF") {
            return SourceFormat::Pdf;
        }
        match image::guess_format(bytes) {
            Ok(ImageFormat::Png) => SourceFormat::Png,
            Ok(ImageFormat::Jpeg) => SourceFormat::Jpeg,
            Ok(ImageFormat::Gif) => SourceFormat::Gif,
            Ok(ImageFormat::WebP) => SourceFormat::Webp,
            Ok(ImageFormat::Bmp) => SourceFormat::Bmp,
            Ok(ImageFormat::Tiff) => SourceFormat::Tiff,
            Ok(_) => SourceFormat::OtherImage,
            Err(_) => SourceFormat::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Png => "png",
            SourceFormat::Jpeg => "jpeg",
            SourceFormat::Gif => "gif",
            SourceFormat::Webp => "webp",
            SourceFormat::Bmp => "bmp",
            SourceFormat::Tiff => "tiff",
            SourceFormat::Pdf => "pdf",
            SourceFormat::OtherImage => "other",
            SourceFormat::Unknown => "unknown",
        }
    }
}

/// Document metadata captured at ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub source_format: SourceFormat,
    pub page_count: u32,
    pub byte_len: usize,
}

impl DocumentMetadata {
    pub fn sniff(bytes: &[u8], filename: Option<String>) -> Self {
        let source_format = SourceFormat::sniff(bytes);
        let page_count = match source_format {
            SourceFormat::Pdf => count_pdf_pages(bytes),
            _ => 1,
        };
        Self {
            filename,
            source_format,
            page_count,
            byte_len: bytes.len(),
        }
    }
}

/// Counts `/Type /Page` objects (not `/Pages`). Good enough for metadata.
fn count_pdf_pages(bytes: &[u8]) -> u32 {
    let needle = b"/Type";
    let mut count = 0u32;
    let mut i = 0;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            let mut j = i + needle.len();
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if bytes[j..].starts_with(b"/Page") && !bytes[j..].starts_with(b"/Pages") {
                count += 1;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    count.max(1)
}

/// An ingested document. Immutable once created.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub bytes: Arc<Vec<u8>>,
    pub metadata: DocumentMetadata,
}

impl Document {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        let metadata = DocumentMetadata::sniff(&bytes, None);
        Self {
            id: id.into(),
            bytes: Arc::new(bytes),
            metadata,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.metadata.filename = Some(filename.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Normalized images
// ---------------------------------------------------------------------------

/// Canonical pixel grid of one document plus the maps between its grid and
/// the original document grid.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub document_id: String,
    pub pixels: Arc<DynamicImage>,
    /// normalized -> original
    pub to_original: AffineTransform,
    /// original -> normalized
    pub from_original: AffineTransform,
    pub original_width: u32,
    pub original_height: u32,
    pub quarter_turns: u8,
    pub skew_degrees: f32,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Rectangular region in this image's grid, carrying the map back to
    /// the original document.
    pub fn rect_region(&self, bbox: BBox) -> Region {
        Region::rect(bbox, self.to_original)
    }
}

// ---------------------------------------------------------------------------
// Detections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Signature,
    Seal,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Signature => "signature",
            Category::Seal => "seal",
        }
    }

    pub fn stage(&self) -> StageName {
        match self {
            Category::Signature => StageName::Signature,
            Category::Seal => StageName::Seal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticityVerdict {
    Genuine,
    Suspicious,
    Indeterminate,
}

impl AuthenticityVerdict {
    /// Maps a scorer label onto a verdict. Unrecognised labels are
    /// indeterminate.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "genuine" | "authentic" | "real" => AuthenticityVerdict::Genuine,
            "suspicious" | "forged" | "forgery" | "fake" => AuthenticityVerdict::Suspicious,
            _ => AuthenticityVerdict::Indeterminate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticityVerdict::Genuine => "genuine",
            AuthenticityVerdict::Suspicious => "suspicious",
            AuthenticityVerdict::Indeterminate => "indeterminate",
        }
    }
}

/// Seal type taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealType {
    Notary,
    Corporate,
    Government,
    Unknown,
}

impl SealType {
    pub const ALL: [SealType; 4] = [
        SealType::Notary,
        SealType::Corporate,
        SealType::Government,
        SealType::Unknown,
    ];

    /// Lenient mapping from classifier labels.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "notary" | "notary_stamp" | "notarial" => SealType::Notary,
            "corporate" | "organizational" | "organization" | "company" => SealType::Corporate,
            "government" | "official" | "state" => SealType::Government,
            _ => SealType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SealType::Notary => "notary",
            SealType::Corporate => "corporate",
            SealType::Government => "government",
            SealType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SealType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SealType {
    type Err = String;

    /// Strict parse used for configuration.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SealType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown seal type '{}'", s.trim()))
    }
}

/// Category-specific classification of a detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    Signature {
        verdict: AuthenticityVerdict,
        /// Confidence of the secondary scoring pass, independent of the
        /// location confidence.
        authenticity_confidence: f32,
    },
    Seal {
        seal_type: SealType,
        type_confidence: f32,
    },
}

impl Classification {
    /// Declared subtype used during overlap resolution. Signatures and
    /// unknown seals declare none.
    pub fn declared_subtype(&self) -> Option<SealType> {
        match self {
            Classification::Seal { seal_type, .. } if *seal_type != SealType::Unknown => {
                Some(*seal_type)
            }
            _ => None,
        }
    }
}

/// One located, classified and scored instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub category: Category,
    pub region: Region,
    pub classification: Classification,
    pub confidence: f32,
}

/// A retained detection with its region projected into original document
/// coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDetection {
    #[serde(flatten)]
    pub detection: Detection,
    pub original: ProjectedRegion,
}

// ---------------------------------------------------------------------------
// Enhancement and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementReport {
    pub denoise_radius: u32,
    pub contrast_gain: f32,
    pub sharpened: bool,
    /// Flat or otherwise degenerate input; only the safe steps were applied.
    pub degenerate: bool,
}

/// Enhanced rendition. Shares the normalized image's coordinate grid.
#[derive(Debug, Clone)]
pub struct EnhancedImage {
    pub pixels: Arc<DynamicImage>,
    pub to_original: AffineTransform,
    pub report: EnhancementReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnhancementStatus {
    Available { report: EnhancementReport },
    Unavailable { reason: String },
}

/// Per-stage wall time for one document, milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub ingestion_ms: f64,
    pub normalization_ms: f64,
    pub signature_ms: f64,
    pub seal_ms: f64,
    pub enhancement_ms: f64,
    pub consolidation_ms: f64,
    pub total_ms: f64,
}

/// Final consolidated result for one document. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResult {
    pub document_id: String,
    pub metadata: DocumentMetadata,
    pub original_width: u32,
    pub original_height: u32,
    pub skew_degrees: f32,
    pub quarter_turns: u8,
    pub detections: Vec<ResolvedDetection>,
    pub enhancement: EnhancementStatus,
    #[serde(skip)]
    pub enhanced: Option<Arc<EnhancedImage>>,
    pub retries: u32,
    pub timings: StageTimings,
}

impl DocumentResult {
    pub fn count(&self, category: Category) -> usize {
        self.detections
            .iter()
            .filter(|d| d.detection.category == category)
            .count()
    }
}

/// User-facing failure description for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Batch state and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Succeeded | DocumentStatus::Failed)
    }
}

/// Lifecycle of one document inside a batch. A terminal state carries
/// exactly one of a result or a failure record.
#[derive(Debug, Clone)]
pub enum DocumentState {
    Pending,
    Running,
    Succeeded(Arc<DocumentResult>),
    Failed(FailureRecord),
}

impl DocumentState {
    pub fn status(&self) -> DocumentStatus {
        match self {
            DocumentState::Pending => DocumentStatus::Pending,
            DocumentState::Running => DocumentStatus::Running,
            DocumentState::Succeeded(_) => DocumentStatus::Succeeded,
            DocumentState::Failed(_) => DocumentStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub index: usize,
    pub document_id: String,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Arc<DocumentResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
}

impl BatchEntry {
    pub fn from_state(index: usize, document_id: &str, state: &DocumentState) -> Self {
        let (result, failure) = match state {
            DocumentState::Succeeded(result) => (Some(result.clone()), None),
            DocumentState::Failed(failure) => (None, Some(failure.clone())),
            _ => (None, None),
        };
        Self {
            index,
            document_id: document_id.to_string(),
            status: state.status(),
            result,
            failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
}

/// Aggregate outcome ledger for a batch, enumerated in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub entries: Vec<BatchEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<BatchAnalytics>,
}

impl BatchReport {
    /// Builds a report from entries already in input order. The batch is
    /// `completed` only when every entry is terminal.
    pub fn new(
        batch_id: impl Into<String>,
        entries: Vec<BatchEntry>,
        created_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
        analytics: Option<BatchAnalytics>,
    ) -> Self {
        let count = |status: DocumentStatus| entries.iter().filter(|e| e.status == status).count();
        let pending = count(DocumentStatus::Pending);
        let running = count(DocumentStatus::Running);
        let succeeded = count(DocumentStatus::Succeeded);
        let failed = count(DocumentStatus::Failed);
        let complete = pending == 0 && running == 0;

        Self {
            batch_id: batch_id.into(),
            status: if complete {
                BatchStatus::Completed
            } else {
                BatchStatus::Running
            },
            total: entries.len(),
            pending,
            running,
            succeeded,
            failed,
            created_at,
            finished_at: if complete { finished_at } else { None },
            entries,
            analytics: if complete { analytics } else { None },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Completed
    }

    pub fn entry(&self, document_id: &str) -> Option<&BatchEntry> {
        self.entries.iter().find(|e| e.document_id == document_id)
    }
}

/// Row in the batch history listing
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&BatchReport> for BatchSummary {
    fn from(report: &BatchReport) -> Self {
        Self {
            batch_id: report.batch_id.clone(),
            status: report.status,
            total: report.total,
            succeeded: report.succeeded,
            failed: report.failed,
            created_at: report.created_at,
            finished_at: report.finished_at,
        }
    }
}

/// One status transition of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub sequence: u64,
    pub batch_id: String,
    pub document_id: String,
    pub index: usize,
    pub status: DocumentStatus,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
}

/// Batch analytics, computed once every document is terminal
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchAnalytics {
    pub total_documents: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub signatures_genuine: usize,
    pub signatures_suspicious: usize,
    pub signatures_indeterminate: usize,
    pub seals_by_type: BTreeMap<String, usize>,
    pub failures_by_kind: BTreeMap<String, usize>,
    pub enhancement_unavailable: usize,
    pub retries: u32,
    pub normalization_time_ms: f64,
    pub signature_time_ms: f64,
    pub seal_time_ms: f64,
    pub enhancement_time_ms: f64,
    pub consolidation_time_ms: f64,
    pub total_time_ms: f64,
    pub average_time_per_document_ms: f64,
}

impl BatchAnalytics {
    pub fn from_entries(entries: &[BatchEntry], total_time_ms: f64) -> Self {
        let mut analytics = BatchAnalytics {
            total_documents: entries.len(),
            total_time_ms,
            ..Default::default()
        };

        for entry in entries {
            if let Some(result) = &entry.result {
                analytics.succeeded += 1;
                analytics.retries += result.retries;
                for resolved in &result.detections {
                    match &resolved.detection.classification {
                        Classification::Signature { verdict, .. } => match verdict {
                            AuthenticityVerdict::Genuine => analytics.signatures_genuine += 1,
                            AuthenticityVerdict::Suspicious => analytics.signatures_suspicious += 1,
                            AuthenticityVerdict::Indeterminate => {
                                analytics.signatures_indeterminate += 1
                            }
                        },
                        Classification::Seal { seal_type, .. } => {
                            *analytics
                                .seals_by_type
                                .entry(seal_type.as_str().to_string())
                                .or_insert(0) += 1;
                        }
                    }
                }
                if matches!(result.enhancement, EnhancementStatus::Unavailable { .. }) {
                    analytics.enhancement_unavailable += 1;
                }
                let t = &result.timings;
                analytics.normalization_time_ms += t.normalization_ms;
                analytics.signature_time_ms += t.signature_ms;
                analytics.seal_time_ms += t.seal_ms;
                analytics.enhancement_time_ms += t.enhancement_ms;
                analytics.consolidation_time_ms += t.consolidation_ms;
            }
            if let Some(failure) = &entry.failure {
                analytics.failed += 1;
                analytics.retries += failure.attempts.saturating_sub(1);
                *analytics
                    .failures_by_kind
                    .entry(failure.kind.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        if analytics.total_documents > 0 {
            analytics.average_time_per_document_ms =
                total_time_ms / analytics.total_documents as f64;
        }
        analytics
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Advisory cancellation flag shared between a document's run and its
/// deadline watcher.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
