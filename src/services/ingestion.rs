// Document ingestion: where raw document bytes come from

use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::core::errors::IngestError;
use crate::core::types::Document;

/// `fetch_document(id) -> Document`
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, id: &str) -> Result<Document, IngestError>;
}

/// Documents stored as files named by their id under one root directory.
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ids are plain file names; anything that could escape the root is
    /// treated as absent.
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let id = id.trim();
        if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
            return None;
        }
        Some(self.root.join(id))
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn fetch_document(&self, id: &str) -> Result<Document, IngestError> {
        let path = self
            .path_for(id)
            .ok_or_else(|| IngestError::NotFound(id.to_string()))?;

        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            IoErrorKind::NotFound => IngestError::NotFound(id.to_string()),
            _ => IngestError::Storage {
                id: id.to_string(),
                message: e.to_string(),
            },
        })?;

        debug!("Fetched {} ({} bytes) from {}", id, bytes.len(), path.display());
        Ok(Document::new(id, bytes).with_filename(id))
    }
}

/// In-memory source, keyed by document id.
#[derive(Default, Clone)]
pub struct MemoryDocumentSource {
    documents: Arc<DashMap<String, Document>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        self.documents.insert(document.id.clone(), document);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn fetch_document(&self, id: &str) -> Result<Document, IngestError> {
        self.documents
            .get(id)
            .map(|d| d.value().clone())
            .ok_or_else(|| IngestError::NotFound(id.to_string()))
    }
}

/// One item of a batch: either bytes supplied with the request or an id to
/// resolve through a [`DocumentSource`] when the document is processed.
#[derive(Clone)]
pub enum DocumentInput {
    Inline(Document),
    Stored {
        id: String,
        source: Arc<dyn DocumentSource>,
    },
}

impl DocumentInput {
    pub fn id(&self) -> &str {
        match self {
            DocumentInput::Inline(document) => &document.id,
            DocumentInput::Stored { id, .. } => id,
        }
    }

    pub async fn resolve(self) -> Result<Document, IngestError> {
        match self {
            DocumentInput::Inline(document) => Ok(document),
            DocumentInput::Stored { id, source } => source.fetch_document(&id).await,
        }
    }
}

impl From<Document> for DocumentInput {
    fn from(document: Document) -> Self {
        DocumentInput::Inline(document)
    }
}
