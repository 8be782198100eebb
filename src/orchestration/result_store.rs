//! Result sink and progress log.
//!
//! Batches are ledgers of per-document states in input order. Every state
//! transition is appended to the batch's event log, which can be replayed
//! from any cursor, and broadcast to live subscribers. A terminal state is
//! written once and never replaced, so each document ends with exactly one
//! result or exactly one failure record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::types::{
    BatchAnalytics, BatchEntry, BatchReport, BatchSummary, Document, DocumentResult,
    DocumentState, FailureRecord, StatusEvent,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Retention used by `ResultStore::new`
pub const DEFAULT_RETAINED_BATCHES: usize = 256;

struct BatchRecord {
    document_ids: Vec<String>,
    states: Vec<DocumentState>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    analytics: Option<BatchAnalytics>,
    events: Vec<StatusEvent>,
}

impl BatchRecord {
    fn entries(&self) -> Vec<BatchEntry> {
        self.document_ids
            .iter()
            .zip(&self.states)
            .enumerate()
            .map(|(index, (id, state))| BatchEntry::from_state(index, id, state))
            .collect()
    }

    fn is_settled(&self) -> bool {
        self.states.iter().all(|s| s.status().is_terminal())
    }
}

pub struct ResultStore {
    batches: DashMap<String, BatchRecord>,
    /// Latest successful result per document id, across batches
    results: DashMap<String, Arc<DocumentResult>>,
    /// Source documents of successful results, kept for export
    documents: DashMap<String, Document>,
    /// Batch ids in creation order
    order: Mutex<Vec<String>>,
    events: broadcast::Sender<StatusEvent>,
    max_batches: usize,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_BATCHES)
    }

    /// Keeps at most `max_batches` batches once they have settled. Evicting
    /// a batch also drops the results and source documents it produced,
    /// unless a newer batch has since replaced them. Running batches are
    /// never evicted.
    pub fn with_retention(max_batches: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            batches: DashMap::new(),
            results: DashMap::new(),
            documents: DashMap::new(),
            order: Mutex::new(Vec::new()),
            events,
            max_batches: max_batches.max(1),
        }
    }

    /// Creates the batch ledger with every document `pending`. Events are
    /// published only once the ledger is readable.
    pub fn register_batch(&self, batch_id: &str, document_ids: Vec<String>) {
        let now = Utc::now();
        let mut record = BatchRecord {
            states: vec![DocumentState::Pending; document_ids.len()],
            document_ids,
            created_at: now,
            finished_at: None,
            analytics: None,
            events: Vec::new(),
        };
        let pending: Vec<StatusEvent> = (0..record.document_ids.len())
            .map(|index| Self::append_event(batch_id, &mut record, index))
            .collect();
        if record.document_ids.is_empty() {
            record.finished_at = Some(now);
            record.analytics = Some(BatchAnalytics::default());
        }
        self.batches.insert(batch_id.to_string(), record);
        {
            let mut order = self.order.lock();
            order.push(batch_id.to_string());
            self.evict_settled(&mut order);
        }

        for event in pending {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Drops the oldest settled batches beyond the retention bound.
    fn evict_settled(&self, order: &mut Vec<String>) {
        while order.len() > self.max_batches {
            let oldest_settled = order.iter().position(|id| {
                self.batches
                    .get(id)
                    .map(|record| record.finished_at.is_some())
                    .unwrap_or(true)
            });
            let Some(position) = oldest_settled else {
                break;
            };
            let batch_id = order.remove(position);
            let Some((_, record)) = self.batches.remove(&batch_id) else {
                continue;
            };
            for state in &record.states {
                if let DocumentState::Succeeded(result) = state {
                    let id = &result.document_id;
                    if self
                        .results
                        .remove_if(id, |_, latest| Arc::ptr_eq(latest, result))
                        .is_some()
                    {
                        self.documents.remove(id);
                    }
                }
            }
            debug!("Evicted batch {} ({} documents)", batch_id, record.states.len());
        }
    }

    pub fn mark_running(&self, batch_id: &str, index: usize) -> bool {
        self.transition(batch_id, index, DocumentState::Running)
    }

    pub fn record_success(
        &self,
        batch_id: &str,
        index: usize,
        result: Arc<DocumentResult>,
        document: Document,
    ) -> bool {
        let latest = Arc::clone(&result);
        // Published under the ledger guard so eviction cannot slip in between
        self.transition_with(batch_id, index, DocumentState::Succeeded(result), || {
            self.documents.insert(latest.document_id.clone(), document);
            self.results.insert(latest.document_id.clone(), latest);
        })
    }

    pub fn record_failure(&self, batch_id: &str, index: usize, failure: FailureRecord) -> bool {
        self.transition(batch_id, index, DocumentState::Failed(failure))
    }

    /// Records `failure` for every document of the batch that has no
    /// terminal state yet. Returns how many were failed.
    pub fn fail_unsettled(&self, batch_id: &str, failure: &FailureRecord) -> usize {
        let open: Vec<usize> = match self.batches.get(batch_id) {
            Some(record) => record
                .states
                .iter()
                .enumerate()
                .filter(|(_, state)| !state.status().is_terminal())
                .map(|(index, _)| index)
                .collect(),
            None => return 0,
        };
        open.into_iter()
            .filter(|&index| self.record_failure(batch_id, index, failure.clone()))
            .count()
    }

    fn transition(&self, batch_id: &str, index: usize, next: DocumentState) -> bool {
        self.transition_with(batch_id, index, next, || {})
    }

    fn transition_with(
        &self,
        batch_id: &str,
        index: usize,
        next: DocumentState,
        on_applied: impl FnOnce(),
    ) -> bool {
        let Some(mut record) = self.batches.get_mut(batch_id) else {
            warn!("Status update for unknown batch {}", batch_id);
            return false;
        };
        let Some(current) = record.states.get(index) else {
            warn!("Status update for out-of-range index {} in batch {}", index, batch_id);
            return false;
        };
        if current.status().is_terminal() {
            warn!(
                "Ignoring {:?} for {} in batch {}: already {:?}",
                next.status(),
                record.document_ids[index],
                batch_id,
                current.status()
            );
            return false;
        }

        record.states[index] = next;
        let event = Self::append_event(batch_id, &mut record, index);

        if record.finished_at.is_none() && record.is_settled() {
            let finished_at = Utc::now();
            let total_ms = (finished_at - record.created_at)
                .num_microseconds()
                .map(|us| us as f64 / 1000.0)
                .unwrap_or_default();
            let analytics = BatchAnalytics::from_entries(&record.entries(), total_ms);
            record.analytics = Some(analytics);
            record.finished_at = Some(finished_at);
        }
        on_applied();
        drop(record);

        let _ = self.events.send(event);
        true
    }

    fn append_event(batch_id: &str, record: &mut BatchRecord, index: usize) -> StatusEvent {
        let state = &record.states[index];
        let event = StatusEvent {
            sequence: record.events.len() as u64,
            batch_id: batch_id.to_string(),
            document_id: record.document_ids[index].clone(),
            index,
            status: state.status(),
            at: Utc::now(),
            failure_kind: match state {
                DocumentState::Failed(failure) => Some(failure.kind),
                _ => None,
            },
        };
        record.events.push(event.clone());
        event
    }

    pub fn get_batch_report(&self, batch_id: &str) -> Option<BatchReport> {
        let record = self.batches.get(batch_id)?;
        Some(BatchReport::new(
            batch_id,
            record.entries(),
            record.created_at,
            record.finished_at,
            record.analytics.clone(),
        ))
    }

    pub fn get_result(&self, document_id: &str) -> Option<Arc<DocumentResult>> {
        self.results.get(document_id).map(|r| r.value().clone())
    }

    pub fn get_document(&self, document_id: &str) -> Option<Document> {
        self.documents.get(document_id).map(|d| d.value().clone())
    }

    /// Events with `sequence >= cursor`, oldest first.
    pub fn events_since(&self, batch_id: &str, cursor: u64) -> Option<Vec<StatusEvent>> {
        let record = self.batches.get(batch_id)?;
        let start = (cursor as usize).min(record.events.len());
        Some(record.events[start..].to_vec())
    }

    /// Live feed of every transition in every batch.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Newest batches first.
    pub fn history(&self, offset: usize, limit: usize) -> Vec<BatchSummary> {
        let ids: Vec<String> = self
            .order
            .lock()
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        ids.iter()
            .filter_map(|id| self.get_batch_report(id))
            .map(|report| BatchSummary::from(&report))
            .collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorKind;
    use crate::core::types::{DocumentMetadata, DocumentStatus, EnhancementStatus, StageTimings};

    fn result(id: &str) -> Arc<DocumentResult> {
        Arc::new(DocumentResult {
            document_id: id.into(),
            metadata: DocumentMetadata::sniff(b"", None),
            original_width: 10,
            original_height: 10,
            skew_degrees: 0.0,
            quarter_turns: 0,
            detections: Vec::new(),
            enhancement: EnhancementStatus::Unavailable {
                reason: "test".into(),
            },
            enhanced: None,
            retries: 0,
            timings: StageTimings::default(),
        })
    }

    fn failure() -> FailureRecord {
        FailureRecord {
            kind: ErrorKind::Decode,
            message: "bad bytes".into(),
            attempts: 1,
        }
    }

    #[test]
    fn test_batch_completes_only_when_all_terminal() {
        let store = ResultStore::new();
        store.register_batch("b1", vec!["a".into(), "b".into()]);
        store.mark_running("b1", 0);
        store.record_success("b1", 0, result("a"), Document::new("a", Vec::new()));

        let report = store.get_batch_report("b1").unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.entry("b").unwrap().status, DocumentStatus::Pending);
        assert!(report.analytics.is_none());

        store.record_failure("b1", 1, failure());
        let report = store.get_batch_report("b1").unwrap();
        assert!(report.is_complete());
        assert!(report.finished_at.is_some());
        assert_eq!(report.analytics.unwrap().failed, 1);
    }

    #[test]
    fn test_terminal_state_is_final() {
        let store = ResultStore::new();
        store.register_batch("b1", vec!["a".into()]);
        assert!(store.record_failure("b1", 0, failure()));
        assert!(!store.record_success("b1", 0, result("a"), Document::new("a", Vec::new())));
        assert!(store.get_result("a").is_none());

        let entry = &store.get_batch_report("b1").unwrap().entries[0];
        assert!(entry.result.is_none());
        assert!(entry.failure.is_some());
    }

    #[test]
    fn test_events_are_restartable() {
        let store = ResultStore::new();
        store.register_batch("b1", vec!["a".into()]);
        store.mark_running("b1", 0);
        store.record_failure("b1", 0, failure());

        let all = store.events_since("b1", 0).unwrap();
        let statuses: Vec<_> = all.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![DocumentStatus::Pending, DocumentStatus::Running, DocumentStatus::Failed]
        );
        assert_eq!(all[2].failure_kind, Some(ErrorKind::Decode));

        let tail = store.events_since("b1", 2).unwrap();
        assert_eq!(tail, all[2..].to_vec());
        assert!(store.events_since("b1", 99).unwrap().is_empty());
        assert!(store.events_since("nope", 0).is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let store = ResultStore::new();
        let mut rx = store.subscribe();
        store.register_batch("b1", vec!["a".into()]);
        store.mark_running("b1", 0);
        assert_eq!(rx.recv().await.unwrap().status, DocumentStatus::Pending);
        assert_eq!(rx.recv().await.unwrap().status, DocumentStatus::Running);
    }

    #[test]
    fn test_history_newest_first() {
        let store = ResultStore::new();
        store.register_batch("first", vec!["a".into()]);
        store.register_batch("second", Vec::new());
        let history = store.history(0, 10);
        assert_eq!(history[0].batch_id, "second");
        assert_eq!(history[1].batch_id, "first");
        assert_eq!(store.history(1, 1).len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_is_readable_when_pending_events_arrive() {
        let store = Arc::new(ResultStore::new());
        let mut rx = store.subscribe();
        store.register_batch("b1", vec!["a".into(), "b".into()]);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, DocumentStatus::Pending);
        assert_eq!(store.events_since(&event.batch_id, 0).unwrap().len(), 2);
        assert!(store.get_batch_report(&event.batch_id).is_some());
    }

    #[test]
    fn test_oldest_settled_batches_are_evicted() {
        let store = ResultStore::with_retention(2);

        store.register_batch("old", vec!["a".into()]);
        store.record_success("old", 0, result("a"), Document::new("a", vec![1]));
        store.register_batch("running", vec!["b".into()]);
        store.register_batch("new", vec!["c".into()]);
        store.record_success("new", 0, result("c"), Document::new("c", vec![3]));

        // "old" is settled and beyond the bound; "running" is kept
        assert!(store.get_batch_report("old").is_none());
        assert!(store.get_result("a").is_none());
        assert!(store.get_document("a").is_none());
        assert!(store.get_batch_report("running").is_some());
        assert_eq!(store.batch_count(), 2);

        // The running batch is skipped; the next settled one goes
        store.register_batch("newest", vec!["d".into()]);
        assert_eq!(store.batch_count(), 2);
        assert!(store.get_batch_report("new").is_none());
        assert!(store.get_batch_report("running").is_some());
    }

    #[test]
    fn test_eviction_keeps_results_replaced_by_newer_batches() {
        let store = ResultStore::with_retention(2);
        store.register_batch("b1", vec!["a".into()]);
        store.record_success("b1", 0, result("a"), Document::new("a", vec![1]));
        store.register_batch("b2", vec!["a".into()]);
        store.record_success("b2", 0, result("a"), Document::new("a", vec![2]));

        store.register_batch("b3", Vec::new());
        assert!(store.get_batch_report("b1").is_none());
        assert!(store.get_result("a").is_some());
        assert_eq!(store.get_document("a").unwrap().bytes.as_slice(), &[2]);
    }

    #[test]
    fn test_fail_unsettled_finalizes_the_batch() {
        let store = ResultStore::new();
        store.register_batch("b1", vec!["a".into(), "b".into(), "c".into()]);
        store.record_success("b1", 0, result("a"), Document::new("a", Vec::new()));
        store.mark_running("b1", 1);

        let internal = FailureRecord {
            kind: ErrorKind::Internal,
            message: "driver stopped".into(),
            attempts: 0,
        };
        assert_eq!(store.fail_unsettled("b1", &internal), 2);
        assert_eq!(store.fail_unsettled("b1", &internal), 0);

        let report = store.get_batch_report("b1").unwrap();
        assert!(report.is_complete());
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.entry("b").unwrap().failure.as_ref().unwrap().kind, ErrorKind::Internal);
    }
}
