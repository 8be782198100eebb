mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use docaudit::core::config::MAX_CONCURRENCY;
use docaudit::core::types::{AuthenticityVerdict, Category, Classification, SealType};
use docaudit::services::model::heuristic::StrokeAuthenticityScorer;
use docaudit::{
    BatchOptions, ConfigError, DocumentInput, DocumentStatus, ErrorKind, MemoryDocumentSource,
};

fn signature_script() -> ScriptedLocator {
    ScriptedLocator::new("sig-locator").on(
        (300, 200),
        Behavior::Boxes(vec![located(50.0, 50.0, 150.0, 90.0, 0.95)]),
    )
}

fn seal_script() -> ScriptedLocator {
    ScriptedLocator::new("seal-locator").on(
        (320, 240),
        Behavior::Boxes(vec![
            located(0.0, 0.0, 100.0, 100.0, 0.6),
            located(0.0, 0.0, 100.0, 80.0, 0.9),
        ]),
    )
}

fn overlap(threshold: f32) -> BatchOptions {
    BatchOptions {
        overlap_threshold: Some(threshold),
        ..BatchOptions::default()
    }
}

#[tokio::test]
async fn mixed_batch_reports_every_document_in_input_order() {
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(4, 5)),
        base_config(),
    );

    let report = orchestrator
        .process_batch(
            vec![doc("A", 300, 200), doc("B", 320, 240), garbage("C")],
            &overlap(0.5),
        )
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    let ids: Vec<&str> = report.entries.iter().map(|e| e.document_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "C"]);

    let a = report.entry("A").unwrap().result.as_ref().unwrap();
    assert_eq!(a.count(Category::Signature), 1);
    assert_eq!(a.count(Category::Seal), 0);
    let signature = &a.detections[0].detection;
    assert!((signature.confidence - 0.95).abs() < 1e-6);
    assert!(matches!(
        signature.classification,
        Classification::Signature {
            verdict: AuthenticityVerdict::Genuine,
            ..
        }
    ));
    // Blank input normalizes to the identity, so the box survives unchanged
    let bounds = a.detections[0].original.bbox;
    assert!((bounds.x_min - 50.0).abs() < 0.5 && (bounds.y_max - 90.0).abs() < 0.5);

    let b = report.entry("B").unwrap().result.as_ref().unwrap();
    assert_eq!(b.count(Category::Seal), 1);
    let seal = &b.detections[0].detection;
    assert!((seal.confidence - 0.9).abs() < 1e-6);
    assert!(matches!(
        seal.classification,
        Classification::Seal {
            seal_type: SealType::Notary,
            ..
        }
    ));

    let c = report.entry("C").unwrap();
    assert_eq!(c.status, DocumentStatus::Failed);
    assert!(c.result.is_none());
    assert_eq!(c.failure.as_ref().unwrap().kind, ErrorKind::Decode);

    let analytics = report.analytics.as_ref().unwrap();
    assert_eq!(analytics.signatures_genuine, 1);
    assert_eq!(analytics.seals_by_type.get("notary"), Some(&1));
    assert_eq!(analytics.failures_by_kind.get("DecodeError"), Some(&1));
}

#[tokio::test]
async fn loose_overlap_threshold_keeps_both_seals() {
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(4, 5)),
        base_config(),
    );
    let report = orchestrator
        .process_batch(vec![doc("B", 320, 240)], &overlap(0.9))
        .await
        .unwrap();

    let b = report.entry("B").unwrap().result.as_ref().unwrap();
    assert_eq!(b.count(Category::Seal), 2);
}

#[tokio::test]
async fn repeated_runs_produce_identical_detections() {
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(4, 5)),
        base_config(),
    );

    let mut runs = Vec::new();
    for _ in 0..2 {
        let report = orchestrator
            .process_batch(vec![doc("A", 300, 200), doc("B", 320, 240)], &overlap(0.5))
            .await
            .unwrap();
        let detections: Vec<_> = report
            .entries
            .iter()
            .map(|e| e.result.as_ref().unwrap().detections.clone())
            .collect();
        runs.push(detections);
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn slow_document_times_out_without_affecting_the_rest() {
    let signature = signature_script().on((400, 300), Behavior::Sleep(Duration::from_millis(2000)));
    let orchestrator = orchestrator(models(signature, seal_script(), gate(4, 5)), base_config());

    let options = BatchOptions {
        per_document_timeout_ms: Some(500),
        ..BatchOptions::default()
    };
    let report = orchestrator
        .process_batch(vec![doc("slow", 400, 300), doc("A", 300, 200)], &options)
        .await
        .unwrap();

    let slow = report.entry("slow").unwrap();
    assert_eq!(slow.status, DocumentStatus::Failed);
    assert_eq!(slow.failure.as_ref().unwrap().kind, ErrorKind::Timeout);

    let a = report.entry("A").unwrap();
    assert_eq!(a.status, DocumentStatus::Succeeded);
    assert_eq!(a.result.as_ref().unwrap().count(Category::Signature), 1);
}

#[tokio::test]
async fn panicking_capability_is_isolated_to_its_document() {
    let signature = signature_script().on((410, 310), Behavior::Panic);
    let orchestrator = orchestrator(models(signature, seal_script(), gate(4, 5)), base_config());

    let report = orchestrator
        .process_batch(
            vec![doc("A", 300, 200), doc("boom", 410, 310), doc("B", 320, 240)],
            &overlap(0.5),
        )
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2);
    let boom = report.entry("boom").unwrap().failure.as_ref().unwrap();
    assert_eq!(boom.kind, ErrorKind::Inference);
    // Not transient, so no retries
    assert_eq!(boom.attempts, 1);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let signature = ScriptedLocator::new("sig-locator").on(
        (300, 200),
        Behavior::FlakyThen(2, vec![located(50.0, 50.0, 150.0, 90.0, 0.95)]),
    );
    let calls = signature.calls();
    let orchestrator = orchestrator(models(signature, seal_script(), gate(4, 5)), base_config());

    let report = orchestrator
        .process_batch(vec![doc("A", 300, 200)], &BatchOptions::default())
        .await
        .unwrap();

    let a = report.entry("A").unwrap().result.as_ref().unwrap();
    assert_eq!(a.count(Category::Signature), 1);
    assert_eq!(a.retries, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_report_model_unavailable_and_open_the_breaker() {
    let signature = ScriptedLocator::new("sig-locator").on((300, 200), Behavior::AlwaysUnavailable);
    let calls = signature.calls();
    let gate = gate(4, 2);
    let orchestrator = orchestrator(models(signature, seal_script(), gate.clone()), base_config());

    let report = orchestrator
        .process_batch(vec![doc("A", 300, 200)], &BatchOptions::default())
        .await
        .unwrap();
    let failure = report.entry("A").unwrap().failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::ModelUnavailable);
    assert_eq!(failure.attempts, 3);
    // The third attempt is refused by the open breaker before reaching the backend
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let open = gate
        .breaker_stats()
        .into_iter()
        .any(|(name, stats)| name == "sig-locator" && stats.trips >= 1);
    assert!(open);

    // Later documents fail fast while the circuit stays open
    let report = orchestrator
        .process_batch(vec![doc("A2", 300, 200)], &BatchOptions::default())
        .await
        .unwrap();
    let failure = report.entry("A2").unwrap().failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::ModelUnavailable);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_work_starts() {
    let signature = signature_script();
    let calls = signature.calls();
    let orchestrator = orchestrator(models(signature, seal_script(), gate(4, 5)), base_config());

    let options = BatchOptions {
        max_concurrency: Some(0),
        ..BatchOptions::default()
    };
    let err = orchestrator
        .submit(vec![doc("A", 300, 200)], &options)
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::InvalidConcurrency(0)));

    let err = orchestrator
        .submit(
            vec![doc("A", 300, 200), doc("A", 320, 240)],
            &BatchOptions::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::DuplicateDocumentId(ref id) if id == "A"));

    let options = BatchOptions {
        max_concurrency: Some(usize::MAX),
        ..BatchOptions::default()
    };
    let err = orchestrator
        .submit(vec![doc("A", 300, 200)], &options)
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::InvalidConcurrency(usize::MAX)));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.store().batch_count(), 0);
}

#[tokio::test]
async fn largest_allowed_concurrency_still_finalizes_the_batch() {
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(4, 5)),
        base_config(),
    );
    let options = BatchOptions {
        max_concurrency: Some(MAX_CONCURRENCY),
        ..BatchOptions::default()
    };
    let report = orchestrator
        .process_batch(vec![doc("A", 300, 200)], &options)
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn out_of_range_locator_scores_never_reach_the_result() {
    let signature = ScriptedLocator::new("sig-locator").on(
        (300, 200),
        Behavior::Boxes(vec![
            located(10.0, 10.0, 100.0, 60.0, 7.5),
            located(150.0, 100.0, 250.0, 150.0, 0.8),
        ]),
    );
    let orchestrator = orchestrator(models(signature, seal_script(), gate(4, 5)), base_config());
    let report = orchestrator
        .process_batch(vec![doc("A", 300, 200)], &BatchOptions::default())
        .await
        .unwrap();

    let a = report.entry("A").unwrap().result.as_ref().unwrap();
    assert_eq!(a.count(Category::Signature), 1);
    for resolved in &a.detections {
        assert!((0.0..=1.0).contains(&resolved.detection.confidence));
    }
}

#[tokio::test]
async fn tiny_candidate_does_not_fail_the_document() {
    let signature = ScriptedLocator::new("sig-locator").on(
        (300, 200),
        Behavior::Boxes(vec![
            located(10.0, 10.0, 120.0, 60.0, 0.9),
            located(200.0, 150.0, 203.0, 153.0, 0.8),
        ]),
    );
    let orchestrator = orchestrator(
        models_with_scorer(
            signature,
            Arc::new(StrokeAuthenticityScorer),
            seal_script(),
            gate(4, 5),
        ),
        base_config(),
    );
    let report = orchestrator
        .process_batch(vec![doc("A", 300, 200)], &BatchOptions::default())
        .await
        .unwrap();

    let a = report.entry("A").unwrap();
    assert_eq!(a.status, DocumentStatus::Succeeded);
    let result = a.result.as_ref().unwrap();
    assert_eq!(result.count(Category::Signature), 2);
    assert!(result.detections.iter().all(|r| matches!(
        r.detection.classification,
        Classification::Signature {
            verdict: AuthenticityVerdict::Indeterminate,
            ..
        }
    )));
}

#[tokio::test]
async fn partially_offscreen_boxes_are_clipped_to_the_page() {
    let signature = ScriptedLocator::new("sig-locator").on(
        (300, 200),
        Behavior::Boxes(vec![located(250.0, 150.0, 400.0, 260.0, 0.9)]),
    );
    let orchestrator = orchestrator(models(signature, seal_script(), gate(4, 5)), base_config());
    let report = orchestrator
        .process_batch(vec![doc("A", 300, 200)], &BatchOptions::default())
        .await
        .unwrap();

    let a = report.entry("A").unwrap().result.as_ref().unwrap();
    let bbox = a.detections[0].original.bbox;
    assert!(bbox.x_max <= 300.5 && bbox.y_max <= 200.5);
}

#[tokio::test]
async fn max_concurrency_bounds_documents_in_flight() {
    let in_flight = Arc::new(InFlight::default());
    let signature = ScriptedLocator::new("sig-locator").on(
        (300, 200),
        Behavior::Tracked(Arc::clone(&in_flight), Duration::from_millis(100)),
    );
    // Pool wide enough that only the batch limit constrains overlap
    let orchestrator = orchestrator(models(signature, seal_script(), gate(8, 5)), base_config());

    let options = BatchOptions {
        max_concurrency: Some(2),
        ..BatchOptions::default()
    };
    let inputs: Vec<_> = (0..6).map(|i| doc(&format!("doc-{}", i), 300, 200)).collect();
    let report = orchestrator.process_batch(inputs, &options).await.unwrap();

    assert_eq!(report.succeeded, 6);
    assert!(in_flight.peak() >= 1);
    assert!(in_flight.peak() <= 2, "peak was {}", in_flight.peak());
}

#[tokio::test]
async fn empty_batch_completes_immediately() {
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(4, 5)),
        base_config(),
    );
    let report = orchestrator
        .process_batch(Vec::new(), &BatchOptions::default())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.total, 0);
    assert!(report.entries.is_empty());
}

#[tokio::test]
async fn stored_documents_resolve_through_the_source() {
    let source = Arc::new(MemoryDocumentSource::new());
    source.insert(docaudit::Document::new("stored-A", blank_png(300, 200)));
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(4, 5)),
        base_config(),
    );

    let inputs = vec![
        DocumentInput::Stored {
            id: "stored-A".to_string(),
            source: source.clone(),
        },
        DocumentInput::Stored {
            id: "missing".to_string(),
            source: source.clone(),
        },
    ];
    let report = orchestrator
        .process_batch(inputs, &BatchOptions::default())
        .await
        .unwrap();

    let found = report.entry("stored-A").unwrap();
    assert_eq!(found.status, DocumentStatus::Succeeded);
    assert_eq!(found.result.as_ref().unwrap().count(Category::Signature), 1);
    assert!(orchestrator.store().get_document("stored-A").is_some());

    let missing = report.entry("missing").unwrap();
    assert_eq!(missing.failure.as_ref().unwrap().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn status_events_follow_the_document_lifecycle() {
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(4, 5)),
        base_config(),
    );
    let handle = orchestrator
        .submit(
            vec![doc("A", 300, 200), garbage("C")],
            &BatchOptions::default(),
        )
        .unwrap();
    let batch_id = handle.batch_id.clone();
    let report = handle.wait().await.unwrap();
    assert!(report.is_complete());

    let events = orchestrator.store().events_since(&batch_id, 0).unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sequences, sorted);

    for id in ["A", "C"] {
        let statuses: Vec<DocumentStatus> = events
            .iter()
            .filter(|e| e.document_id == id)
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses[0], DocumentStatus::Pending);
        assert_eq!(statuses.iter().filter(|s| s.is_terminal()).count(), 1);
        assert!(statuses.last().unwrap().is_terminal());
    }

    let failed: HashSet<_> = events
        .iter()
        .filter_map(|e| e.failure_kind.map(|k| (e.document_id.clone(), k)))
        .collect();
    assert!(failed.contains(&("C".to_string(), ErrorKind::Decode)));

    // Cursor past the end yields nothing new
    let tail = orchestrator
        .store()
        .events_since(&batch_id, events.len() as u64)
        .unwrap();
    assert!(tail.is_empty());
}

#[tokio::test]
async fn concurrency_limit_of_one_still_completes_every_document() {
    let orchestrator = orchestrator(
        models(signature_script(), seal_script(), gate(1, 5)),
        base_config(),
    );
    let options = BatchOptions {
        max_concurrency: Some(1),
        ..BatchOptions::default()
    };
    let inputs: Vec<_> = (0..5).map(|i| doc(&format!("doc-{}", i), 300, 200)).collect();
    let report = orchestrator.process_batch(inputs, &options).await.unwrap();

    assert_eq!(report.succeeded, 5);
    for (i, entry) in report.entries.iter().enumerate() {
        assert_eq!(entry.index, i);
        assert_eq!(entry.document_id, format!("doc-{}", i));
    }
}
