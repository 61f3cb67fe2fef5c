//! End-to-end pipeline scenarios against a scripted backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ledgerlens::backend::ScriptedBackend;
use ledgerlens::pipeline::{
    cancel_pair, CancelSignal, CandidateRecord, DocumentResult, FieldValue, PipelineCoordinator,
    PipelineFailure, Provenance, ResultCache, StrategyKind, ValidatedRecord, ValidationReport,
    Validator, ViolationKind,
};
use ledgerlens::{CoreConfig, Document, ExtractionRequest, SchemaRegistry, SchemaVersion, StatementType};

const GOOD: &str =
    r#"{"total_assets": 1000.0, "total_liabilities": 600.0, "total_equity": 400.0}"#;

fn config() -> CoreConfig {
    CoreConfig {
        backoff_base_ms: 1,
        backoff_cap_ms: 2,
        inference_timeout_secs: 5,
        ..Default::default()
    }
}

fn coordinator(backend: Arc<ScriptedBackend>) -> PipelineCoordinator {
    PipelineCoordinator::new(backend, Arc::new(SchemaRegistry::builtin()), &config())
        .expect("valid config")
}

fn request(text: &str) -> ExtractionRequest {
    ExtractionRequest::new(
        Arc::new(Document::from_text(text)),
        StatementType::BalanceSheet,
        SchemaVersion(1),
    )
}

fn record(assets: f64, liabilities: f64, equity: f64) -> CandidateRecord {
    let mut fields = BTreeMap::new();
    fields.insert("total_assets".to_string(), FieldValue::Number(assets));
    fields.insert("total_liabilities".to_string(), FieldValue::Number(liabilities));
    fields.insert("total_equity".to_string(), FieldValue::Number(equity));
    CandidateRecord {
        fields,
        provenance: Provenance {
            strategy: StrategyKind::Standard,
            attempt: 1,
            extracted_at: chrono::Utc::now(),
        },
    }
}

fn validated_result() -> DocumentResult {
    DocumentResult::Validated(ValidatedRecord {
        record: record(1000.0, 600.0, 400.0),
        report: ValidationReport::default(),
        attempts: vec![],
    })
}

#[test]
fn validation_is_deterministic() {
    let registry = SchemaRegistry::builtin();
    let schema = registry
        .get(&StatementType::BalanceSheet, SchemaVersion(1))
        .expect("builtin schema");
    let validator = Validator::new(0.005, 0.01);

    let (_, first) = validator.validate(record(1000.0, 600.0, 350.0), &schema);
    let (_, second) = validator.validate(record(1000.0, 600.0, 350.0), &schema);

    let first_json = serde_json::to_value(&first).expect("serialize");
    let second_json = serde_json::to_value(&second).expect("serialize");
    assert_eq!(first_json, second_json, "same input must yield the same report");
}

#[tokio::test]
async fn concurrent_duplicates_run_one_extraction() {
    let backend = Arc::new(ScriptedBackend::always(GOOD));
    let coordinator = coordinator(backend.clone());

    let document = Arc::new(Document::from_text("Total assets: 1,000"));
    let requests: Vec<_> = (0..8)
        .map(|_| {
            ExtractionRequest::new(
                document.clone(),
                StatementType::BalanceSheet,
                SchemaVersion(1),
            )
        })
        .collect();

    let report = coordinator.run_batch(requests, &CancelSignal::none()).await;
    assert_eq!(report.metrics.validated, 8);
    assert_eq!(backend.calls(), 1, "duplicates must coalesce onto one execution");
}

#[tokio::test]
async fn attempts_never_exceed_the_configured_cap() {
    let backend = Arc::new(ScriptedBackend::always("never json"));
    let coordinator = coordinator(backend.clone());

    let report = coordinator
        .run_batch(vec![request("doc")], &CancelSignal::none())
        .await;
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.result.attempts().len(), 3);
    assert_eq!(backend.calls(), 3);
    match &outcome.result {
        DocumentResult::Failed { failure, .. } => {
            assert!(matches!(
                failure,
                PipelineFailure::RetriesExhausted { attempts: 3, .. }
            ));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[test]
fn arithmetic_tolerance_boundary() {
    let registry = SchemaRegistry::builtin();
    let schema = registry
        .get(&StatementType::BalanceSheet, SchemaVersion(1))
        .expect("builtin schema");
    let validator = Validator::new(0.005, 0.01);

    // 100.00 = 60.00 + 40.003 is within 0.5% of the total.
    let (_, report) = validator.validate(record(100.0, 60.0, 40.003), &schema);
    assert!(report.passed(), "violations: {:?}", report.violations);

    // 60.00 + 45.00 overshoots by 5.00 against a 0.50 tolerance.
    let (_, report) = validator.validate(record(100.0, 60.0, 45.0), &schema);
    let violation = report
        .violations
        .first()
        .expect("an arithmetic violation");
    assert_eq!(violation.subject, "balance_equation");
    assert!(matches!(
        violation.kind,
        ViolationKind::ArithmeticInconsistency { .. }
    ));
}

#[tokio::test]
async fn eviction_never_drops_awaited_entries() {
    // Capacity of one, with an in-flight computation and churn around it.
    let cache = Arc::new(ResultCache::new(1, Duration::from_secs(60)));
    let fp = |n: u8| ledgerlens::Fingerprint::of_bytes(&[n]);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let computer = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(fp(1), false, async move {
                    let _ = release_rx.await;
                    validated_result()
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute(fp(1), false, async { validated_result() })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Churn several ready entries through the full cache.
    for n in 2..=5u8 {
        cache.get_or_compute(fp(n), false, async { validated_result() }).await;
    }

    let _ = release_tx.send(());
    let computed = tokio::time::timeout(Duration::from_secs(1), computer)
        .await
        .expect("computer finished")
        .expect("no panic");
    let joined = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter finished")
        .expect("no panic");

    assert!(computed.result.is_validated());
    assert!(joined.result.is_validated(), "waiter must see the result, not an evicted hole");
}

#[tokio::test]
async fn malformed_then_valid_succeeds_with_two_attempts() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .then_respond("I am unable to produce JSON")
            .then_respond(GOOD),
    );
    let coordinator = coordinator(backend.clone());
    let document = Arc::new(Document::from_text("Total assets: 1,000"));
    let make_request = || {
        ExtractionRequest::new(
            document.clone(),
            StatementType::BalanceSheet,
            SchemaVersion(1),
        )
    };

    let report = coordinator
        .run_batch(vec![make_request()], &CancelSignal::none())
        .await;
    let outcome = &report.outcomes[0];
    assert!(outcome.result.is_validated());
    assert_eq!(outcome.result.attempts().len(), 2);

    // The validated record is cached under the request fingerprint.
    let report = coordinator
        .run_batch(vec![make_request()], &CancelSignal::none())
        .await;
    assert!(report.outcomes[0].cache.from_cache());
    assert_eq!(backend.calls(), 2, "cached result must not re-run inference");
}

#[tokio::test]
async fn three_outages_exhaust_three_attempts() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .then_fail(ledgerlens::backend::InferenceError::BackendUnavailable("down".into()))
            .then_fail(ledgerlens::backend::InferenceError::BackendUnavailable("down".into()))
            .then_fail(ledgerlens::backend::InferenceError::BackendUnavailable("down".into()))
            .finally(GOOD),
    );
    let coordinator = coordinator(backend.clone());

    let report = coordinator
        .run_batch(vec![request("doc")], &CancelSignal::none())
        .await;
    let outcome = &report.outcomes[0];
    match &outcome.result {
        DocumentResult::Failed { failure, attempts } => {
            assert!(matches!(
                failure,
                PipelineFailure::RetriesExhausted { attempts: 3, .. }
            ));
            assert_eq!(attempts.len(), 3);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn cancelled_batch_leaves_no_stuck_fingerprints() {
    let backend = Arc::new(ScriptedBackend::new().then_hang().finally(GOOD));
    let coordinator = Arc::new(coordinator(backend));
    let (handle, signal) = cancel_pair();

    let document = Arc::new(Document::from_text("Total assets: 1,000"));
    let cancelled_request =
        ExtractionRequest::new(document.clone(), StatementType::BalanceSheet, SchemaVersion(1));

    let batch = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run_batch(vec![cancelled_request], &signal).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), batch)
        .await
        .expect("batch drained promptly")
        .expect("no panic");
    assert_eq!(report.metrics.cancelled, 1);

    // Same fingerprint, fresh batch: must compute, not hang or reuse.
    let retry_request =
        ExtractionRequest::new(document, StatementType::BalanceSheet, SchemaVersion(1));
    let report = tokio::time::timeout(
        Duration::from_secs(2),
        coordinator.run_batch(vec![retry_request], &CancelSignal::none()),
    )
    .await
    .expect("fresh batch proceeded");
    assert_eq!(report.metrics.validated, 1);
    assert!(!report.outcomes[0].cache.from_cache());
}
