//! Fingerprint-keyed result cache with request coalescing.
//!
//! The map lock is held only to inspect or swap slots, never across a
//! computation. The first caller for a fingerprint claims the slot and
//! computes; concurrent callers await a broadcast of the same result.
//! Terminal failures are cached like successes; cancelled computations
//! are broadcast to waiters but never stored, so the fingerprint is
//! immediately re-claimable.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::config::CoreConfig;
use crate::document::Fingerprint;

use super::types::{AttemptRecord, DocumentResult, PipelineFailure};

/// How a result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// This caller ran the computation.
    Computed,
    /// Served from a stored result.
    Hit,
    /// Coalesced onto another caller's in-flight computation.
    Joined,
}

impl CacheStatus {
    pub fn from_cache(&self) -> bool {
        matches!(self, Self::Hit | Self::Joined)
    }
}

#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub result: DocumentResult,
    pub status: CacheStatus,
}

enum Slot {
    InFlight(watch::Receiver<Option<DocumentResult>>),
    Ready(ReadyEntry),
}

#[derive(Clone)]
struct ReadyEntry {
    result: DocumentResult,
    stored_at: Instant,
}

pub struct ResultCache {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
    capacity: usize,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.cache_capacity, config.cache_ttl())
    }

    /// Look up `fingerprint`, running `compute` on a miss. Exactly one
    /// caller computes per fingerprint at a time; the rest coalesce.
    /// `force_refresh` skips a stored result but still joins a
    /// computation that is already running.
    pub async fn get_or_compute<F>(
        &self,
        fingerprint: Fingerprint,
        force_refresh: bool,
        compute: F,
    ) -> CacheOutcome
    where
        F: Future<Output = DocumentResult>,
    {
        let claim = self.claim(fingerprint, force_refresh);

        match claim {
            Claim::Ready(result) => CacheOutcome {
                result,
                status: CacheStatus::Hit,
            },
            Claim::Join(rx) => CacheOutcome {
                result: await_broadcast(rx).await,
                status: CacheStatus::Joined,
            },
            Claim::Compute { tx, prior } => {
                let guard = InFlightGuard {
                    cache: self,
                    fingerprint,
                    tx,
                    prior,
                    completed: false,
                };
                // If this future is dropped mid-computation, the guard
                // broadcasts Cancelled and frees the slot.
                let result = compute.await;
                guard.complete(result.clone());
                CacheOutcome {
                    result,
                    status: CacheStatus::Computed,
                }
            }
        }
    }

    /// Number of stored (ready) results.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn claim(&self, fingerprint: Fingerprint, force_refresh: bool) -> Claim {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let prior = match slots.get(&fingerprint) {
            Some(Slot::InFlight(rx)) => return Claim::Join(rx.clone()),
            Some(Slot::Ready(entry)) => {
                let expired = entry.stored_at.elapsed() > self.ttl;
                if !expired && !force_refresh {
                    return Claim::Ready(entry.result.clone());
                }
                // Stale entries are forgotten; a bypassed fresh entry is
                // kept aside in case it outranks the recomputation.
                if expired {
                    None
                } else {
                    Some(entry.clone())
                }
            }
            None => None,
        };

        let (tx, rx) = watch::channel(None);
        slots.insert(fingerprint, Slot::InFlight(rx));
        Claim::Compute { tx, prior }
    }

    fn store(&self, fingerprint: Fingerprint, result: DocumentResult) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(
            fingerprint,
            Slot::Ready(ReadyEntry {
                result,
                stored_at: Instant::now(),
            }),
        );
        self.evict_locked(&mut slots);
    }

    /// Replace our InFlight marker with the entry it displaced, or clear
    /// the slot entirely.
    fn release(&self, fingerprint: Fingerprint, prior: Option<ReadyEntry>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slots.get(&fingerprint), Some(Slot::InFlight(_))) {
            match prior {
                Some(entry) => {
                    slots.insert(fingerprint, Slot::Ready(entry));
                }
                None => {
                    slots.remove(&fingerprint);
                }
            }
        }
    }

    /// Drop the oldest stored results until capacity holds. In-flight
    /// slots are never evicted; their computations are still owed a home.
    fn evict_locked(&self, slots: &mut HashMap<Fingerprint, Slot>) {
        let mut ready: Vec<(Fingerprint, Instant)> = slots
            .iter()
            .filter_map(|(fp, slot)| match slot {
                Slot::Ready(entry) => Some((*fp, entry.stored_at)),
                Slot::InFlight(_) => None,
            })
            .collect();
        if ready.len() <= self.capacity {
            return;
        }
        ready.sort_by_key(|(_, stored_at)| *stored_at);
        for (fp, _) in ready.iter().take(ready.len() - self.capacity) {
            debug!(fingerprint = %fp, "evicting oldest cached result");
            slots.remove(fp);
        }
    }
}

enum Claim {
    Ready(DocumentResult),
    Join(watch::Receiver<Option<DocumentResult>>),
    Compute {
        tx: watch::Sender<Option<DocumentResult>>,
        prior: Option<ReadyEntry>,
    },
}

/// Confidence rank for the store rule: validated beats failed, and among
/// validated records an earlier strategy rung beats a later one. Lower
/// ranks win.
fn rank(result: &DocumentResult) -> (u8, u8) {
    match result {
        DocumentResult::Validated(v) => (0, v.record.provenance.strategy.priority()),
        DocumentResult::Failed { .. } => (1, u8::MAX),
    }
}

async fn await_broadcast(mut rx: watch::Receiver<Option<DocumentResult>>) -> DocumentResult {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a broadcast; treat as cancelled.
            return cancelled_result();
        }
    }
}

fn cancelled_result() -> DocumentResult {
    DocumentResult::Failed {
        failure: PipelineFailure::Cancelled,
        attempts: Vec::<AttemptRecord>::new(),
    }
}

/// Marks one in-flight computation. Completion stores and broadcasts the
/// result; dropping without completing (cancellation, panic) frees the
/// slot and broadcasts Cancelled so waiters never hang.
struct InFlightGuard<'a> {
    cache: &'a ResultCache,
    fingerprint: Fingerprint,
    tx: watch::Sender<Option<DocumentResult>>,
    prior: Option<ReadyEntry>,
    completed: bool,
}

impl InFlightGuard<'_> {
    fn complete(mut self, result: DocumentResult) {
        self.completed = true;
        let cancelled = matches!(
            result,
            DocumentResult::Failed {
                failure: PipelineFailure::Cancelled,
                ..
            }
        );
        let prior = self.prior.take();
        if cancelled {
            self.cache.release(self.fingerprint, prior);
        } else {
            // A displaced entry that outranks the recomputation stays;
            // the cache keeps the highest-confidence success seen.
            match prior {
                Some(entry) if rank(&entry.result) < rank(&result) => {
                    self.cache.release(self.fingerprint, Some(entry));
                }
                _ => self.cache.store(self.fingerprint, result.clone()),
            }
        }
        let _ = self.tx.send(Some(result));
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.cache.release(self.fingerprint, self.prior.take());
        let _ = self.tx.send(Some(cancelled_result()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Fingerprint;
    use crate::pipeline::strategy::StrategyKind;
    use crate::pipeline::types::{CandidateRecord, Provenance, ValidatedRecord, ValidationReport};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn validated_at(strategy: StrategyKind) -> DocumentResult {
        DocumentResult::Validated(ValidatedRecord {
            record: CandidateRecord {
                fields: BTreeMap::new(),
                provenance: Provenance {
                    strategy,
                    attempt: 1,
                    extracted_at: chrono::Utc::now(),
                },
            },
            report: ValidationReport::default(),
            attempts: vec![],
        })
    }

    fn validated() -> DocumentResult {
        validated_at(StrategyKind::Standard)
    }

    fn stored_strategy(result: &DocumentResult) -> StrategyKind {
        match result {
            DocumentResult::Validated(v) => v.record.provenance.strategy,
            other => panic!("expected a validated result, got {other:?}"),
        }
    }

    fn exhausted() -> DocumentResult {
        DocumentResult::Failed {
            failure: PipelineFailure::RetriesExhausted {
                attempts: 3,
                cause: crate::pipeline::types::FailureCause::Inference {
                    error: crate::backend::InferenceError::BackendUnavailable("down".into()),
                },
            },
            attempts: vec![],
        }
    }

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::of_bytes(&[n])
    }

    #[tokio::test]
    async fn second_call_hits() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        let computed = Arc::new(AtomicUsize::new(0));

        for expected in [CacheStatus::Computed, CacheStatus::Hit] {
            let computed = computed.clone();
            let outcome = cache
                .get_or_compute(fp(1), false, async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    validated()
                })
                .await;
            assert_eq!(outcome.status, expected);
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_recomputes() {
        let cache = ResultCache::new(8, Duration::from_millis(5));
        cache.get_or_compute(fp(1), false, async { validated() }).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let outcome = cache.get_or_compute(fp(1), false, async { validated() }).await;
        assert_eq!(outcome.status, CacheStatus::Computed);
    }

    #[tokio::test]
    async fn force_refresh_recomputes_and_overwrites() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        cache.get_or_compute(fp(1), false, async { exhausted() }).await;

        let outcome = cache.get_or_compute(fp(1), true, async { validated() }).await;
        assert_eq!(outcome.status, CacheStatus::Computed);

        let outcome = cache.get_or_compute(fp(1), false, async { validated() }).await;
        assert_eq!(outcome.status, CacheStatus::Hit);
        assert!(outcome.result.is_validated(), "refresh result replaced the failure");
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce() {
        let cache = Arc::new(ResultCache::new(8, Duration::from_secs(60)));
        let computed = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let computed = computed.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute(fp(1), false, async move {
                        computed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        validated()
                    })
                    .await
            }));
        }

        let mut statuses = Vec::new();
        for task in tasks {
            let outcome = task.await.unwrap();
            assert!(outcome.result.is_validated());
            statuses.push(outcome.status);
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1, "exactly one computation runs");
        assert_eq!(
            statuses.iter().filter(|s| **s == CacheStatus::Computed).count(),
            1
        );
        assert_eq!(
            statuses.iter().filter(|s| **s == CacheStatus::Joined).count(),
            3
        );
    }

    #[tokio::test]
    async fn later_tier_refresh_never_replaces_earlier_tier_success() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        cache
            .get_or_compute(fp(1), false, async {
                validated_at(StrategyKind::Standard)
            })
            .await;

        // The refresh caller gets its freshly computed record...
        let refreshed = cache
            .get_or_compute(fp(1), true, async {
                validated_at(StrategyKind::ReducedSchema)
            })
            .await;
        assert_eq!(refreshed.status, CacheStatus::Computed);
        assert_eq!(stored_strategy(&refreshed.result), StrategyKind::ReducedSchema);

        // ...but the cache keeps the higher-confidence one.
        let hit = cache.get_or_compute(fp(1), false, async { validated() }).await;
        assert_eq!(hit.status, CacheStatus::Hit);
        assert_eq!(stored_strategy(&hit.result), StrategyKind::Standard);
    }

    #[tokio::test]
    async fn failed_refresh_never_clobbers_a_success() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        cache.get_or_compute(fp(1), false, async { validated() }).await;
        cache.get_or_compute(fp(1), true, async { exhausted() }).await;

        let hit = cache.get_or_compute(fp(1), false, async { exhausted() }).await;
        assert_eq!(hit.status, CacheStatus::Hit);
        assert!(hit.result.is_validated());
    }

    #[tokio::test]
    async fn terminal_failures_are_cached() {
        let cache = ResultCache::new(8, Duration::from_secs(60));
        cache.get_or_compute(fp(1), false, async { exhausted() }).await;
        let outcome = cache.get_or_compute(fp(1), false, async { validated() }).await;
        assert_eq!(outcome.status, CacheStatus::Hit);
        assert!(!outcome.result.is_validated());
    }

    #[tokio::test]
    async fn dropped_computation_frees_the_slot() {
        let cache = Arc::new(ResultCache::new(8, Duration::from_secs(60)));

        // Waiter joins while the computation hangs.
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                cache
                    .get_or_compute(fp(1), false, async { validated() })
                    .await
            })
        };

        // Computation that never finishes, abandoned after 20ms.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            cache.get_or_compute(fp(1), false, std::future::pending::<DocumentResult>()),
        )
        .await;
        assert!(abandoned.is_err(), "computation should have been dropped");

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.status, CacheStatus::Joined);
        assert!(matches!(
            outcome.result,
            DocumentResult::Failed {
                failure: PipelineFailure::Cancelled,
                ..
            }
        ));

        // The fingerprint is immediately re-claimable and computes fresh.
        let fresh = cache.get_or_compute(fp(1), false, async { validated() }).await;
        assert_eq!(fresh.status, CacheStatus::Computed);
        assert!(fresh.result.is_validated());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let cache = ResultCache::new(2, Duration::from_secs(60));
        for n in 1..=3u8 {
            cache.get_or_compute(fp(n), false, async { validated() }).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(cache.len(), 2);

        // Oldest entry is gone; newest two still hit.
        let oldest = cache.get_or_compute(fp(1), false, async { validated() }).await;
        assert_eq!(oldest.status, CacheStatus::Computed);
        let newest = cache.get_or_compute(fp(3), false, async { validated() }).await;
        assert_eq!(newest.status, CacheStatus::Hit);
    }
}
