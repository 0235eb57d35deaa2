// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-registration verdict cache with single-flight refresh.
//!
//! Each registration owns a slot: the last entry plus a flight lock. Whoever takes the
//! flight lock runs the pipeline inside a spawned task that keeps holding the lock,
//! so a caller that goes away never cancels a verification other callers wait on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use gate_types::{Baseline, VerificationResult};
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, error};

use crate::orchestrator::{failed_result, Pipeline};
use crate::GateError;

const INTERNAL_ERROR: &str = "internal verification error";

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: VerificationResult,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    created_at: Instant,
    deadline: Instant,
}

impl CacheEntry {
    fn new(result: VerificationResult, ttl: Duration) -> Self {
        let created_at = Instant::now();
        let cached_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| cached_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            result,
            cached_at,
            expires_at,
            created_at,
            deadline: created_at.checked_add(ttl).unwrap_or(created_at),
        }
    }

    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub ttl_seconds: u64,
}

#[derive(Default)]
struct Slot {
    entry: Mutex<Option<CacheEntry>>,
    flight: Arc<tokio::sync::Mutex<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Slot {
    fn current(&self) -> Option<CacheEntry> {
        lock(&self.entry).clone()
    }

    fn fresh(&self) -> Option<CacheEntry> {
        self.current().filter(CacheEntry::is_fresh)
    }

    fn replace(&self, entry: CacheEntry) -> CacheEntry {
        *lock(&self.entry) = Some(entry.clone());
        entry
    }

    fn clear(&self) {
        lock(&self.entry).take();
    }
}

pub struct AttestationCache {
    ttl: Duration,
    pipeline: Arc<dyn Pipeline>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl AttestationCache {
    pub fn new(pipeline: Arc<dyn Pipeline>, ttl: Duration) -> Self {
        Self {
            ttl,
            pipeline,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, registration_id: &str) -> Arc<Slot> {
        lock(&self.slots)
            .entry(registration_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, registration_id: &str) -> Option<Arc<Slot>> {
        lock(&self.slots).get(registration_id).cloned()
    }

    /// Run `task` on a spawned task that owns the slot's flight lock.
    async fn exclusive<T, F, Fut>(&self, slot: Arc<Slot>, task: F) -> Result<T, JoinError>
    where
        F: FnOnce(Arc<dyn Pipeline>, Arc<Slot>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = slot.flight.clone().lock_owned().await;
        let fut = task(self.pipeline.clone(), slot);
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
        .await
    }

    fn internal_failure(&self, registration_id: &str, err: JoinError) -> CacheEntry {
        error!(registration = registration_id, "verification task failed: {err}");
        CacheEntry::new(
            failed_result(registration_id, INTERNAL_ERROR.into(), Instant::now()),
            self.ttl,
        )
    }

    /// Fresh entry only.
    pub fn get(&self, registration_id: &str) -> Option<CacheEntry> {
        self.existing_slot(registration_id)?.fresh()
    }

    /// Fresh entry, or the outcome of exactly one verification shared by every
    /// concurrent caller.
    pub async fn get_or_verify(&self, registration_id: &str) -> CacheEntry {
        let slot = self.slot(registration_id);
        if let Some(entry) = slot.fresh() {
            debug!(registration = registration_id, "attestation cache hit");
            return entry;
        }
        let requested_at = Instant::now();
        let ttl = self.ttl;
        let id = registration_id.to_string();
        self.exclusive(slot, move |pipeline, slot| async move {
            if let Some(entry) = slot
                .current()
                .filter(|e| e.is_fresh() || e.created_at >= requested_at)
            {
                return entry;
            }
            let result = pipeline.verify(&id, None).await;
            slot.replace(CacheEntry::new(result, ttl))
        })
        .await
        .unwrap_or_else(|err| self.internal_failure(registration_id, err))
    }

    /// Verify regardless of freshness and replace the cached verdict.
    pub async fn verify_now(
        &self,
        registration_id: &str,
        quote_override: Option<String>,
    ) -> VerificationResult {
        let ttl = self.ttl;
        let id = registration_id.to_string();
        let slot = self.slot(registration_id);
        self.exclusive(slot, move |pipeline, slot| async move {
            let result = pipeline.verify(&id, quote_override).await;
            slot.replace(CacheEntry::new(result, ttl))
        })
        .await
        .unwrap_or_else(|err| self.internal_failure(registration_id, err))
        .result
    }

    /// Baseline capture serialised with verifications of the same registration.
    pub async fn capture_baseline(
        &self,
        registration_id: &str,
        force: bool,
    ) -> Result<(Baseline, DateTime<Utc>), GateError> {
        let id = registration_id.to_string();
        let slot = self.slot(registration_id);
        self.exclusive(slot, move |pipeline, slot| async move {
            let captured = pipeline.capture_baseline(&id, force).await;
            if captured.is_ok() {
                slot.clear();
            }
            captured
        })
        .await
        .map_err(|err| GateError::Other(anyhow!("baseline capture task failed: {err}")))?
    }

    pub fn invalidate(&self, registration_id: &str) -> bool {
        match self.existing_slot(registration_id) {
            Some(slot) => lock(&slot.entry).take().is_some(),
            None => false,
        }
    }

    pub fn clear(&self) {
        for slot in lock(&self.slots).values() {
            slot.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let slots = lock(&self.slots);
        let mut stats = CacheStats {
            total_entries: 0,
            valid_entries: 0,
            expired_entries: 0,
            ttl_seconds: self.ttl.as_secs(),
        };
        for entry in slots.values().filter_map(|slot| slot.current()) {
            stats.total_entries += 1;
            if entry.is_fresh() {
                stats.valid_entries += 1;
            } else {
                stats.expired_entries += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gate_types::{DcapResult, GithubResult, MeasurementResult, VerificationStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        verifications: AtomicUsize,
        delay: Duration,
        panic: bool,
        capture_delay: Duration,
        events: Mutex<Vec<&'static str>>,
    }

    impl Counting {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                verifications: AtomicUsize::new(0),
                delay,
                panic: false,
                capture_delay: Duration::ZERO,
                events: Mutex::new(Vec::new()),
            })
        }

        fn event(&self, name: &'static str) {
            lock(&self.events).push(name);
        }

        fn count(&self) -> usize {
            self.verifications.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Pipeline for Counting {
        async fn verify(&self, id: &str, _quote: Option<String>) -> VerificationResult {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            self.event("verify-start");
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("boom");
            }
            self.event("verify-end");
            VerificationResult {
                id: format!("v{}", self.count()),
                registration_id: id.into(),
                status: VerificationStatus::Success,
                dcap: DcapResult {
                    verified: true,
                    status: "OK".into(),
                    tcb_status: None,
                    collateral_expiry: None,
                    mock: false,
                    error: None,
                },
                github: GithubResult {
                    verified: true,
                    ..Default::default()
                },
                measurements: MeasurementResult {
                    verified: true,
                    ..Default::default()
                },
                duration_ms: 0,
                verified_at: Utc::now(),
                quote_method: None,
                error: None,
            }
        }

        async fn capture_baseline(
            &self,
            _id: &str,
            _force: bool,
        ) -> Result<(Baseline, DateTime<Utc>), GateError> {
            self.event("capture-start");
            tokio::time::sleep(self.capture_delay).await;
            self.event("capture-end");
            Ok((
                Baseline {
                    mrtd: "aa".into(),
                    rtmr0: "bb".into(),
                    rtmr1: "cc".into(),
                    rtmr2: "dd".into(),
                    rtmr3: "ee".into(),
                },
                Utc::now(),
            ))
        }
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_verification() {
        let pipeline = Counting::new(Duration::from_millis(100));
        let cache = Arc::new(AttestationCache::new(pipeline.clone(), Duration::from_secs(60)));

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_verify("app").await })
            })
            .collect();
        let mut ids = Vec::new();
        for call in calls {
            ids.push(call.await.unwrap().result.id);
        }
        assert_eq!(pipeline.count(), 1);
        assert!(ids.iter().all(|id| id == &ids[0]));

        cache.get_or_verify("app").await;
        assert_eq!(pipeline.count(), 1);
        cache.get_or_verify("other").await;
        assert_eq!(pipeline.count(), 2);
    }

    #[tokio::test]
    async fn expiry_triggers_exactly_one_new_verification() {
        let pipeline = Counting::new(Duration::ZERO);
        let cache = AttestationCache::new(pipeline.clone(), Duration::from_millis(50));
        cache.get_or_verify("app").await;
        assert!(cache.get("app").is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("app").is_none());
        assert_eq!(
            cache.stats(),
            CacheStats {
                total_entries: 1,
                valid_entries: 0,
                expired_entries: 1,
                ttl_seconds: 0,
            }
        );

        let (a, b) = tokio::join!(cache.get_or_verify("app"), cache.get_or_verify("app"));
        assert_eq!(a.result.id, b.result.id);
        assert_eq!(pipeline.count(), 2);
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_cancel_verification() {
        let pipeline = Counting::new(Duration::from_millis(100));
        let cache = Arc::new(AttestationCache::new(pipeline.clone(), Duration::from_secs(60)));
        let caller = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_verify("app").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        let entry = cache.get_or_verify("app").await;
        assert!(entry.result.is_success());
        assert_eq!(pipeline.count(), 1);
    }

    #[tokio::test]
    async fn panicking_pipeline_fails_closed_without_caching() {
        let pipeline = Arc::new(Counting {
            verifications: AtomicUsize::new(0),
            delay: Duration::ZERO,
            panic: true,
            capture_delay: Duration::ZERO,
            events: Mutex::new(Vec::new()),
        });
        let cache = AttestationCache::new(pipeline.clone(), Duration::from_secs(60));
        let entry = cache.get_or_verify("app").await;
        assert_eq!(entry.result.status, VerificationStatus::Failed);
        assert_eq!(entry.result.error.as_deref(), Some(INTERNAL_ERROR));
        assert!(cache.get("app").is_none());
    }

    #[tokio::test]
    async fn admin_operations() {
        let pipeline = Counting::new(Duration::ZERO);
        let cache = AttestationCache::new(pipeline.clone(), Duration::from_secs(60));
        cache.get_or_verify("a").await;
        cache.get_or_verify("b").await;
        assert_eq!(cache.stats().valid_entries, 2);

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert!(!cache.invalidate("never-seen"));

        let fresh = cache.verify_now("b", None).await;
        assert_eq!(cache.get("b").unwrap().result.id, fresh.id);
        assert_eq!(pipeline.count(), 3);

        cache.capture_baseline("b", true).await.unwrap();
        assert!(cache.get("b").is_none());

        cache.get_or_verify("a").await;
        cache.clear();
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[tokio::test]
    async fn baseline_capture_excludes_concurrent_verification() {
        let pipeline = Arc::new(Counting {
            verifications: AtomicUsize::new(0),
            delay: Duration::ZERO,
            panic: false,
            capture_delay: Duration::from_millis(150),
            events: Mutex::new(Vec::new()),
        });
        let cache = Arc::new(AttestationCache::new(pipeline.clone(), Duration::from_secs(60)));
        let capture = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.capture_baseline("app", false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = cache.get_or_verify("app").await;
        let (_, captured_at) = capture.await.unwrap().unwrap();
        assert_eq!(
            *lock(&pipeline.events),
            ["capture-start", "capture-end", "verify-start", "verify-end"]
        );
        assert!(entry.result.verified_at >= captured_at);
        assert_eq!(pipeline.count(), 1);
    }
}
