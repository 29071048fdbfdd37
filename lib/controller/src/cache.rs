// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local phase cache.
//!
//! The object-store cache is read-through with asynchronous invalidation: a
//! get or list shortly after a status write may still return the previous
//! phase. Dispatch accounting must not count a just-dispatched AppWrapper
//! twice, nor a just-failed one as still committed, so every successful
//! status write is mirrored here and lists are overlaid with the cached
//! phase when the cache is provably more recent (condition counts only ever
//! grow for a given UID).
//!
//! The cache is strictly additive: a store snapshot that is at least as
//! recent always wins and evicts the entry. To defend against bugs in the
//! cache itself (or out-of-band status edits), a conflict that persists past
//! the conflict timeout evicts the entry on the assumption that we, not the
//! store, are wrong. Entries are removed when the finalizer is removed.
//! Entries for finalizers removed outside the controller are only reclaimed
//! through the conflict path.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::api::{AppWrapper, Phase};

/// Most recently written status, per AppWrapper UID.
#[derive(Clone, Debug)]
struct CachedAppWrapper {
    phase: Phase,
    /// Condition count at the time of the write; monotonically increasing,
    /// hence a reliable recency indicator.
    conditions: usize,
    /// When a disagreement with the store was first observed, if ongoing.
    conflict: Option<Instant>,
}

/// Why a snapshot was refused by [`PhaseCache::check`].
///
/// All variants force a retry of the reconciliation; only a persistent
/// conflict is worth logging loudly.
#[derive(Debug, thiserror::Error)]
pub enum CacheConflict {
    #[error("object store cache is behind recent status writes for {uid}")]
    StaleStore { uid: String },

    #[error("persistent cache conflict for {uid}, dropped cache entry")]
    Persistent { uid: String },

    #[error("phase cache was stale for {uid}, dropped cache entry")]
    StaleCache { uid: String },
}

#[derive(Default)]
pub struct PhaseCache {
    entries: Mutex<HashMap<String, CachedAppWrapper>>,
}

impl PhaseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful status write.
    pub fn record(&self, uid: &str, phase: Phase, conditions: usize) {
        self.entries.lock().insert(
            uid.to_string(),
            CachedAppWrapper {
                phase,
                conditions,
                conflict: None,
            },
        );
    }

    /// Drop the entry for a UID (finalizer removed).
    pub fn remove(&self, uid: &str) {
        self.entries.lock().remove(uid);
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.lock().contains_key(uid)
    }

    /// Phase to use for dispatch accounting: the cached phase when the cache
    /// is provably more recent than the snapshot, the snapshot phase
    /// otherwise. A strictly newer snapshot evicts the entry.
    pub fn effective_phase(&self, app_wrapper: &AppWrapper) -> Phase {
        let mut entries = self.entries.lock();
        let Some(cached) = entries.get(app_wrapper.uid()) else {
            return app_wrapper.phase();
        };
        let (cached_phase, cached_conditions) = (cached.phase, cached.conditions);
        if cached_conditions > app_wrapper.condition_count() {
            return cached_phase;
        }
        if cached_conditions < app_wrapper.condition_count() {
            entries.remove(app_wrapper.uid());
        }
        app_wrapper.phase()
    }

    /// Refuse to act on a snapshot that disagrees with the cache.
    ///
    /// A snapshot behind the cache marks (or ages) a conflict and forces a
    /// retry; past `conflict_timeout` the entry is evicted instead. A
    /// snapshot ahead of the cache, or one with a diverging phase, means our
    /// own entry is stale: evict and force a retry. Matching snapshots clear
    /// any recorded conflict.
    pub fn check(
        &self,
        app_wrapper: &AppWrapper,
        conflict_timeout: Duration,
    ) -> Result<(), CacheConflict> {
        let mut entries = self.entries.lock();
        let uid = app_wrapper.uid();
        let Some(cached) = entries.get(uid) else {
            return Ok(());
        };
        let (cached_phase, cached_conditions, conflict) =
            (cached.phase, cached.conditions, cached.conflict);

        if cached_conditions > app_wrapper.condition_count() {
            let now = Instant::now();
            match conflict {
                Some(since) if now >= since + conflict_timeout => {
                    entries.remove(uid);
                    return Err(CacheConflict::Persistent {
                        uid: uid.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    if let Some(cached) = entries.get_mut(uid) {
                        cached.conflict = Some(now);
                    }
                }
            }
            return Err(CacheConflict::StaleStore {
                uid: uid.to_string(),
            });
        }
        if cached_conditions < app_wrapper.condition_count()
            || cached_phase != app_wrapper.phase()
        {
            entries.remove(uid);
            return Err(CacheConflict::StaleCache {
                uid: uid.to_string(),
            });
        }
        if let Some(cached) = entries.get_mut(uid) {
            cached.conflict = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AppWrapperSpec, AppWrapperStatus};

    fn snapshot(uid: &str, phase: Phase, conditions: usize) -> AppWrapper {
        let mut app_wrapper = AppWrapper::new("job", AppWrapperSpec::default());
        app_wrapper.metadata.uid = Some(uid.to_string());
        app_wrapper.status = Some(AppWrapperStatus {
            phase,
            conditions: (0..conditions)
                .map(|_| crate::api::AppWrapperCondition {
                    last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                        chrono::Utc::now(),
                    ),
                    reason: phase.to_string(),
                })
                .collect(),
            ..Default::default()
        });
        app_wrapper
    }

    #[test]
    fn test_unknown_uid_passes_check() {
        let cache = PhaseCache::new();
        assert!(cache
            .check(&snapshot("u1", Phase::Queued, 1), Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn test_in_sync_passes_check() {
        let cache = PhaseCache::new();
        cache.record("u1", Phase::Queued, 1);
        assert!(cache
            .check(&snapshot("u1", Phase::Queued, 1), Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn test_stale_store_is_refused() {
        let cache = PhaseCache::new();
        cache.record("u1", Phase::Dispatching, 2);
        let err = cache
            .check(&snapshot("u1", Phase::Queued, 1), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CacheConflict::StaleStore { .. }));
        // Entry survives a transient conflict.
        assert!(cache.contains("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_conflict_evicts() {
        let cache = PhaseCache::new();
        cache.record("u1", Phase::Dispatching, 2);
        let stale = snapshot("u1", Phase::Queued, 1);
        let timeout = Duration::from_secs(60);

        assert!(matches!(
            cache.check(&stale, timeout).unwrap_err(),
            CacheConflict::StaleStore { .. }
        ));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            cache.check(&stale, timeout).unwrap_err(),
            CacheConflict::Persistent { .. }
        ));
        assert!(!cache.contains("u1"));
        // With the entry gone the snapshot is accepted as-is.
        assert!(cache.check(&stale, timeout).is_ok());
    }

    #[test]
    fn test_newer_snapshot_evicts_stale_cache() {
        let cache = PhaseCache::new();
        cache.record("u1", Phase::Queued, 1);
        let err = cache
            .check(&snapshot("u1", Phase::Running, 3), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CacheConflict::StaleCache { .. }));
        assert!(!cache.contains("u1"));
    }

    #[test]
    fn test_phase_mismatch_evicts_stale_cache() {
        let cache = PhaseCache::new();
        cache.record("u1", Phase::Queued, 1);
        let err = cache
            .check(&snapshot("u1", Phase::Running, 1), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CacheConflict::StaleCache { .. }));
    }

    #[test]
    fn test_effective_phase_overlay() {
        let cache = PhaseCache::new();
        cache.record("u1", Phase::Dispatching, 2);

        // Stale snapshot: the cached phase wins.
        let stale = snapshot("u1", Phase::Queued, 1);
        assert_eq!(cache.effective_phase(&stale), Phase::Dispatching);
        assert!(cache.contains("u1"));

        // Strictly newer snapshot: trusted and the entry is evicted.
        let newer = snapshot("u1", Phase::Running, 3);
        assert_eq!(cache.effective_phase(&newer), Phase::Running);
        assert!(!cache.contains("u1"));
    }

    #[test]
    fn test_effective_phase_without_entry() {
        let cache = PhaseCache::new();
        let fresh = snapshot("u2", Phase::Queued, 1);
        assert_eq!(cache.effective_phase(&fresh), Phase::Queued);
    }
}
