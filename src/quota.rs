//! Cached storage and bandwidth counters.
//!
//! `check` compares a cached counter with the plan limit; `apply`/`record`
//! adjust it without blocking the caller on failure. Two concurrent uploads
//! can both pass `check` against the same stale value: reconcile is the only
//! authoritative correction, and owners whose counters are known to have
//! drifted are queued for it via [`QuotaLedger::mark_dirty`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::CounterCache;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventType};
use crate::metrics;
use crate::plans::PlanDirectory;
use crate::storage::MetadataStore;

/// Fraction of the storage limit at which a quota-warning is published.
const WARNING_RATIO: f64 = 0.9;
const BANDWIDTH_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub owner_id: String,
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthState {
    pub owner_id: String,
    pub period: String,
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

fn clamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ============================================================================
// Storage quota
// ============================================================================

pub struct QuotaLedger {
    cache: Arc<dyn CounterCache>,
    metadata: Arc<dyn MetadataStore>,
    plans: Arc<dyn PlanDirectory>,
    events: Arc<EventBus>,
    dirty: Mutex<BTreeSet<String>>,
}

impl QuotaLedger {
    pub fn new(
        cache: Arc<dyn CounterCache>,
        metadata: Arc<dyn MetadataStore>,
        plans: Arc<dyn PlanDirectory>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            cache,
            metadata,
            plans,
            events,
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    fn key(owner_id: &str) -> String {
        format!("quota:{owner_id}")
    }

    /// Cached usage; a missing counter is rebuilt from the records, and an
    /// unreachable cache falls back to summing them without caching.
    pub async fn used(&self, owner_id: &str) -> Result<u64> {
        match self.cache.get(&Self::key(owner_id)).await {
            Ok(Some(value)) => Ok(clamp(value)),
            Ok(None) => self.reconcile(owner_id).await,
            Err(e) => {
                warn!(owner_id, error = %e, "Quota cache unavailable, summing records");
                self.mark_dirty(owner_id);
                self.true_usage(owner_id).await
            }
        }
    }

    pub async fn state(&self, owner_id: &str) -> Result<QuotaState> {
        let plan = self.plans.plan_for(owner_id).await?;
        Ok(QuotaState {
            owner_id: owner_id.to_string(),
            used_bytes: self.used(owner_id).await?,
            limit_bytes: plan.storage_limit_bytes,
        })
    }

    /// Deny when `used + requested` would pass the plan limit.
    pub async fn check(
        &self,
        owner_id: &str,
        requested: u64,
        request_id: Option<&str>,
    ) -> Result<QuotaState> {
        let state = self.state(owner_id).await?;
        if state.used_bytes.saturating_add(requested) > state.limit_bytes {
            info!(
                owner_id,
                used = state.used_bytes,
                limit = state.limit_bytes,
                requested,
                "Storage quota exceeded"
            );
            self.events
                .publish(
                    EventType::QuotaExceeded,
                    serde_json::json!({
                        "ownerId": owner_id,
                        "used": state.used_bytes,
                        "limit": state.limit_bytes,
                        "requested": requested,
                    }),
                    request_id,
                )
                .await;
            return Err(Error::QuotaExceeded {
                used: state.used_bytes,
                limit: state.limit_bytes,
                requested,
            });
        }
        Ok(state)
    }

    /// Adjust the cached counter by `delta`. Failures are logged, counted
    /// and leave the owner queued for reconciliation.
    pub async fn apply(&self, owner_id: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        let key = Self::key(owner_id);

        // Only adjust counters that exist; a missing one is rebuilt in full
        // on next read, which already includes this change.
        let result = match self.cache.get(&key).await {
            Ok(Some(_)) => self.cache.incr(&key, delta, None).await.map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        match result {
            Ok(Some(after)) => {
                debug!(owner_id, delta, used = after, "Quota adjusted");
                if delta > 0 {
                    self.maybe_warn(owner_id, after - delta, after).await;
                }
            }
            Ok(None) => debug!(owner_id, delta, "No cached quota counter, skipping adjustment"),
            Err(e) => {
                warn!(owner_id, delta, error = %e, "Quota adjustment failed");
                metrics::record_best_effort_failure("quota_apply");
                self.mark_dirty(owner_id);
            }
        }
    }

    async fn maybe_warn(&self, owner_id: &str, before: i64, after: i64) {
        let limit = match self.plans.plan_for(owner_id).await {
            Ok(plan) => plan.storage_limit_bytes,
            Err(e) => {
                warn!(owner_id, error = %e, "Could not resolve plan for quota warning");
                return;
            }
        };
        let threshold = (limit as f64 * WARNING_RATIO) as u64;
        if clamp(before) < threshold && clamp(after) >= threshold {
            self.events
                .publish(
                    EventType::QuotaWarning,
                    serde_json::json!({
                        "ownerId": owner_id,
                        "used": clamp(after),
                        "limit": limit,
                    }),
                    None,
                )
                .await;
        }
    }

    async fn true_usage(&self, owner_id: &str) -> Result<u64> {
        let files = self.metadata.list_by_owner(owner_id).await?;
        Ok(files
            .iter()
            .filter(|f| !f.is_deleted)
            .map(|f| f.logical_size)
            .sum())
    }

    /// Recompute usage from the records and overwrite the cached counter.
    pub async fn reconcile(&self, owner_id: &str) -> Result<u64> {
        let used = self.true_usage(owner_id).await?;
        self.cache.set(&Self::key(owner_id), signed(used), None).await?;
        self.clear_dirty(owner_id);
        debug!(owner_id, used, "Quota reconciled");
        Ok(used)
    }

    pub fn mark_dirty(&self, owner_id: &str) {
        match self.dirty.lock() {
            Ok(mut dirty) => {
                dirty.insert(owner_id.to_string());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(owner_id.to_string());
            }
        }
    }

    fn clear_dirty(&self, owner_id: &str) {
        match self.dirty.lock() {
            Ok(mut dirty) => {
                dirty.remove(owner_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(owner_id);
            }
        }
    }

    /// Owners currently queued for reconciliation.
    pub fn dirty_owners(&self) -> Vec<String> {
        match self.dirty.lock() {
            Ok(dirty) => dirty.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

// ============================================================================
// Bandwidth
// ============================================================================

/// Calendar-month bucket, e.g. `2026-10`.
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

pub struct BandwidthLedger {
    cache: Arc<dyn CounterCache>,
    plans: Arc<dyn PlanDirectory>,
    events: Arc<EventBus>,
}

impl BandwidthLedger {
    pub fn new(
        cache: Arc<dyn CounterCache>,
        plans: Arc<dyn PlanDirectory>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            cache,
            plans,
            events,
        }
    }

    fn key(owner_id: &str, period: &str) -> String {
        format!("bandwidth:{owner_id}:{period}")
    }

    pub async fn usage(&self, owner_id: &str) -> Result<BandwidthState> {
        let plan = self.plans.plan_for(owner_id).await?;
        let period = period_key(Utc::now());
        let used = match self.cache.get(&Self::key(owner_id, &period)).await {
            Ok(value) => clamp(value.unwrap_or(0)),
            Err(e) => {
                warn!(owner_id, error = %e, "Bandwidth cache unavailable, assuming no usage");
                0
            }
        };
        Ok(BandwidthState {
            owner_id: owner_id.to_string(),
            period,
            used_bytes: used,
            limit_bytes: plan.bandwidth_limit_bytes,
        })
    }

    pub async fn check(
        &self,
        owner_id: &str,
        requested: u64,
        request_id: Option<&str>,
    ) -> Result<BandwidthState> {
        let state = self.usage(owner_id).await?;
        if state.used_bytes.saturating_add(requested) > state.limit_bytes {
            info!(
                owner_id,
                used = state.used_bytes,
                limit = state.limit_bytes,
                requested,
                "Bandwidth exceeded"
            );
            self.events
                .publish(
                    EventType::BandwidthExceeded,
                    serde_json::json!({
                        "ownerId": owner_id,
                        "period": state.period,
                        "used": state.used_bytes,
                        "limit": state.limit_bytes,
                        "requested": requested,
                    }),
                    request_id,
                )
                .await;
            return Err(Error::BandwidthExceeded {
                used: state.used_bytes,
                limit: state.limit_bytes,
                requested,
            });
        }
        Ok(state)
    }

    /// Count transferred bytes against the current month.
    pub async fn record(&self, owner_id: &str, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let key = Self::key(owner_id, &period_key(Utc::now()));
        match self.cache.incr(&key, signed(bytes), Some(BANDWIDTH_TTL)).await {
            Ok(total) => debug!(owner_id, bytes, total, "Bandwidth recorded"),
            Err(e) => {
                warn!(owner_id, bytes, error = %e, "Bandwidth record failed");
                metrics::record_best_effort_failure("bandwidth_record");
            }
        }
    }
}
