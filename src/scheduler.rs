//! Periodic lifecycle sweeps and quota reconciliation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::LifecycleManager;
use crate::metrics;
use crate::quota::QuotaLedger;
use crate::storage::MetadataStore;

/// Reconcile owners known to have drifted, then everyone else.
pub async fn reconcile_all(quota: &QuotaLedger, metadata: &dyn MetadataStore) -> usize {
    let dirty = quota.dirty_owners();
    let mut done = BTreeSet::new();
    let mut failures = 0usize;

    for owner_id in &dirty {
        match quota.reconcile(owner_id).await {
            Ok(_) => {
                done.insert(owner_id.clone());
            }
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Reconcile failed");
                failures += 1;
            }
        }
    }

    match metadata.list_owners().await {
        Ok(owners) => {
            let todo: Vec<String> = owners
                .into_iter()
                .filter(|o| !done.contains(o))
                .collect();
            for owner_id in todo {
                match quota.reconcile(&owner_id).await {
                    Ok(_) => {
                        done.insert(owner_id);
                    }
                    Err(e) => {
                        warn!(owner_id = %owner_id, error = %e, "Reconcile failed");
                        failures += 1;
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Reconcile could not list owners");
            failures += 1;
        }
    }

    if failures > 0 {
        metrics::BEST_EFFORT_FAILURES
            .with_label_values(&["reconcile"])
            .inc_by(failures as u64);
    }
    info!(
        reconciled = done.len(),
        dirty = dirty.len(),
        failures,
        "Quota reconcile pass finished"
    );
    done.len()
}

/// Spawn the sweep and reconcile loops. Both skip the immediate first tick
/// and stop when `cancel` fires.
pub fn spawn(
    lifecycle: Arc<LifecycleManager>,
    quota: Arc<QuotaLedger>,
    metadata: Arc<dyn MetadataStore>,
    sweep_interval: Duration,
    reconcile_interval: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let sweep_cancel = cancel.clone();
    let sweep = tokio::spawn(async move {
        let mut timer = tokio::time::interval(sweep_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => break,
                _ = timer.tick() => {
                    lifecycle.sweep(Utc::now()).await;
                }
            }
        }
        debug!("Lifecycle sweep loop stopped");
    });

    let reconcile = tokio::spawn(async move {
        let mut timer = tokio::time::interval(reconcile_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    reconcile_all(&quota, metadata.as_ref()).await;
                }
            }
        }
        debug!("Reconcile loop stopped");
    });

    vec![sweep, reconcile]
}
