//! Hot / cold / archive classification and trash purging.
//!
//! Tiers are labels only; no bytes move. The sweep runs against live
//! traffic, so every change is a single-record transition and a record that
//! vanished or already changed tier is skipped quietly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::dedup::DeduplicationEngine;
use crate::error::Result;
use crate::events::{EventBus, EventType};
use crate::listing::ListingCache;
use crate::plans::{Plan, PlanDirectory};
use crate::storage::models::{FileRecord, Transition};
use crate::storage::MetadataStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub owners_scanned: usize,
    pub owners_exempt: usize,
    pub cold: usize,
    pub archived: usize,
    pub purged: usize,
    pub failures: usize,
}

/// Thresholds in force for one owner.
struct Thresholds {
    cold_before: DateTime<Utc>,
    archive_before: DateTime<Utc>,
    purge_before: Option<DateTime<Utc>>,
}

pub struct LifecycleManager {
    metadata: Arc<dyn MetadataStore>,
    plans: Arc<dyn PlanDirectory>,
    events: Arc<EventBus>,
    dedup: Arc<DeduplicationEngine>,
    listing: Arc<ListingCache>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        plans: Arc<dyn PlanDirectory>,
        events: Arc<EventBus>,
        dedup: Arc<DeduplicationEngine>,
        listing: Arc<ListingCache>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            metadata,
            plans,
            events,
            dedup,
            listing,
            config,
        }
    }

    fn file_event(file: &FileRecord) -> serde_json::Value {
        serde_json::json!({
            "fileId": file.id,
            "ownerId": file.owner_id,
            "tier": file.tier(),
        })
    }

    /// Flag a file cold. Already-cold files are returned unchanged and no
    /// event is published.
    pub async fn mark_as_cold_storage(
        &self,
        file_id: &str,
        request_id: Option<&str>,
    ) -> Result<Transition<FileRecord>> {
        let transition = self.metadata.mark_cold(file_id, Utc::now()).await?;
        if let Transition::Applied(ref file) = transition {
            info!(file_id, owner_id = %file.owner_id, "File moved to cold storage");
            self.listing.invalidate(&file.owner_id).await;
            self.events
                .publish(EventType::FileColdStorage, Self::file_event(file), request_id)
                .await;
        }
        Ok(transition)
    }

    /// Clear the cold flag and reset last access, whatever the current tier.
    /// The archive label is kept.
    pub async fn restore_from_cold_storage(
        &self,
        file_id: &str,
        request_id: Option<&str>,
    ) -> Result<Transition<FileRecord>> {
        let transition = self.metadata.restore_from_cold(file_id, Utc::now()).await?;
        if let Transition::Applied(ref file) = transition {
            info!(file_id, owner_id = %file.owner_id, "File restored from cold storage");
            self.listing.invalidate(&file.owner_id).await;
            self.events
                .publish(EventType::FileWarmed, Self::file_event(file), request_id)
                .await;
        }
        Ok(transition)
    }

    /// Label a cold file archived. Hot or already archived files are unchanged.
    pub async fn mark_as_archived(&self, file_id: &str) -> Result<Transition<FileRecord>> {
        let transition = self.metadata.mark_archived(file_id, Utc::now()).await?;
        if let Transition::Applied(ref file) = transition {
            info!(file_id, owner_id = %file.owner_id, "File archived");
            self.listing.invalidate(&file.owner_id).await;
            self.events
                .publish(EventType::FileArchived, Self::file_event(file), None)
                .await;
        }
        Ok(transition)
    }

    fn thresholds(&self, plan: &Plan, now: DateTime<Utc>) -> Thresholds {
        let cold_days = plan
            .cold_storage_after_days
            .unwrap_or(self.config.default_cold_after_days);
        let archive_days = plan
            .archive_after_days
            .unwrap_or(self.config.default_archive_after_days);
        Thresholds {
            cold_before: now - Duration::days(i64::from(cold_days)),
            archive_before: now - Duration::days(i64::from(archive_days)),
            purge_before: plan
                .deletion_after_months
                .and_then(|m| now.checked_sub_months(Months::new(m))),
        }
    }

    /// One bounded pass over every owner.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let owners = match self.metadata.list_owners().await {
            Ok(owners) => owners,
            Err(e) => {
                warn!(error = %e, "Lifecycle sweep could not list owners");
                report.failures += 1;
                return report;
            }
        };

        for owner_id in owners {
            if report.cold >= self.config.cold_batch
                && report.archived >= self.config.archive_batch
                && report.purged >= self.config.purge_batch
            {
                break;
            }

            let plan = match self.plans.plan_for(&owner_id).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(owner_id = %owner_id, error = %e, "Skipping owner, plan unavailable");
                    report.failures += 1;
                    continue;
                }
            };
            if plan.lifecycle_exempt {
                report.owners_exempt += 1;
                continue;
            }
            report.owners_scanned += 1;

            let files = match self.metadata.list_by_owner(&owner_id).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(owner_id = %owner_id, error = %e, "Skipping owner, listing failed");
                    report.failures += 1;
                    continue;
                }
            };
            self.sweep_owner(&files, &self.thresholds(&plan, now), &mut report)
                .await;
        }

        info!(
            owners = report.owners_scanned,
            exempt = report.owners_exempt,
            cold = report.cold,
            archived = report.archived,
            purged = report.purged,
            failures = report.failures,
            "Lifecycle sweep finished"
        );
        report
    }

    async fn sweep_owner(&self, files: &[FileRecord], t: &Thresholds, report: &mut SweepReport) {
        for file in files {
            if file.is_deleted {
                let expired = match (t.purge_before, file.deleted_at) {
                    (Some(before), Some(deleted_at)) => deleted_at < before,
                    _ => false,
                };
                if expired && report.purged < self.config.purge_batch {
                    match self.purge(file, t.purge_before).await {
                        Ok(true) => report.purged += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(file_id = %file.id, error = %e, "Trash purge failed");
                            report.failures += 1;
                        }
                    }
                }
                continue;
            }

            if file.cold_storage {
                if file.archived_at.is_none()
                    && file.created_at < t.archive_before
                    && report.archived < self.config.archive_batch
                {
                    match self.mark_as_archived(&file.id).await {
                        Ok(tr) if tr.is_applied() => report.archived += 1,
                        Ok(_) => debug!(file_id = %file.id, "Archive skipped, record changed"),
                        Err(e) => {
                            warn!(file_id = %file.id, error = %e, "Archive transition failed");
                            report.failures += 1;
                        }
                    }
                }
            } else if file.last_accessed_at < t.cold_before
                && report.cold < self.config.cold_batch
            {
                match self.mark_as_cold_storage(&file.id, None).await {
                    Ok(tr) if tr.is_applied() => report.cold += 1,
                    Ok(_) => debug!(file_id = %file.id, "Cold transition skipped, record changed"),
                    Err(e) => {
                        warn!(file_id = %file.id, error = %e, "Cold transition failed");
                        report.failures += 1;
                    }
                }
            }
        }
    }

    /// Permanently remove a trashed record, then its bytes if unshared.
    async fn purge(&self, file: &FileRecord, before: Option<DateTime<Utc>>) -> Result<bool> {
        let Some(before) = before else {
            return Ok(false);
        };
        let Some(removed) = self.metadata.purge_trashed(&file.id, before).await? else {
            debug!(file_id = %file.id, "Purge skipped, record restored or gone");
            return Ok(false);
        };
        self.dedup.release(&removed).await;
        info!(file_id = %removed.id, owner_id = %removed.owner_id, "Trashed file purged");
        self.events
            .publish(
                EventType::FilePurged,
                serde_json::json!({
                    "fileId": removed.id,
                    "ownerId": removed.owner_id,
                    "size": removed.logical_size,
                }),
                None,
            )
            .await;
        Ok(true)
    }
}
