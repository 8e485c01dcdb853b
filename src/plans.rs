//! Plan configuration: limits and lifecycle thresholds per owner.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::Database;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub name: String,
    pub storage_limit_bytes: u64,
    /// Per calendar month.
    pub bandwidth_limit_bytes: u64,
    pub max_file_size: u64,
    /// Unset falls back to the sweep's default.
    pub cold_storage_after_days: Option<u32>,
    pub archive_after_days: Option<u32>,
    /// Unset means trashed files are never purged automatically.
    pub deletion_after_months: Option<u32>,
    pub lifecycle_exempt: bool,
}

impl Plan {
    /// Built-in catalogue used when no overrides are configured.
    pub fn builtin() -> Vec<Plan> {
        vec![
            Plan {
                name: "free".to_string(),
                storage_limit_bytes: 5 * GIB,
                bandwidth_limit_bytes: 20 * GIB,
                max_file_size: 100 * MIB,
                cold_storage_after_days: Some(30),
                archive_after_days: Some(180),
                deletion_after_months: Some(1),
                lifecycle_exempt: false,
            },
            Plan {
                name: "pro".to_string(),
                storage_limit_bytes: 100 * GIB,
                bandwidth_limit_bytes: 500 * GIB,
                max_file_size: 2 * GIB,
                cold_storage_after_days: None,
                archive_after_days: None,
                deletion_after_months: Some(3),
                lifecycle_exempt: false,
            },
            Plan {
                name: "business".to_string(),
                storage_limit_bytes: 1024 * GIB,
                bandwidth_limit_bytes: 5 * 1024 * GIB,
                max_file_size: 10 * GIB,
                cold_storage_after_days: Some(180),
                archive_after_days: Some(730),
                deletion_after_months: Some(6),
                lifecycle_exempt: false,
            },
            Plan {
                name: "enterprise".to_string(),
                storage_limit_bytes: 10 * 1024 * GIB,
                bandwidth_limit_bytes: u64::MAX,
                max_file_size: 50 * GIB,
                cold_storage_after_days: None,
                archive_after_days: None,
                deletion_after_months: None,
                lifecycle_exempt: true,
            },
        ]
    }
}

/// Resolves the plan in force for an owner.
#[async_trait]
pub trait PlanDirectory: Send + Sync {
    async fn plan_for(&self, owner_id: &str) -> Result<Plan>;
}

/// Config-defined plans plus per-owner assignments persisted in redb.
pub struct PlanCatalog {
    plans: HashMap<String, Plan>,
    default_plan: String,
    db: Database,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>, default_plan: &str, db: Database) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.name.clone(), p)).collect(),
            default_plan: default_plan.to_string(),
            db,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Plan> {
        self.plans.get(name)
    }

    pub fn assign(&self, owner_id: &str, plan_name: &str) -> Result<&Plan> {
        let Some(plan) = self.plans.get(plan_name) else {
            return Err(Error::Validation(format!("Unknown plan: {plan_name}")));
        };
        self.db.assign_plan(owner_id, plan_name)?;
        tracing::info!(owner_id, plan = plan_name, "Plan assigned");
        Ok(plan)
    }

    fn default(&self) -> Result<Plan> {
        self.plans
            .get(&self.default_plan)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("Unknown plan: {}", self.default_plan)))
    }
}

#[async_trait]
impl PlanDirectory for PlanCatalog {
    async fn plan_for(&self, owner_id: &str) -> Result<Plan> {
        match self.db.assigned_plan(owner_id)? {
            Some(name) => match self.plans.get(&name) {
                Some(plan) => Ok(plan.clone()),
                None => {
                    tracing::warn!(
                        owner_id,
                        plan = %name,
                        "Assigned plan no longer exists, using default"
                    );
                    self.default()
                }
            },
            None => self.default(),
        }
    }
}
