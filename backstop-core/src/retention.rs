/*!
Retention tiers and policy enforcement.

Tier rule for new backups: the first backup of a UTC calendar month is
Monthly, otherwise the first of an ISO week is Weekly, everything else is
Daily. "First" means no Active backup of that tier (or higher, for weeks)
already exists in the period.

Enforcement partitions Active records by their stored tier and keeps the
newest `N` of each, ordered by `(created_at, id)` descending. The newest
Active record overall is never selected, so enforcement alone can never
empty the catalog.
*/

use chrono::{DateTime, Datelike, Utc};
use tracing::{info, warn};

use crate::config::RetentionPolicy;
use crate::engine::{lock_ignoring_poison, BackupEngine};
use crate::record::{BackupRecord, RetentionTier};
use crate::{BackstopError, Result};

/// Tier a backup taken at `created_at` should receive given the existing records
pub fn assign_tier(created_at: DateTime<Utc>, existing: &[BackupRecord]) -> RetentionTier {
    let active = || existing.iter().filter(|r| r.is_active());

    let month_taken = active().any(|r| {
        r.retention_tier == RetentionTier::Monthly
            && r.created_at.year() == created_at.year()
            && r.created_at.month() == created_at.month()
    });
    if !month_taken {
        return RetentionTier::Monthly;
    }

    let week_taken = active().any(|r| {
        r.retention_tier >= RetentionTier::Weekly && r.created_at.iso_week() == created_at.iso_week()
    });
    if !week_taken {
        return RetentionTier::Weekly;
    }

    RetentionTier::Daily
}

/// Ids of the records enforcement would delete, oldest first
pub fn plan_retention(records: &[BackupRecord], policy: &RetentionPolicy) -> Vec<String> {
    let active: Vec<&BackupRecord> = records.iter().filter(|r| r.is_active()).collect();
    let Some(newest) = active.iter().max_by(|a, b| a.sort_key().cmp(&b.sort_key())) else {
        return Vec::new();
    };

    let mut doomed: Vec<&BackupRecord> = Vec::new();
    for (tier, keep) in [
        (RetentionTier::Daily, policy.daily_keep),
        (RetentionTier::Weekly, policy.weekly_keep),
        (RetentionTier::Monthly, policy.monthly_keep),
    ] {
        let mut in_tier: Vec<&BackupRecord> = active
            .iter()
            .copied()
            .filter(|r| r.retention_tier == tier)
            .collect();
        in_tier.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        doomed.extend(
            in_tier
                .into_iter()
                .skip(keep)
                .filter(|r| r.id != newest.id),
        );
    }

    doomed.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    doomed.into_iter().map(|r| r.id.clone()).collect()
}

impl BackupEngine {
    /// Tier the next backup taken at `at` would receive
    pub fn next_tier(&self, at: DateTime<Utc>) -> RetentionTier {
        assign_tier(at, &self.catalog.active())
    }

    /// Delete backups beyond the policy's keep-counts
    ///
    /// Returns the number of backups deleted. A backup whose artifact cannot
    /// be removed stays Active and is retried on the next run.
    pub fn enforce_retention(&self, policy: &RetentionPolicy) -> Result<usize> {
        let _maintenance = lock_ignoring_poison(&self.maintenance);

        let records = self.catalog.list();
        let doomed = plan_retention(&records, policy);
        let mut deleted = 0;

        for id in &doomed {
            let Some(record) = records.iter().find(|r| &r.id == id) else {
                continue;
            };
            match self.delete_record(record) {
                Ok(()) => deleted += 1,
                Err(e @ BackstopError::Io(_)) => {
                    warn!(backup_id = %id, error = %e, "Failed to remove artifact; keeping record");
                }
                Err(e) => return Err(e),
            }
        }

        self.refresh_gauges();
        info!(
            deleted,
            planned = doomed.len(),
            daily_keep = policy.daily_keep,
            weekly_keep = policy.weekly_keep,
            monthly_keep = policy.monthly_keep,
            "Retention enforced"
        );
        Ok(deleted)
    }

    /// Recompute the tier of every Active record from its creation time
    ///
    /// Applies [`assign_tier`] in chronological order, as if every backup
    /// had been taken with the calendar rule. Returns how many tiers changed.
    pub fn reclassify_tiers(&self) -> Result<usize> {
        let _maintenance = lock_ignoring_poison(&self.maintenance);

        let changed = self.catalog.mutate(|records| {
            let mut seen: Vec<BackupRecord> = Vec::new();
            let mut changed = 0;
            for record in records.iter_mut().filter(|r| r.is_active()) {
                let tier = assign_tier(record.created_at, &seen);
                if tier != record.retention_tier {
                    record.retention_tier = tier;
                    changed += 1;
                }
                seen.push(record.clone());
            }
            Ok(changed)
        })?;

        info!(changed, "Retention tiers reclassified");
        Ok(changed)
    }
}
