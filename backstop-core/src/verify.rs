//! Artifact verification against the cataloged checksum

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::BackupEngine;
use crate::integrity::hash_file;
use crate::record::BackupRef;
use crate::Result;

impl BackupEngine {
    /// Re-hash a backup's artifact and compare it with the cataloged checksum
    ///
    /// A missing, unreadable or mismatched artifact is a normal outcome and
    /// yields `Ok(false)`; the artifact and checksum are never modified. On a
    /// match `verified_at` is set in the catalog. Only an unknown id or a
    /// failed catalog read or write is an error.
    pub fn verify_backup<'a>(&self, backup: impl Into<BackupRef<'a>>) -> Result<bool> {
        let record = self.resolve(backup.into())?;

        if !record.is_active() {
            warn!(backup_id = %record.id, "Cannot verify a deleted backup");
            self.metrics.verification(false);
            return Ok(false);
        }

        let passed = match hash_file(&record.artifact_location) {
            Ok((digest, size)) if digest == record.checksum && size == record.size_bytes => true,
            Ok((digest, size)) => {
                warn!(
                    backup_id = %record.id,
                    expected = %record.checksum,
                    actual = %digest,
                    expected_size = record.size_bytes,
                    actual_size = size,
                    "Artifact does not match its checksum"
                );
                false
            }
            Err(e) => {
                warn!(
                    backup_id = %record.id,
                    path = %record.artifact_location.display(),
                    error = %e,
                    "Artifact unreadable"
                );
                false
            }
        };
        self.metrics.verification(passed);

        if passed {
            let verified_at = Utc::now();
            self.catalog.update_with(&record.id, |stored| {
                stored.verified_at = Some(verified_at);
                Ok(())
            })?;
            info!(backup_id = %record.id, "Backup verified");
        }
        Ok(passed)
    }

    /// Verify every Active backup, returning `(id, passed)` pairs oldest first
    pub fn verify_all(&self) -> Result<Vec<(String, bool)>> {
        self.catalog
            .active()
            .iter()
            .map(|record| Ok((record.id.clone(), self.verify_backup(record)?)))
            .collect()
    }
}
