//! Represents an object (file) held by one tier partition.

use crate::models::tier::MigrationStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A single stored object together with its migration bookkeeping.
///
/// In steady state exactly one partition holds a record for a given logical
/// `name`. While a migration is in flight the source and the copy coexist,
/// both locked, until the copy is verified and the source deleted.
///
/// `content` is only populated by reads that explicitly ask for it; metadata
/// reads leave it as `None`.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Partition-local identifier, assigned on insert.
    pub id: Uuid,

    /// Logical name, stable across migrations.
    pub name: String,

    /// Original filename supplied at ingestion.
    pub original_name: String,

    /// Stored payload. Skipped in JSON output.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Hex MD5 digest of `content`.
    pub checksum: Option<String>,

    /// Digest recomputed from the source right before the copy.
    pub source_checksum_before: Option<String>,

    /// Digest recomputed from the target right after the copy.
    pub target_checksum_after: Option<String>,

    pub migration_status: MigrationStatus,

    pub is_locked: bool,

    /// When the current lock was taken; `None` while unlocked.
    pub locked_at: Option<DateTime<Utc>>,

    /// Failed migration attempts. Never decreases.
    pub retry_attempts: i64,

    pub upload_date: DateTime<Utc>,

    pub last_access_date: Option<DateTime<Utc>>,

    /// When this copy was written by a migration.
    pub last_migration_date: Option<DateTime<Utc>>,
}

impl ObjectRecord {
    /// Steady-state check: idle and not held by any actor.
    pub fn is_settled(&self) -> bool {
        self.migration_status == MigrationStatus::Idle && !self.is_locked
    }

    /// True when this record was written as a migration copy under its
    /// current lock (copies are inserted with `last_migration_date == locked_at`).
    pub fn is_migration_copy(&self) -> bool {
        match (self.last_migration_date, self.locked_at) {
            (Some(migrated), Some(locked)) => migrated >= locked,
            _ => false,
        }
    }
}
