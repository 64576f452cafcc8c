//! src/services/migration_coordinator.rs
//!
//! Moves one object between two tier partitions with a lock → copy → verify →
//! commit/rollback protocol. Partitions share no transaction, so a move is a
//! verified copy followed by a delete of the source; the source is never
//! removed before the copy is known to be byte-identical.
//!
//! The lock is the record itself: an atomic update flipping `is_locked` and
//! `migration_status`. There is no lock table.

use crate::models::{
    object::ObjectRecord,
    tier::{MigrationStatus, Tier},
};
use crate::services::{
    digest::content_digest,
    partition::{ObjectStore, PartitionSet, RecordFilter, RecordPatch, StorageError},
};
use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Which side of the copy failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStage {
    /// Stored checksum disagreed with the source bytes before copying.
    PreCopy,
    /// The bytes read back from the target disagreed with the source digest.
    PostCopy,
}

impl fmt::Display for IntegrityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityStage::PreCopy => f.write_str("pre-copy"),
            IntegrityStage::PostCopy => f.write_str("post-copy"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("object `{id}` not found in {tier} partition")]
    NotFound { id: Uuid, tier: Tier },
    #[error("object `{id}` is locked by another migration")]
    AlreadyLocked { id: Uuid },
    #[error("{stage} checksum mismatch for `{id}`: expected {expected}, got {actual}")]
    IntegrityError {
        id: Uuid,
        stage: IntegrityStage,
        expected: String,
        actual: String,
    },
    #[error("object `{id}` parked as FAILED after {attempts} attempts")]
    MaxRetriesExceeded {
        id: Uuid,
        attempts: i64,
        #[source]
        last_error: Option<Box<MigrationError>>,
    },
    #[error("object is already in the {0} tier")]
    SameTier(Tier),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type MigrationResult<T> = Result<T, MigrationError>;

fn idle_unlocked() -> RecordFilter {
    RecordFilter::status_and_lock(&[MigrationStatus::Idle], false)
}

fn held(status: MigrationStatus) -> RecordFilter {
    RecordFilter::status_and_lock(&[status], true)
}

fn in_flight() -> RecordFilter {
    RecordFilter::status_and_lock(
        &[MigrationStatus::Processing, MigrationStatus::Verifying],
        true,
    )
}

/// Runs the per-object migration protocol. Holds no state between calls and
/// schedules nothing; retries are the caller's business.
#[derive(Clone)]
pub struct MigrationCoordinator {
    partitions: PartitionSet,
    max_retries: i64,
}

impl MigrationCoordinator {
    pub fn new(partitions: PartitionSet, max_retries: i64) -> Self {
        Self {
            partitions,
            max_retries: max_retries.max(1),
        }
    }

    /// Move record `id` from `source_tier` to `target_tier` and return the
    /// committed copy.
    ///
    /// `NotFound` and `AlreadyLocked` are reported before the lock is taken
    /// and cost no attempt. Any later failure rolls back the copy and counts
    /// against the record's retry budget.
    pub async fn migrate(
        &self,
        id: Uuid,
        source_tier: Tier,
        target_tier: Tier,
    ) -> MigrationResult<ObjectRecord> {
        if source_tier == target_tier {
            return Err(MigrationError::SameTier(source_tier));
        }
        let source = self.partitions.get(source_tier);
        let target = self.partitions.get(target_tier);

        let locked = self.acquire_lock(source, id).await?;
        info!(
            "migration of `{}` ({}) {} -> {} started",
            locked.name, id, source_tier, target_tier
        );

        let mut copy_id = None;
        match self
            .copy_verify_commit(source, target, &locked, &mut copy_id)
            .await
        {
            Ok(committed) => {
                info!(
                    "migration of `{}` {} -> {} committed as {}",
                    committed.name, source_tier, target_tier, committed.id
                );
                Ok(committed)
            }
            Err(err) => Err(self.handle_failure(source, target, id, copy_id, err).await),
        }
    }

    /// Step 1: the atomic update that is the mutual-exclusion mechanism.
    async fn acquire_lock(
        &self,
        source: &Arc<dyn ObjectStore>,
        id: Uuid,
    ) -> MigrationResult<ObjectRecord> {
        let now = Utc::now();
        if let Some(locked) = source
            .atomic_update(id, &idle_unlocked(), &RecordPatch::lock(now))
            .await?
        {
            return Ok(locked);
        }

        match source.find_by_id(id).await? {
            None => Err(MigrationError::NotFound {
                id,
                tier: source.tier(),
            }),
            Some(record)
                if record.migration_status == MigrationStatus::Failed && !record.is_locked =>
            {
                Err(MigrationError::MaxRetriesExceeded {
                    id,
                    attempts: record.retry_attempts,
                    last_error: None,
                })
            }
            Some(_) => Err(MigrationError::AlreadyLocked { id }),
        }
    }

    /// Steps 2–8. `copy_id` is set as soon as a target record exists so the
    /// failure path can roll it back, and cleared once the copy is committed.
    async fn copy_verify_commit(
        &self,
        source: &Arc<dyn ObjectStore>,
        target: &Arc<dyn ObjectStore>,
        locked: &ObjectRecord,
        copy_id: &mut Option<Uuid>,
    ) -> MigrationResult<ObjectRecord> {
        let id = locked.id;

        let loaded = source
            .find_by_id_with_content(id)
            .await?
            .ok_or(MigrationError::NotFound {
                id,
                tier: source.tier(),
            })?;
        let content = loaded
            .content
            .clone()
            .ok_or_else(|| StorageError::MissingContent(loaded.name.clone()))?;
        let source_hash_before = content_digest(&content);

        let verifying = RecordPatch {
            migration_status: Some(MigrationStatus::Verifying),
            source_checksum_before: Some(Some(source_hash_before.clone())),
            target_checksum_after: Some(None),
            ..RecordPatch::default()
        };
        source
            .atomic_update(id, &held(MigrationStatus::Processing), &verifying)
            .await?
            .ok_or(MigrationError::AlreadyLocked { id })?;

        if let Some(stored) = &loaded.checksum {
            if *stored != source_hash_before {
                return Err(MigrationError::IntegrityError {
                    id,
                    stage: IntegrityStage::PreCopy,
                    expected: stored.clone(),
                    actual: source_hash_before,
                });
            }
        }

        let now = Utc::now();
        let copy = build_copy(&loaded, content, &source_hash_before, now);
        let new_id = target.insert(&copy).await?;
        *copy_id = Some(new_id);
        debug!("copy of `{}` written to {} as {}", loaded.name, target.tier(), new_id);

        let written = target
            .find_by_id_with_content(new_id)
            .await?
            .ok_or(MigrationError::NotFound {
                id: new_id,
                tier: target.tier(),
            })?;
        let target_hash_after = content_digest(written.content.as_deref().unwrap_or_default());

        if target_hash_after != source_hash_before {
            return Err(MigrationError::IntegrityError {
                id,
                stage: IntegrityStage::PostCopy,
                expected: source_hash_before,
                actual: target_hash_after,
            });
        }

        let commit = RecordPatch {
            source_checksum_before: Some(Some(source_hash_before)),
            target_checksum_after: Some(Some(target_hash_after)),
            ..RecordPatch::release(MigrationStatus::Idle)
        };
        let committed = target
            .atomic_update(new_id, &held(MigrationStatus::Verifying), &commit)
            .await?
            .ok_or(MigrationError::NotFound {
                id: new_id,
                tier: target.tier(),
            })?;
        *copy_id = None;

        // Last and unverified: a leftover source is resolved by reconciliation.
        match source.delete_by_id(id).await {
            Ok(true) => {}
            Ok(false) => warn!("source {} of `{}` already gone after commit", id, committed.name),
            Err(err) => warn!(
                "could not delete source {} of `{}` after commit, leaving it for reconciliation: {}",
                id, committed.name, err
            ),
        }

        Ok(committed)
    }

    /// Roll back a partial copy and charge one attempt to the source.
    async fn handle_failure(
        &self,
        source: &Arc<dyn ObjectStore>,
        target: &Arc<dyn ObjectStore>,
        id: Uuid,
        copy_id: Option<Uuid>,
        err: MigrationError,
    ) -> MigrationError {
        if let Some(copy) = copy_id {
            match target.delete_by_id(copy).await {
                Ok(_) => info!("rolled back copy {} in {} partition", copy, target.tier()),
                Err(e) => warn!(
                    "could not roll back copy {} in {} partition: {}",
                    copy,
                    target.tier(),
                    e
                ),
            }
        }

        let bump = RecordPatch {
            increment_retry_attempts: true,
            ..RecordPatch::default()
        };
        let counted = match source.atomic_update(id, &in_flight(), &bump).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("lock on {} was lost before the failed attempt was recorded", id);
                return err;
            }
            Err(e) => {
                warn!("could not record failed attempt for {}: {}", id, e);
                return err;
            }
        };

        let exhausted = counted.retry_attempts >= self.max_retries;
        let status = if exhausted {
            MigrationStatus::Failed
        } else {
            MigrationStatus::Idle
        };
        if let Err(e) = source
            .atomic_update(id, &in_flight(), &RecordPatch::release(status))
            .await
        {
            warn!("could not release lock on {} after failure: {}", id, e);
        }

        if exhausted {
            warn!(
                "migration of `{}` failed {} times, parked as FAILED: {}",
                counted.name, counted.retry_attempts, err
            );
            MigrationError::MaxRetriesExceeded {
                id,
                attempts: counted.retry_attempts,
                last_error: Some(Box::new(err)),
            }
        } else {
            warn!(
                "migration of `{}` failed (attempt {}/{}): {}",
                counted.name, counted.retry_attempts, self.max_retries, err
            );
            err
        }
    }
}

/// The target-side record: same logical fields and bytes, locked in
/// VERIFYING until the read-back digest matches.
fn build_copy(
    source: &ObjectRecord,
    content: Vec<u8>,
    checksum: &str,
    now: DateTime<Utc>,
) -> ObjectRecord {
    ObjectRecord {
        id: Uuid::nil(),
        name: source.name.clone(),
        original_name: source.original_name.clone(),
        size_bytes: content.len() as i64,
        content: Some(content),
        content_type: source.content_type.clone(),
        checksum: Some(checksum.to_string()),
        source_checksum_before: None,
        target_checksum_after: None,
        migration_status: MigrationStatus::Verifying,
        is_locked: true,
        locked_at: Some(now),
        retry_attempts: 0,
        upload_date: source.upload_date,
        last_access_date: source.last_access_date,
        last_migration_date: Some(now),
    }
}
