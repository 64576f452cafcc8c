//! src/services/reconciliation.rs
//!
//! Repairs partitions left inconsistent by an interrupted migration. Only
//! records that are locked in PROCESSING or VERIFYING, and have been locked
//! longer than the lock-lifetime bound, are touched; FAILED records are left
//! for an explicit reset.
//!
//! Every mutation is guarded by a precondition matching the stuck state that
//! was observed, so a pass racing with a live actor changes nothing, and a
//! second pass over a repaired state finds nothing to do.

use crate::models::{
    object::ObjectRecord,
    tier::{MigrationStatus, Tier},
};
use crate::services::{
    digest::content_digest,
    partition::{ObjectStore, PartitionSet, RecordFilter, RecordPatch, StorageResult},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationAction {
    /// A verified copy exists elsewhere; the stuck source was removed.
    DeletedDuplicateSource,
    /// Lock released, record back to IDLE in place.
    ResetToIdle,
    /// An unusable or superseded copy was removed.
    DeletedOrphanCopy,
    /// The only remaining copy failed verification and was parked.
    MarkedFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationOutcome {
    pub record: ObjectRecord,
    pub tier: Tier,
    pub action: ReconciliationAction,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// A lock older than this is considered abandoned.
    pub stale_after: Duration,
    /// How long after the source was locked a copy may have been written and
    /// still count as that migration's copy.
    pub recency_window: Duration,
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::minutes(10),
            recency_window: Duration::minutes(10),
            batch_size: 100,
        }
    }
}

fn stuck_filter() -> RecordFilter {
    RecordFilter::status_and_lock(
        &[MigrationStatus::Processing, MigrationStatus::Verifying],
        true,
    )
}

fn held(status: MigrationStatus) -> RecordFilter {
    RecordFilter::status_and_lock(&[status], true)
}

#[derive(Clone)]
pub struct ReconciliationScanner {
    partitions: PartitionSet,
    config: ReconcilerConfig,
}

impl ReconciliationScanner {
    pub fn new(partitions: PartitionSet, config: ReconcilerConfig) -> Self {
        Self { partitions, config }
    }

    pub async fn run(&self) -> StorageResult<Vec<ReconciliationOutcome>> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> StorageResult<Vec<ReconciliationOutcome>> {
        let mut outcomes = Vec::new();
        for (tier, partition) in self.partitions.iter() {
            let stuck = partition
                .query(&stuck_filter().with_limit(self.config.batch_size))
                .await?;

            for record in stuck {
                if !self.is_stale(&record, now) {
                    debug!("{} in {} is locked but not yet stale", record.id, tier);
                    continue;
                }
                match record.migration_status {
                    MigrationStatus::Processing => {
                        // No copy is ever written before VERIFYING.
                        outcomes.extend(
                            self.reset(partition, record, MigrationStatus::Processing)
                                .await?,
                        );
                    }
                    MigrationStatus::Verifying if record.is_migration_copy() => {
                        outcomes.extend(self.resolve_copy(tier, partition, record).await?);
                    }
                    MigrationStatus::Verifying => {
                        outcomes.extend(self.resolve_source(tier, partition, record, now).await?);
                    }
                    _ => {}
                }
            }
        }

        if !outcomes.is_empty() {
            info!("reconciliation repaired {} records", outcomes.len());
        }
        Ok(outcomes)
    }

    fn is_stale(&self, record: &ObjectRecord, now: DateTime<Utc>) -> bool {
        match record.locked_at {
            Some(at) => now - at >= self.config.stale_after,
            None => true,
        }
    }

    async fn reset(
        &self,
        partition: &Arc<dyn ObjectStore>,
        record: ObjectRecord,
        observed: MigrationStatus,
    ) -> StorageResult<Vec<ReconciliationOutcome>> {
        let reset = partition
            .atomic_update(
                record.id,
                &held(observed),
                &RecordPatch::release(MigrationStatus::Idle),
            )
            .await?;
        Ok(match reset {
            Some(updated) => {
                info!(
                    "reset stuck {} record `{}` in {} to IDLE",
                    observed,
                    updated.name,
                    partition.tier()
                );
                vec![ReconciliationOutcome {
                    record: updated,
                    tier: partition.tier(),
                    action: ReconciliationAction::ResetToIdle,
                }]
            }
            None => Vec::new(),
        })
    }

    /// A VERIFYING source: the copy either landed (finish the commit) or did
    /// not (release the source for a fresh attempt).
    async fn resolve_source(
        &self,
        tier: Tier,
        partition: &Arc<dyn ObjectStore>,
        source: ObjectRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<ReconciliationOutcome>> {
        let Some((copy_partition, copy)) = self.find_copy(tier, &source, now).await? else {
            return self.reset(partition, source, MigrationStatus::Verifying).await;
        };

        let mut outcomes = Vec::new();
        if !self.content_matches(copy_partition, &copy).await? {
            warn!(
                "copy {} of `{}` in {} does not match its checksum, discarding it",
                copy.id,
                copy.name,
                copy_partition.tier()
            );
            if copy_partition.delete_by_id(copy.id).await? {
                outcomes.push(ReconciliationOutcome {
                    record: copy,
                    tier: copy_partition.tier(),
                    action: ReconciliationAction::DeletedOrphanCopy,
                });
            }
            outcomes.extend(self.reset(partition, source, MigrationStatus::Verifying).await?);
            return Ok(outcomes);
        }

        if !copy.is_settled() {
            let forced = copy_partition
                .atomic_update(
                    copy.id,
                    &stuck_filter(),
                    &RecordPatch::release(MigrationStatus::Idle),
                )
                .await?;
            if forced.is_none() {
                debug!("copy {} changed underneath reconciliation, retrying later", copy.id);
                return Ok(outcomes);
            }
        }

        // Precondition re-check on the source before removing it.
        let still_stuck = partition
            .atomic_update(
                source.id,
                &held(MigrationStatus::Verifying),
                &RecordPatch::default(),
            )
            .await?;
        if still_stuck.is_some() && partition.delete_by_id(source.id).await? {
            info!(
                "finished interrupted migration of `{}`: removed source in {}, copy kept in {}",
                source.name,
                tier,
                copy_partition.tier()
            );
            outcomes.push(ReconciliationOutcome {
                record: source,
                tier,
                action: ReconciliationAction::DeletedDuplicateSource,
            });
        }
        Ok(outcomes)
    }

    /// Search every other partition for the copy written by the migration
    /// that locked `source`.
    async fn find_copy(
        &self,
        tier: Tier,
        source: &ObjectRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<(&Arc<dyn ObjectStore>, ObjectRecord)>> {
        let mut checksums: Vec<String> = Vec::new();
        for checksum in [&source.checksum, &source.source_checksum_before]
            .into_iter()
            .flatten()
        {
            if !checksums.contains(checksum) {
                checksums.push(checksum.clone());
            }
        }
        if checksums.is_empty() {
            return Ok(None);
        }

        let window_start = source
            .locked_at
            .unwrap_or(now - self.config.recency_window);
        let window_end = window_start + self.config.recency_window;

        let filter = RecordFilter {
            statuses: vec![
                MigrationStatus::Processing,
                MigrationStatus::Verifying,
                MigrationStatus::Idle,
            ],
            is_locked: None,
            name: Some(source.name.clone()),
            checksums,
            outside_access_band: None,
            limit: Some(self.config.batch_size),
        };

        for (other_tier, other) in self.partitions.iter() {
            if other_tier == tier {
                continue;
            }
            let found = other.query(&filter).await?.into_iter().find(|candidate| {
                candidate
                    .last_migration_date
                    .map(|at| at >= window_start && at <= window_end)
                    .unwrap_or(false)
            });
            if let Some(copy) = found {
                return Ok(Some((other, copy)));
            }
        }
        Ok(None)
    }

    /// A VERIFYING copy whose coordinator vanished. Defer to its source when
    /// one is still stuck; otherwise decide from what else exists.
    async fn resolve_copy(
        &self,
        tier: Tier,
        partition: &Arc<dyn ObjectStore>,
        copy: ObjectRecord,
    ) -> StorageResult<Vec<ReconciliationOutcome>> {
        let filter = RecordFilter {
            name: Some(copy.name.clone()),
            limit: Some(self.config.batch_size),
            ..RecordFilter::default()
        };

        let mut superseded = false;
        for (other_tier, other) in self.partitions.iter() {
            if other_tier == tier {
                continue;
            }
            for record in other.query(&filter).await? {
                if is_source_of(&record, &copy) {
                    debug!(
                        "copy {} in {} waits for its source {} in {}",
                        copy.id, tier, record.id, other_tier
                    );
                    return Ok(Vec::new());
                }
                if !record.is_migration_copy() {
                    superseded = true;
                }
            }
        }

        if superseded {
            // The object lives on elsewhere; this copy is a rollback leftover.
            if partition.delete_by_id(copy.id).await? {
                info!("removed abandoned copy of `{}` from {}", copy.name, tier);
                return Ok(vec![ReconciliationOutcome {
                    record: copy,
                    tier,
                    action: ReconciliationAction::DeletedOrphanCopy,
                }]);
            }
            return Ok(Vec::new());
        }

        // Sole surviving record: keep it only if its bytes check out.
        if self.content_matches(partition, &copy).await? {
            return self.reset(partition, copy, MigrationStatus::Verifying).await;
        }
        let parked = partition
            .atomic_update(
                copy.id,
                &held(MigrationStatus::Verifying),
                &RecordPatch::release(MigrationStatus::Failed),
            )
            .await?;
        Ok(match parked {
            Some(updated) => {
                warn!(
                    "only copy of `{}` in {} fails verification, parked as FAILED",
                    updated.name, tier
                );
                vec![ReconciliationOutcome {
                    record: updated,
                    tier,
                    action: ReconciliationAction::MarkedFailed,
                }]
            }
            None => Vec::new(),
        })
    }

    async fn content_matches(
        &self,
        partition: &Arc<dyn ObjectStore>,
        record: &ObjectRecord,
    ) -> StorageResult<bool> {
        let Some(full) = partition.find_by_id_with_content(record.id).await? else {
            return Ok(false);
        };
        let digest = content_digest(full.content.as_deref().unwrap_or_default());
        Ok(full.checksum.as_deref() == Some(digest.as_str()))
    }
}

/// `candidate` is the stuck source that produced `copy`.
fn is_source_of(candidate: &ObjectRecord, copy: &ObjectRecord) -> bool {
    if candidate.migration_status != MigrationStatus::Verifying
        || !candidate.is_locked
        || candidate.is_migration_copy()
    {
        return false;
    }
    let checksum_matches = copy.checksum.is_some()
        && (candidate.checksum == copy.checksum
            || candidate.source_checksum_before == copy.checksum);
    let locked_before_copy = match (candidate.locked_at, copy.last_migration_date) {
        (Some(locked), Some(copied)) => locked <= copied,
        _ => false,
    };
    checksum_matches && locked_before_copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::migration_coordinator::{DEFAULT_MAX_RETRIES, MigrationCoordinator};
    use crate::testing::{FaultyStore, memory_partition, memory_partitions, record};

    fn immediate() -> ReconcilerConfig {
        ReconcilerConfig {
            stale_after: Duration::zero(),
            ..ReconcilerConfig::default()
        }
    }

    /// A source stuck in VERIFYING, locked `minutes_ago`.
    fn stuck_source(name: &str, content: &[u8], minutes_ago: i64) -> ObjectRecord {
        let mut rec = record(name, content);
        rec.migration_status = MigrationStatus::Verifying;
        rec.is_locked = true;
        rec.locked_at = Some(Utc::now() - Duration::minutes(minutes_ago));
        rec.source_checksum_before = rec.checksum.clone();
        rec
    }

    /// The copy a coordinator would have written for `source`.
    fn copy_of(source: &ObjectRecord, committed: bool) -> ObjectRecord {
        let written = source.locked_at.unwrap() + Duration::seconds(1);
        let mut rec = source.clone();
        rec.source_checksum_before = None;
        rec.last_migration_date = Some(written);
        if committed {
            rec.migration_status = MigrationStatus::Idle;
            rec.is_locked = false;
            rec.locked_at = None;
            rec.source_checksum_before = source.checksum.clone();
            rec.target_checksum_after = source.checksum.clone();
        } else {
            rec.locked_at = Some(written);
        }
        rec
    }

    async fn all(partitions: &PartitionSet, tier: Tier) -> Vec<ObjectRecord> {
        partitions
            .get(tier)
            .query(&RecordFilter::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn crash_between_commit_and_source_delete_is_finished() {
        let partitions = memory_partitions().await;
        let source = stuck_source("ledger", b"ledger", 20);
        let source_id = partitions.get(Tier::Hot).insert(&source).await.unwrap();
        partitions
            .get(Tier::Warm)
            .insert(&copy_of(&source, true))
            .await
            .unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        let outcomes = scanner.run().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ReconciliationAction::DeletedDuplicateSource);
        assert_eq!(outcomes[0].record.id, source_id);
        assert_eq!(outcomes[0].tier, Tier::Hot);

        assert!(all(&partitions, Tier::Hot).await.is_empty());
        let warm = all(&partitions, Tier::Warm).await;
        assert_eq!(warm.len(), 1);
        assert!(warm[0].is_settled());

        assert!(scanner.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_source_delete_during_migration_is_repaired() {
        let hot = FaultyStore::new(memory_partition(Tier::Hot).await);
        let partitions = PartitionSet::new(
            hot.clone(),
            memory_partition(Tier::Warm).await,
            memory_partition(Tier::Cold).await,
        );
        let id = hot.insert(&record("photo", b"photo")).await.unwrap();
        hot.fail_deletes(true);
        let coordinator = MigrationCoordinator::new(partitions.clone(), DEFAULT_MAX_RETRIES);
        coordinator.migrate(id, Tier::Hot, Tier::Cold).await.unwrap();
        hot.fail_deletes(false);

        // Too fresh for the default lock bound.
        let patient = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        assert!(patient.run().await.unwrap().is_empty());
        assert_eq!(all(&partitions, Tier::Hot).await.len(), 1);

        let scanner = ReconciliationScanner::new(partitions.clone(), immediate());
        let outcomes = scanner.run().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ReconciliationAction::DeletedDuplicateSource);
        assert!(all(&partitions, Tier::Hot).await.is_empty());
        let cold = all(&partitions, Tier::Cold).await;
        assert_eq!(cold.len(), 1);
        assert!(cold[0].is_settled());
        assert!(scanner.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_processing_is_reset_in_place() {
        let partitions = memory_partitions().await;
        let mut rec = record("half", b"half");
        rec.migration_status = MigrationStatus::Processing;
        rec.is_locked = true;
        rec.locked_at = Some(Utc::now() - Duration::minutes(30));
        let id = partitions.get(Tier::Warm).insert(&rec).await.unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        let outcomes = scanner.run().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ReconciliationAction::ResetToIdle);
        assert_eq!(outcomes[0].tier, Tier::Warm);

        let reset = partitions.get(Tier::Warm).find_by_id(id).await.unwrap().unwrap();
        assert!(reset.is_settled());
        assert!(reset.locked_at.is_none());
        assert!(scanner.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verifying_source_without_copy_is_reset() {
        let partitions = memory_partitions().await;
        let id = partitions
            .get(Tier::Hot)
            .insert(&stuck_source("lonely", b"lonely", 15))
            .await
            .unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        let outcomes = scanner.run().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ReconciliationAction::ResetToIdle);
        assert!(
            partitions
                .get(Tier::Hot)
                .find_by_id(id)
                .await
                .unwrap()
                .unwrap()
                .is_settled()
        );
    }

    #[tokio::test]
    async fn copy_outside_recency_window_is_not_matched() {
        let partitions = memory_partitions().await;
        let source = stuck_source("old", b"old", 60);
        partitions.get(Tier::Hot).insert(&source).await.unwrap();
        let mut unrelated = copy_of(&source, true);
        unrelated.last_migration_date = source.locked_at.map(|at| at + Duration::minutes(30));
        partitions.get(Tier::Cold).insert(&unrelated).await.unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        let outcomes = scanner.run().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ReconciliationAction::ResetToIdle);
        assert_eq!(all(&partitions, Tier::Hot).await.len(), 1);
        assert_eq!(all(&partitions, Tier::Cold).await.len(), 1);
    }

    #[tokio::test]
    async fn uncommitted_copy_is_promoted_and_source_removed() {
        let partitions = memory_partitions().await;
        let source = stuck_source("draft", b"draft", 20);
        partitions.get(Tier::Hot).insert(&source).await.unwrap();
        let copy_id = partitions
            .get(Tier::Warm)
            .insert(&copy_of(&source, false))
            .await
            .unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), immediate());
        let outcomes = scanner.run().await.unwrap();
        let actions: Vec<_> = outcomes.iter().map(|o| o.action).collect();
        assert_eq!(actions, vec![ReconciliationAction::DeletedDuplicateSource]);

        assert!(all(&partitions, Tier::Hot).await.is_empty());
        let copy = partitions
            .get(Tier::Warm)
            .find_by_id(copy_id)
            .await
            .unwrap()
            .unwrap();
        assert!(copy.is_settled());
        assert!(scanner.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_scanned_before_its_source_waits_for_it() {
        let partitions = memory_partitions().await;
        let source = stuck_source("promoted", b"promoted", 20);
        partitions.get(Tier::Cold).insert(&source).await.unwrap();
        let copy_id = partitions
            .get(Tier::Hot)
            .insert(&copy_of(&source, false))
            .await
            .unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        let outcomes = scanner.run().await.unwrap();
        let actions: Vec<_> = outcomes.iter().map(|o| (o.tier, o.action)).collect();
        assert_eq!(
            actions,
            vec![(Tier::Cold, ReconciliationAction::DeletedDuplicateSource)]
        );

        assert!(all(&partitions, Tier::Cold).await.is_empty());
        let hot = all(&partitions, Tier::Hot).await;
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].id, copy_id);
        assert!(hot[0].is_settled());

        assert!(scanner.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_copy_is_discarded_and_source_reset() {
        let partitions = memory_partitions().await;
        let source = stuck_source("blob", b"blob", 20);
        let source_id = partitions.get(Tier::Hot).insert(&source).await.unwrap();
        let mut bad = copy_of(&source, false);
        bad.content = Some(b"blub".to_vec());
        partitions.get(Tier::Warm).insert(&bad).await.unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), immediate());
        let outcomes = scanner.run().await.unwrap();
        let actions: Vec<_> = outcomes.iter().map(|o| (o.tier, o.action)).collect();
        assert_eq!(
            actions,
            vec![
                (Tier::Warm, ReconciliationAction::DeletedOrphanCopy),
                (Tier::Hot, ReconciliationAction::ResetToIdle),
            ]
        );
        assert!(all(&partitions, Tier::Warm).await.is_empty());
        assert!(
            partitions
                .get(Tier::Hot)
                .find_by_id(source_id)
                .await
                .unwrap()
                .unwrap()
                .is_settled()
        );
    }

    #[tokio::test]
    async fn leftover_copy_next_to_live_source_is_removed() {
        let partitions = memory_partitions().await;
        let live = record("kept", b"kept");
        partitions.get(Tier::Hot).insert(&live).await.unwrap();
        let mut leftover = live.clone();
        let at = Utc::now() - Duration::minutes(20);
        leftover.migration_status = MigrationStatus::Verifying;
        leftover.is_locked = true;
        leftover.locked_at = Some(at);
        leftover.last_migration_date = Some(at);
        partitions.get(Tier::Cold).insert(&leftover).await.unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        let outcomes = scanner.run().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].action, ReconciliationAction::DeletedOrphanCopy);
        assert_eq!(outcomes[0].tier, Tier::Cold);
        assert!(all(&partitions, Tier::Cold).await.is_empty());
        assert_eq!(all(&partitions, Tier::Hot).await.len(), 1);
    }

    #[tokio::test]
    async fn sole_copy_is_kept_when_intact_and_parked_when_corrupt() {
        let partitions = memory_partitions().await;
        let at = Utc::now() - Duration::minutes(20);

        let mut intact = record("intact", b"intact");
        intact.migration_status = MigrationStatus::Verifying;
        intact.is_locked = true;
        intact.locked_at = Some(at);
        intact.last_migration_date = Some(at);
        let intact_id = partitions.get(Tier::Warm).insert(&intact).await.unwrap();

        let mut broken = intact.clone();
        broken.name = "broken".into();
        broken.content = Some(b"not what the checksum says".to_vec());
        let broken_id = partitions.get(Tier::Warm).insert(&broken).await.unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        let outcomes = scanner.run().await.unwrap();
        assert_eq!(outcomes.len(), 2);

        let warm = partitions.get(Tier::Warm);
        assert!(warm.find_by_id(intact_id).await.unwrap().unwrap().is_settled());
        let parked = warm.find_by_id(broken_id).await.unwrap().unwrap();
        assert_eq!(parked.migration_status, MigrationStatus::Failed);
        assert!(!parked.is_locked);

        assert!(scanner.run().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_locks_and_failed_records_are_left_alone() {
        let partitions = memory_partitions().await;
        let fresh = stuck_source("inflight", b"inflight", 1);
        let fresh_id = partitions.get(Tier::Hot).insert(&fresh).await.unwrap();
        let mut failed = record("parked", b"parked");
        failed.migration_status = MigrationStatus::Failed;
        failed.retry_attempts = 3;
        partitions.get(Tier::Hot).insert(&failed).await.unwrap();

        let scanner = ReconciliationScanner::new(partitions.clone(), ReconcilerConfig::default());
        assert!(scanner.run().await.unwrap().is_empty());

        let untouched = partitions
            .get(Tier::Hot)
            .find_by_id(fresh_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.migration_status, MigrationStatus::Verifying);
        assert!(untouched.is_locked);
    }
}
