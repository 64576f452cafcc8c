//! LifecycleService: the operations exposed by the tier manager, wired over
//! one set of partitions. Shared state for the HTTP handlers and the periodic
//! drivers.

use crate::models::{
    object::ObjectRecord,
    tier::{MigrationStatus, Tier},
};
use crate::services::{
    candidate_scanner::{CandidateScanner, MigrationCandidate},
    migration_coordinator::{MigrationCoordinator, MigrationError, MigrationResult},
    partition::{ObjectStore, PartitionSet, RecordFilter, RecordPatch, StorageResult},
    reconciliation::{ReconcilerConfig, ReconciliationOutcome, ReconciliationScanner},
    tier_classifier::{TierDecision, TierPolicy},
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Knobs for the engine, usually taken from `AppConfig`.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub policy: TierPolicy,
    pub max_retries: i64,
    pub scan_batch_size: usize,
    pub reconciler: ReconcilerConfig,
}

/// Tally of one migration sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub migrated: usize,
    /// Lost a race with another actor; picked up again on a later sweep.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct LifecycleService {
    pub partitions: PartitionSet,
    policy: TierPolicy,
    coordinator: MigrationCoordinator,
    scanner: CandidateScanner,
    reconciler: ReconciliationScanner,
}

impl LifecycleService {
    pub fn new(partitions: PartitionSet, settings: LifecycleSettings) -> Self {
        Self {
            policy: settings.policy,
            coordinator: MigrationCoordinator::new(partitions.clone(), settings.max_retries),
            scanner: CandidateScanner::new(
                partitions.clone(),
                settings.policy,
                settings.scan_batch_size,
            ),
            reconciler: ReconciliationScanner::new(partitions.clone(), settings.reconciler),
            partitions,
        }
    }

    /// Manual or scheduled migration; errors surface unchanged.
    pub async fn migrate(
        &self,
        id: Uuid,
        source_tier: Tier,
        target_tier: Tier,
    ) -> MigrationResult<ObjectRecord> {
        self.coordinator.migrate(id, source_tier, target_tier).await
    }

    pub async fn get_migration_candidates(&self) -> StorageResult<Vec<MigrationCandidate>> {
        self.scanner.scan().await
    }

    pub async fn run_reconciliation(&self) -> StorageResult<Vec<ReconciliationOutcome>> {
        self.reconciler.run().await
    }

    pub fn should_migrate(&self, record: &ObjectRecord, current_tier: Tier) -> TierDecision {
        self.policy.should_migrate(record, current_tier)
    }

    /// Tier verdict for a stored record.
    pub async fn tier_decision(
        &self,
        tier: Tier,
        id: Uuid,
    ) -> MigrationResult<(ObjectRecord, TierDecision)> {
        let record = self
            .partitions
            .get(tier)
            .find_by_id(id)
            .await?
            .ok_or(MigrationError::NotFound { id, tier })?;
        let decision = self.should_migrate(&record, tier);
        Ok((record, decision))
    }

    /// One pass of the migration driver: enumerate candidates, then migrate
    /// them strictly one at a time. Only a failure to enumerate fails the
    /// sweep; per-object failures are counted and left to the next sweep.
    pub async fn run_migration_sweep(&self) -> MigrationResult<SweepReport> {
        let candidates = self.get_migration_candidates().await?;
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        for candidate in candidates {
            let id = candidate.record.id;
            match self
                .migrate(id, candidate.source_tier, candidate.target_tier)
                .await
            {
                Ok(_) => report.migrated += 1,
                Err(err @ (MigrationError::AlreadyLocked { .. } | MigrationError::NotFound { .. })) => {
                    debug!("skipping `{}`: {}", candidate.record.name, err);
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        "sweep could not move `{}` {} -> {}: {}",
                        candidate.record.name, candidate.source_tier, candidate.target_tier, err
                    );
                    report.failed += 1;
                }
            }
        }

        if report.candidates > 0 {
            info!(
                "migration sweep: {} candidates, {} migrated, {} skipped, {} failed",
                report.candidates, report.migrated, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    /// Return a FAILED record to IDLE. `retry_attempts` is kept, so the record
    /// gets one more automatic attempt before it is parked again. Resetting an
    /// IDLE record is a no-op.
    pub async fn reset_failed(&self, tier: Tier, id: Uuid) -> MigrationResult<ObjectRecord> {
        let partition = self.partitions.get(tier);
        let failed = RecordFilter::status_and_lock(&[MigrationStatus::Failed], false);
        if let Some(reset) = partition
            .atomic_update(id, &failed, &RecordPatch::release(MigrationStatus::Idle))
            .await?
        {
            info!("reset FAILED `{}` in {} to IDLE", reset.name, tier);
            return Ok(reset);
        }

        match partition.find_by_id(id).await? {
            None => Err(MigrationError::NotFound { id, tier }),
            Some(record) if record.is_locked => Err(MigrationError::AlreadyLocked { id }),
            Some(record) => Ok(record),
        }
    }
}
