//! Selection of idle objects sitting in the wrong tier.

use crate::models::{
    object::ObjectRecord,
    tier::{MigrationStatus, Tier},
};
use crate::services::{
    partition::{ObjectStore, PartitionSet, RecordFilter, StorageResult},
    tier_classifier::TierPolicy,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct MigrationCandidate {
    pub record: ObjectRecord,
    pub source_tier: Tier,
    pub target_tier: Tier,
}

#[derive(Clone)]
pub struct CandidateScanner {
    partitions: PartitionSet,
    policy: TierPolicy,
    batch_size: usize,
}

impl CandidateScanner {
    pub fn new(partitions: PartitionSet, policy: TierPolicy, batch_size: usize) -> Self {
        Self {
            partitions,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn scan(&self) -> StorageResult<Vec<MigrationCandidate>> {
        self.scan_at(Utc::now()).await
    }

    /// Only IDLE, unlocked records are considered; locked and FAILED records
    /// never become candidates. The tier's access band is part of the query,
    /// so the per-partition `batch_size` bound counts misplaced records only
    /// and correctly placed ones can never crowd them out.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> StorageResult<Vec<MigrationCandidate>> {
        let mut candidates = Vec::new();
        for (tier, partition) in self.partitions.iter() {
            let filter = RecordFilter {
                outside_access_band: Some(self.policy.access_band_at(tier, now)),
                ..RecordFilter::status_and_lock(&[MigrationStatus::Idle], false)
            }
            .with_limit(self.batch_size);

            let misplaced = partition.query(&filter).await?;
            let examined = misplaced.len();
            for record in misplaced {
                let decision = self.policy.should_migrate_at(&record, tier, now);
                if decision.migrate {
                    candidates.push(MigrationCandidate {
                        record,
                        source_tier: tier,
                        target_tier: decision.target_tier,
                    });
                }
            }
            debug!("{} partition: {} records outside its access band", tier, examined);
        }
        Ok(candidates)
    }
}
