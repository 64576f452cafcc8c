//! Test utilities: record fixtures, in-memory partitions and a fault-injecting
//! store wrapper for exercising the migration failure paths.

use crate::models::{
    object::ObjectRecord,
    tier::{MigrationStatus, Tier},
};
use crate::services::digest::content_digest;
use crate::services::partition::{
    ObjectStore, PartitionSet, RecordFilter, RecordPatch, SqlitePartition, StorageError,
    StorageResult,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::time::Duration;
use uuid::Uuid;

/// A freshly ingested record: idle, unlocked, accessed now, checksum computed
/// from `content`. The id is a placeholder until a partition assigns one.
pub fn record(name: &str, content: &[u8]) -> ObjectRecord {
    let now = Utc::now();
    ObjectRecord {
        id: Uuid::nil(),
        name: name.to_string(),
        original_name: format!("{}.bin", name),
        content: Some(content.to_vec()),
        size_bytes: content.len() as i64,
        content_type: Some("application/octet-stream".into()),
        checksum: Some(content_digest(content)),
        source_checksum_before: None,
        target_checksum_after: None,
        migration_status: MigrationStatus::Idle,
        is_locked: false,
        locked_at: None,
        retry_attempts: 0,
        upload_date: now,
        last_access_date: Some(now),
        last_migration_date: None,
    }
}

pub async fn memory_partition(tier: Tier) -> Arc<SqlitePartition> {
    Arc::new(
        SqlitePartition::in_memory(tier)
            .await
            .expect("failed to create in-memory partition"),
    )
}

/// Three independent in-memory partitions.
pub async fn memory_partitions() -> PartitionSet {
    PartitionSet::new(
        memory_partition(Tier::Hot).await,
        memory_partition(Tier::Warm).await,
        memory_partition(Tier::Cold).await,
    )
}

/// Wraps a real partition and injects failures on demand. Every switch can be
/// flipped while the store is shared.
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    corrupt_inserts: AtomicBool,
    fail_inserts: AtomicBool,
    fail_deletes: AtomicBool,
    insert_delay_ms: AtomicU64,
    insert_calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            corrupt_inserts: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            insert_delay_ms: AtomicU64::new(0),
            insert_calls: AtomicUsize::new(0),
        })
    }

    /// Flip a byte of every stored payload while keeping the claimed checksum.
    pub fn corrupt_inserts(&self, on: bool) {
        self.corrupt_inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, on: bool) {
        self.fail_inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }

    pub fn delay_inserts(&self, delay: Duration) {
        self.insert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn unavailable(&self, op: &str) -> StorageError {
        StorageError::Unavailable {
            tier: self.inner.tier(),
            reason: format!("injected {} failure", op),
        }
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    fn tier(&self) -> Tier {
        self.inner.tier()
    }

    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<ObjectRecord>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_id_with_content(&self, id: Uuid) -> StorageResult<Option<ObjectRecord>> {
        self.inner.find_by_id_with_content(id).await
    }

    async fn atomic_update(
        &self,
        id: Uuid,
        precondition: &RecordFilter,
        patch: &RecordPatch,
    ) -> StorageResult<Option<ObjectRecord>> {
        self.inner.atomic_update(id, precondition, patch).await
    }

    async fn insert(&self, record: &ObjectRecord) -> StorageResult<Uuid> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(self.unavailable("insert"));
        }
        if self.corrupt_inserts.load(Ordering::SeqCst) {
            let mut tampered = record.clone();
            if let Some(content) = tampered.content.as_mut() {
                match content.first_mut() {
                    Some(byte) => *byte ^= 0xff,
                    None => content.push(0),
                }
            }
            return self.inner.insert(&tampered).await;
        }
        self.inner.insert(record).await
    }

    async fn delete_by_id(&self, id: Uuid) -> StorageResult<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(self.unavailable("delete"));
        }
        self.inner.delete_by_id(id).await
    }

    async fn query(&self, filter: &RecordFilter) -> StorageResult<Vec<ObjectRecord>> {
        self.inner.query(filter).await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.inner.ping().await
    }
}
