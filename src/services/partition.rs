//! src/services/partition.rs
//!
//! Partition: one independently addressable object store per tier. Each
//! partition owns its own SQLite database and there is no primitive
//! spanning two partitions, so moving an object requires the application-level
//! protocol in `migration_coordinator`.
//!
//! The only concurrency primitive offered is `atomic_update`: a single
//! `UPDATE ... WHERE <precondition> RETURNING` statement.

use crate::models::{
    object::ObjectRecord,
    tier::{MigrationStatus, Tier},
};
use crate::services::tier_classifier::AccessBand;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{io, path::Path, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record `{0}` has no content to store")]
    MissingContent(String),
    #[error("{tier} partition unavailable: {reason}")]
    Unavailable { tier: Tier, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Upper bound applied to queries that do not set their own limit.
const DEFAULT_QUERY_LIMIT: usize = 1000;

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

const METADATA_COLUMNS: &str = "id, name, original_name, NULL AS content, size_bytes, \
     content_type, checksum, source_checksum_before, target_checksum_after, \
     migration_status, is_locked, locked_at, retry_attempts, upload_date, \
     last_access_date, last_migration_date";

const FULL_COLUMNS: &str = "id, name, original_name, content, size_bytes, \
     content_type, checksum, source_checksum_before, target_checksum_after, \
     migration_status, is_locked, locked_at, retry_attempts, upload_date, \
     last_access_date, last_migration_date";

/// Field changes applied by `atomic_update`. `None` leaves a column untouched;
/// nullable columns use `Some(None)` to clear.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub migration_status: Option<MigrationStatus>,
    pub is_locked: Option<bool>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub checksum: Option<Option<String>>,
    pub source_checksum_before: Option<Option<String>>,
    pub target_checksum_after: Option<Option<String>>,
    pub last_migration_date: Option<Option<DateTime<Utc>>>,
    /// Adds one to `retry_attempts` inside the same statement.
    pub increment_retry_attempts: bool,
}

impl RecordPatch {
    /// Take the migration lock.
    pub fn lock(at: DateTime<Utc>) -> Self {
        Self {
            migration_status: Some(MigrationStatus::Processing),
            is_locked: Some(true),
            locked_at: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Drop the lock and park the record in `status`.
    pub fn release(status: MigrationStatus) -> Self {
        Self {
            migration_status: Some(status),
            is_locked: Some(false),
            locked_at: Some(None),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.migration_status.is_none()
            && self.is_locked.is_none()
            && self.locked_at.is_none()
            && self.checksum.is_none()
            && self.source_checksum_before.is_none()
            && self.target_checksum_after.is_none()
            && self.last_migration_date.is_none()
            && !self.increment_retry_attempts
    }
}

/// Row selection used both for bounded queries and as the precondition of
/// `atomic_update`. Empty vectors and `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub statuses: Vec<MigrationStatus>,
    pub is_locked: Option<bool>,
    pub name: Option<String>,
    /// Matches when the stored checksum equals any entry.
    pub checksums: Vec<String>,
    /// Matches records whose last access falls outside the band.
    pub outside_access_band: Option<AccessBand>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn status_and_lock(statuses: &[MigrationStatus], is_locked: bool) -> Self {
        Self {
            statuses: statuses.to_vec(),
            is_locked: Some(is_locked),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Capability set of a single tier partition.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn tier(&self) -> Tier;

    /// Metadata-only read; `content` is `None`.
    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<ObjectRecord>>;

    async fn find_by_id_with_content(&self, id: Uuid) -> StorageResult<Option<ObjectRecord>>;

    /// Apply `patch` to record `id` only if it still matches `precondition`,
    /// as one atomic statement. `None` means absent or precondition failed.
    async fn atomic_update(
        &self,
        id: Uuid,
        precondition: &RecordFilter,
        patch: &RecordPatch,
    ) -> StorageResult<Option<ObjectRecord>>;

    /// Store `record` (content required) under a freshly assigned id.
    async fn insert(&self, record: &ObjectRecord) -> StorageResult<Uuid>;

    /// Returns whether a row was removed.
    async fn delete_by_id(&self, id: Uuid) -> StorageResult<bool>;

    /// Bounded metadata query.
    async fn query(&self, filter: &RecordFilter) -> StorageResult<Vec<ObjectRecord>>;

    /// Cheap readiness probe.
    async fn ping(&self) -> StorageResult<()>;
}

/// SQLite-backed partition. One database file per tier.
#[derive(Clone)]
pub struct SqlitePartition {
    tier: Tier,

    /// Connection pool for this partition only.
    pub db: Arc<SqlitePool>,
}

impl SqlitePartition {
    pub fn new(tier: Tier, db: Arc<SqlitePool>) -> Self {
        Self { tier, db }
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn connect(tier: Tier, path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        debug!("{} partition connected at {}", tier, path.display());
        Ok(Self::new(tier, Arc::new(pool)))
    }

    /// Private in-memory database. A single connection that never expires keeps
    /// the data alive for the pool's lifetime.
    #[cfg(test)]
    pub async fn in_memory(tier: Tier) -> StorageResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let partition = Self::new(tier, Arc::new(pool));
        partition.migrate().await?;
        Ok(partition)
    }

    /// Run the embedded schema statements. Idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!(
            "Running {} migration statements on {} partition...",
            statements.len(),
            self.tier
        );

        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn fetch_one_by_id(
        &self,
        id: Uuid,
        columns: &str,
    ) -> StorageResult<Option<ObjectRecord>> {
        let sql = format!("SELECT {} FROM objects WHERE id = ?", columns);
        let record = sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(record)
    }
}

/// Append `AND ...` clauses for every populated filter field.
fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &RecordFilter) {
    if !filter.statuses.is_empty() {
        builder.push(" AND migration_status IN (");
        let mut list = builder.separated(", ");
        for status in &filter.statuses {
            list.push_bind(*status);
        }
        builder.push(")");
    }

    if let Some(locked) = filter.is_locked {
        builder.push(" AND is_locked = ");
        builder.push_bind(locked);
    }

    if let Some(name) = &filter.name {
        builder.push(" AND name = ");
        builder.push_bind(name.clone());
    }

    if !filter.checksums.is_empty() {
        builder.push(" AND checksum IN (");
        let mut list = builder.separated(", ");
        for checksum in &filter.checksums {
            list.push_bind(checksum.clone());
        }
        builder.push(")");
    }

    // Timestamps are compared through julianday() so that differing text
    // precision cannot reorder them.
    if let Some(band) = &filter.outside_access_band {
        builder.push(" AND NOT (");
        if band.never_accessed {
            builder.push("last_access_date IS NULL OR ");
        }
        builder.push("(last_access_date IS NOT NULL");
        if let Some(after) = band.after {
            builder.push(" AND julianday(last_access_date) > julianday(");
            builder.push_bind(after);
            builder.push(")");
        }
        if let Some(until) = band.until {
            builder.push(" AND julianday(last_access_date) <= julianday(");
            builder.push_bind(until);
            builder.push(")");
        }
        builder.push("))");
    }
}

#[async_trait]
impl ObjectStore for SqlitePartition {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn find_by_id(&self, id: Uuid) -> StorageResult<Option<ObjectRecord>> {
        self.fetch_one_by_id(id, METADATA_COLUMNS).await
    }

    async fn find_by_id_with_content(&self, id: Uuid) -> StorageResult<Option<ObjectRecord>> {
        self.fetch_one_by_id(id, FULL_COLUMNS).await
    }

    async fn atomic_update(
        &self,
        id: Uuid,
        precondition: &RecordFilter,
        patch: &RecordPatch,
    ) -> StorageResult<Option<ObjectRecord>> {
        if patch.is_empty() {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM objects WHERE id = ",
                METADATA_COLUMNS
            ));
            builder.push_bind(id);
            push_filter(&mut builder, precondition);
            let record = builder
                .build_query_as::<ObjectRecord>()
                .fetch_optional(&*self.db)
                .await?;
            return Ok(record);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE objects SET ");
        {
            let mut set = builder.separated(", ");
            if let Some(status) = patch.migration_status {
                set.push("migration_status = ").push_bind_unseparated(status);
            }
            if let Some(locked) = patch.is_locked {
                set.push("is_locked = ").push_bind_unseparated(locked);
            }
            if let Some(locked_at) = patch.locked_at {
                set.push("locked_at = ").push_bind_unseparated(locked_at);
            }
            if let Some(checksum) = &patch.checksum {
                set.push("checksum = ")
                    .push_bind_unseparated(checksum.clone());
            }
            if let Some(before) = &patch.source_checksum_before {
                set.push("source_checksum_before = ")
                    .push_bind_unseparated(before.clone());
            }
            if let Some(after) = &patch.target_checksum_after {
                set.push("target_checksum_after = ")
                    .push_bind_unseparated(after.clone());
            }
            if let Some(migrated) = patch.last_migration_date {
                set.push("last_migration_date = ")
                    .push_bind_unseparated(migrated);
            }
            if patch.increment_retry_attempts {
                set.push("retry_attempts = retry_attempts + 1");
            }
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        push_filter(&mut builder, precondition);
        builder.push(" RETURNING ");
        builder.push(METADATA_COLUMNS);

        let record = builder
            .build_query_as::<ObjectRecord>()
            .fetch_optional(&*self.db)
            .await?;
        Ok(record)
    }

    async fn insert(&self, record: &ObjectRecord) -> StorageResult<Uuid> {
        let content = record
            .content
            .as_deref()
            .ok_or_else(|| StorageError::MissingContent(record.name.clone()))?;
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO objects (
                id, name, original_name, content, size_bytes, content_type,
                checksum, source_checksum_before, target_checksum_after,
                migration_status, is_locked, locked_at, retry_attempts,
                upload_date, last_access_date, last_migration_date
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&record.name)
        .bind(&record.original_name)
        .bind(content)
        .bind(content.len() as i64)
        .bind(record.content_type.as_deref())
        .bind(record.checksum.as_deref())
        .bind(record.source_checksum_before.as_deref())
        .bind(record.target_checksum_after.as_deref())
        .bind(record.migration_status)
        .bind(record.is_locked)
        .bind(record.locked_at)
        .bind(record.retry_attempts)
        .bind(record.upload_date)
        .bind(record.last_access_date)
        .bind(record.last_migration_date)
        .execute(&*self.db)
        .await?;

        debug!("inserted `{}` into {} partition as {}", record.name, self.tier, id);
        Ok(id)
    }

    async fn delete_by_id(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, filter: &RecordFilter) -> StorageResult<Vec<ObjectRecord>> {
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, DEFAULT_QUERY_LIMIT);

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM objects WHERE 1 = 1",
            METADATA_COLUMNS
        ));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY upload_date ASC, id ASC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder
            .build_query_as::<ObjectRecord>()
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    async fn ping(&self) -> StorageResult<()> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
        {
            Ok(1) => Ok(()),
            Ok(v) => Err(StorageError::Unavailable {
                tier: self.tier,
                reason: format!("unexpected result: {}", v),
            }),
            Err(e) => Err(StorageError::Sqlx(e)),
        }
    }
}

/// The three tier partitions, addressed by tier.
#[derive(Clone)]
pub struct PartitionSet {
    hot: Arc<dyn ObjectStore>,
    warm: Arc<dyn ObjectStore>,
    cold: Arc<dyn ObjectStore>,
}

impl PartitionSet {
    pub fn new(
        hot: Arc<dyn ObjectStore>,
        warm: Arc<dyn ObjectStore>,
        cold: Arc<dyn ObjectStore>,
    ) -> Self {
        debug_assert_eq!(hot.tier(), Tier::Hot);
        debug_assert_eq!(warm.tier(), Tier::Warm);
        debug_assert_eq!(cold.tier(), Tier::Cold);
        Self { hot, warm, cold }
    }

    /// Open one SQLite database per tier beneath `data_dir` and ensure each
    /// carries the schema.
    pub async fn open_sqlite(data_dir: &Path) -> StorageResult<Self> {
        let mut opened = Vec::with_capacity(Tier::ALL.len());
        for tier in Tier::ALL {
            let path = data_dir.join(format!("{}.db", tier));
            let partition = SqlitePartition::connect(tier, &path).await?;
            partition.migrate().await?;
            opened.push(Arc::new(partition) as Arc<dyn ObjectStore>);
        }
        let cold = opened.pop();
        let warm = opened.pop();
        let hot = opened.pop();
        match (hot, warm, cold) {
            (Some(hot), Some(warm), Some(cold)) => Ok(Self::new(hot, warm, cold)),
            _ => Err(StorageError::Io(io::Error::other("tier partitions missing"))),
        }
    }

    pub fn get(&self, tier: Tier) -> &Arc<dyn ObjectStore> {
        match tier {
            Tier::Hot => &self.hot,
            Tier::Warm => &self.warm,
            Tier::Cold => &self.cold,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tier, &Arc<dyn ObjectStore>)> {
        Tier::ALL.into_iter().map(move |tier| (tier, self.get(tier)))
    }
}
