use crate::services::{
    candidate_scanner::DEFAULT_SCAN_BATCH_SIZE,
    lifecycle_service::LifecycleSettings,
    migration_coordinator::DEFAULT_MAX_RETRIES,
    reconciliation::ReconcilerConfig,
    scheduler::BackoffPolicy,
    tier_classifier::TierPolicy,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding one SQLite database per tier.
    pub data_dir: PathBuf,
    pub sweep_interval: Duration,
    pub reconcile_interval: Duration,
    pub max_retries: i64,
    pub backoff: BackoffPolicy,
    pub stale_lock_after: Duration,
    pub recency_window: Duration,
    pub scan_batch_size: usize,
    pub policy: TierPolicy,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Tiered object-store lifecycle manager")]
pub struct Args {
    /// Host to bind to (overrides TIER_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TIER_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for the tier partitions (overrides TIER_STORE_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Seconds between migration sweeps (overrides TIER_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Seconds between reconciliation passes (overrides TIER_STORE_RECONCILE_INTERVAL_SECS)
    #[arg(long)]
    pub reconcile_interval_secs: Option<u64>,

    /// Failed attempts before an object is parked (overrides TIER_STORE_MAX_RETRIES)
    #[arg(long)]
    pub max_retries: Option<i64>,

    /// Tries per sweep tick before waiting for the next one (overrides TIER_STORE_BACKOFF_ATTEMPTS)
    #[arg(long)]
    pub backoff_attempts: Option<u32>,

    /// First backoff delay in seconds, doubled per try (overrides TIER_STORE_BACKOFF_BASE_SECS)
    #[arg(long)]
    pub backoff_base_secs: Option<u64>,

    /// Lock age after which reconciliation treats a record as stuck (overrides TIER_STORE_STALE_LOCK_SECS)
    #[arg(long)]
    pub stale_lock_secs: Option<u64>,

    /// Window for matching an interrupted copy to its source (overrides TIER_STORE_RECENCY_WINDOW_SECS)
    #[arg(long)]
    pub recency_window_secs: Option<u64>,

    /// Records examined per partition per scan (overrides TIER_STORE_SCAN_BATCH_SIZE)
    #[arg(long)]
    pub scan_batch_size: Option<usize>,

    /// Maximum days since last access for HOT (overrides TIER_STORE_HOT_DAYS)
    #[arg(long)]
    pub hot_days: Option<i64>,

    /// Maximum days since last access for WARM (overrides TIER_STORE_WARM_DAYS)
    #[arg(long)]
    pub warm_days: Option<i64>,

    /// Create partition schemas and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("TIER_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("TIER_STORE_PORT", 3000u16)?;
        let env_data_dir = env_or("TIER_STORE_DATA_DIR", PathBuf::from("./data/tiers"))?;
        let env_sweep = env_or("TIER_STORE_SWEEP_INTERVAL_SECS", 20u64)?;
        let env_reconcile = env_or("TIER_STORE_RECONCILE_INTERVAL_SECS", 300u64)?;
        let env_retries = env_or("TIER_STORE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let env_backoff_attempts = env_or("TIER_STORE_BACKOFF_ATTEMPTS", 3u32)?;
        let env_backoff_base = env_or("TIER_STORE_BACKOFF_BASE_SECS", 60u64)?;
        let env_stale = env_or("TIER_STORE_STALE_LOCK_SECS", 600u64)?;
        let env_window = env_or("TIER_STORE_RECENCY_WINDOW_SECS", 600u64)?;
        let env_batch = env_or("TIER_STORE_SCAN_BATCH_SIZE", DEFAULT_SCAN_BATCH_SIZE)?;
        let defaults = TierPolicy::default();
        let env_hot_days = env_or("TIER_STORE_HOT_DAYS", defaults.hot_max_age_days)?;
        let env_warm_days = env_or("TIER_STORE_WARM_DAYS", defaults.warm_max_age_days)?;

        // --- Merge ---
        let policy = TierPolicy {
            hot_max_age_days: args.hot_days.unwrap_or(env_hot_days),
            warm_max_age_days: args.warm_days.unwrap_or(env_warm_days),
        };
        if policy.hot_max_age_days < 0 || policy.warm_max_age_days < policy.hot_max_age_days {
            anyhow::bail!(
                "tier thresholds must satisfy 0 <= hot days ({}) <= warm days ({})",
                policy.hot_max_age_days,
                policy.warm_max_age_days
            );
        }

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            data_dir: args.data_dir.unwrap_or(env_data_dir),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_sweep).max(1)),
            reconcile_interval: Duration::from_secs(
                args.reconcile_interval_secs.unwrap_or(env_reconcile).max(1),
            ),
            max_retries: args.max_retries.unwrap_or(env_retries).max(1),
            backoff: BackoffPolicy {
                max_attempts: args.backoff_attempts.unwrap_or(env_backoff_attempts).max(1),
                base_delay: Duration::from_secs(args.backoff_base_secs.unwrap_or(env_backoff_base)),
            },
            stale_lock_after: Duration::from_secs(args.stale_lock_secs.unwrap_or(env_stale)),
            recency_window: Duration::from_secs(args.recency_window_secs.unwrap_or(env_window)),
            scan_batch_size: args.scan_batch_size.unwrap_or(env_batch).max(1),
            policy,
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lifecycle_settings(&self) -> Result<LifecycleSettings> {
        Ok(LifecycleSettings {
            policy: self.policy,
            max_retries: self.max_retries,
            scan_batch_size: self.scan_batch_size,
            reconciler: ReconcilerConfig {
                stale_after: chrono::Duration::from_std(self.stale_lock_after)
                    .context("stale lock bound out of range")?,
                recency_window: chrono::Duration::from_std(self.recency_window)
                    .context("recency window out of range")?,
                batch_size: self.scan_batch_size,
            },
        })
    }
}
