//! Access-recency tier decision.

use crate::models::{object::ObjectRecord, tier::Tier};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

const DEFAULT_HOT_MAX_AGE_DAYS: i64 = 30;
const DEFAULT_WARM_MAX_AGE_DAYS: i64 = 90;

/// Age thresholds, in whole days since last access.
///
/// `age <= hot_max_age_days` is HOT, `age <= warm_max_age_days` is WARM,
/// anything older (or never accessed) is COLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub hot_max_age_days: i64,
    pub warm_max_age_days: i64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            hot_max_age_days: DEFAULT_HOT_MAX_AGE_DAYS,
            warm_max_age_days: DEFAULT_WARM_MAX_AGE_DAYS,
        }
    }
}

/// Outcome of comparing a record's partition with its classified tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierDecision {
    pub migrate: bool,
    pub target_tier: Tier,
}

/// Last-access instants that classify into one tier: `after < t <= until`,
/// an open end where `None`. `never_accessed` says whether a record without
/// an access date belongs to the tier as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessBand {
    pub after: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub never_accessed: bool,
}

/// Newest access instant that is more than `max_age_days` whole days old.
fn age_cutoff(now: DateTime<Utc>, max_age_days: i64) -> DateTime<Utc> {
    Duration::try_days(max_age_days.saturating_add(1))
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl TierPolicy {
    /// Classify against `now`. Age is counted in elapsed whole
    /// days; a missing access date is treated as infinitely old.
    pub fn classify_at(&self, last_access: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Tier {
        let Some(accessed) = last_access else {
            return Tier::Cold;
        };
        let age_days = (now - accessed).num_days().max(0);
        if age_days <= self.hot_max_age_days {
            Tier::Hot
        } else if age_days <= self.warm_max_age_days {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    /// The access band `classify_at` maps to `tier`. Whole-day truncation
    /// means `age <= n` holds exactly when less than `n + 1` days elapsed.
    pub fn access_band_at(&self, tier: Tier, now: DateTime<Utc>) -> AccessBand {
        let hot_cutoff = age_cutoff(now, self.hot_max_age_days);
        let warm_cutoff = age_cutoff(now, self.warm_max_age_days);
        match tier {
            Tier::Hot => AccessBand {
                after: Some(hot_cutoff),
                until: None,
                never_accessed: false,
            },
            Tier::Warm => AccessBand {
                after: Some(warm_cutoff),
                until: Some(hot_cutoff),
                never_accessed: false,
            },
            Tier::Cold => AccessBand {
                after: None,
                until: Some(warm_cutoff),
                never_accessed: true,
            },
        }
    }

    pub fn should_migrate(&self, record: &ObjectRecord, current: Tier) -> TierDecision {
        self.should_migrate_at(record, current, Utc::now())
    }

    pub fn should_migrate_at(
        &self,
        record: &ObjectRecord,
        current: Tier,
        now: DateTime<Utc>,
    ) -> TierDecision {
        let target_tier = self.classify_at(record.last_access_date, now);
        TierDecision {
            migrate: target_tier != current,
            target_tier,
        }
    }
}
