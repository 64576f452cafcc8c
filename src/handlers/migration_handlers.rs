//! HTTP handlers for the lifecycle operations: manual migration, candidate
//! listing, sweeps, reconciliation and FAILED resets. All work is delegated
//! to `LifecycleService`; manual requests go through the same lock-then-migrate
//! path as the scheduler and surface its errors unchanged.

use crate::{
    errors::AppError,
    models::{object::ObjectRecord, tier::Tier},
    services::{
        candidate_scanner::MigrationCandidate,
        lifecycle_service::{LifecycleService, SweepReport},
        reconciliation::ReconciliationOutcome,
        tier_classifier::TierDecision,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Query params accepted by the manual migrate endpoint.
#[derive(Debug, Deserialize)]
pub struct MigrateQuery {
    pub target: String,
}

#[derive(Debug, Serialize)]
pub struct TierDecisionResponse {
    pub record: ObjectRecord,
    pub current_tier: Tier,
    #[serde(flatten)]
    pub decision: TierDecision,
}

fn parse_tier(raw: &str) -> Result<Tier, AppError> {
    raw.parse::<Tier>()
        .map_err(|e| AppError::bad_request(e.to_string()))
}

fn parse_object_path(tier: &str, id: &str) -> Result<(Tier, Uuid), AppError> {
    let tier = parse_tier(tier)?;
    let id = Uuid::parse_str(id)
        .map_err(|_| AppError::bad_request(format!("invalid object id `{}`", id)))?;
    Ok((tier, id))
}

/// `GET /migrations/candidates`
pub async fn list_candidates(
    State(service): State<LifecycleService>,
) -> Result<Json<Vec<MigrationCandidate>>, AppError> {
    Ok(Json(service.get_migration_candidates().await?))
}

/// `POST /migrations/sweep`: one sweep now, outside the schedule.
pub async fn run_sweep(
    State(service): State<LifecycleService>,
) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(service.run_migration_sweep().await?))
}

/// `POST /reconciliation`
pub async fn run_reconciliation(
    State(service): State<LifecycleService>,
) -> Result<Json<Vec<ReconciliationOutcome>>, AppError> {
    Ok(Json(service.run_reconciliation().await?))
}

/// `GET /objects/{tier}/{id}/tier-decision`
pub async fn tier_decision(
    State(service): State<LifecycleService>,
    Path((tier, id)): Path<(String, String)>,
) -> Result<Json<TierDecisionResponse>, AppError> {
    let (tier, id) = parse_object_path(&tier, &id)?;
    let (record, decision) = service.tier_decision(tier, id).await?;
    Ok(Json(TierDecisionResponse {
        record,
        current_tier: tier,
        decision,
    }))
}

/// `POST /objects/{tier}/{id}/migrate?target={tier}`
///
/// Fails fast with 409 if another actor holds the object.
pub async fn migrate_object(
    State(service): State<LifecycleService>,
    Path((tier, id)): Path<(String, String)>,
    Query(query): Query<MigrateQuery>,
) -> Result<Json<ObjectRecord>, AppError> {
    let (source, id) = parse_object_path(&tier, &id)?;
    let target = parse_tier(&query.target)?;
    let record = service.migrate(id, source, target).await?;
    Ok(Json(record))
}

/// `POST /objects/{tier}/{id}/reset`: return a FAILED object to IDLE.
pub async fn reset_object(
    State(service): State<LifecycleService>,
    Path((tier, id)): Path<(String, String)>,
) -> Result<Json<ObjectRecord>, AppError> {
    let (tier, id) = parse_object_path(&tier, &id)?;
    Ok(Json(service.reset_failed(tier, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use axum::http::StatusCode;

    #[test]
    fn object_path_requires_known_tier_and_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_object_path("WARM", &id.to_string()).unwrap(),
            (Tier::Warm, id)
        );

        let err = parse_object_path("tape", &id.to_string()).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = parse_object_path("hot", "not-a-uuid").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("not-a-uuid"));
    }

    #[test]
    fn decision_response_flattens_verdict() {
        let record = record("a", b"a");
        let body = serde_json::to_value(TierDecisionResponse {
            record,
            current_tier: Tier::Hot,
            decision: TierDecision {
                migrate: true,
                target_tier: Tier::Cold,
            },
        })
        .unwrap();
        assert_eq!(body["migrate"], true);
        assert_eq!(body["target_tier"], "cold");
        assert_eq!(body["current_tier"], "hot");
    }
}
