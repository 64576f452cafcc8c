//! Defines routes for the lifecycle manager's operational surface.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz` — liveness
//!   - `GET  /readyz` — pings every tier partition
//!
//! - **Engine-wide**
//!   - `GET  /migrations/candidates` — objects sitting in the wrong tier
//!   - `POST /migrations/sweep` — run one migration sweep now
//!   - `POST /reconciliation` — run one reconciliation pass now
//!
//! - **Per object** (`{tier}` is `hot`, `warm` or `cold`)
//!   - `GET  /objects/{tier}/{id}/tier-decision` — classifier verdict
//!   - `POST /objects/{tier}/{id}/migrate?target={tier}` — manual migration
//!   - `POST /objects/{tier}/{id}/reset` — return a FAILED object to IDLE

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        migration_handlers::{
            list_candidates, migrate_object, reset_object, run_reconciliation, run_sweep,
            tier_decision,
        },
    },
    services::lifecycle_service::LifecycleService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router, carrying `LifecycleService` as shared state.
pub fn routes() -> Router<LifecycleService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Engine-wide routes
        .route("/migrations/candidates", get(list_candidates))
        .route("/migrations/sweep", post(run_sweep))
        .route("/reconciliation", post(run_reconciliation))
        // Object-level routes
        .route("/objects/{tier}/{id}/tier-decision", get(tier_decision))
        .route("/objects/{tier}/{id}/migrate", post(migrate_object))
        .route("/objects/{tier}/{id}/reset", post(reset_object))
}
