//! Core data models for the tiered object store.
//!
//! Records map to partition tables via `sqlx::FromRow` and serialize as JSON
//! via `serde` for the operational endpoints.

pub mod object;
pub mod tier;
