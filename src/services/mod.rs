//! The migration engine and the pieces it is wired from, leaves first.

pub mod digest;
pub mod tier_classifier;
pub mod partition;
pub mod migration_coordinator;
pub mod candidate_scanner;
pub mod reconciliation;
pub mod scheduler;
pub mod lifecycle_service;
