//! HTTP handlers for the operational surface.

pub mod health_handlers;
pub mod migration_handlers;
