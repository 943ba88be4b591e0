//! record-sync - Reconciles a local record store with a paginated upstream API
//!
//! This crate pulls entity collections from a rate-limited upstream source,
//! reconciles them against a SQLite record store (create, update, skip,
//! delete orphans) and runs the per-entity jobs in dependency order.

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod server;
pub mod sync;
pub mod telemetry;
