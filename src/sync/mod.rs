//! Record synchronization
//!
//! # Components
//!
//! - [`rate_limiter`]: Adaptive delay with exponential backoff on rate-limit signals
//! - [`http_client`]: Paginated upstream API client
//! - [`reconcile`]: Preload, upsert and orphan deletion against the record store
//! - [`compare`]: Field comparators used to decide whether an update is needed
//! - [`entity`]: Configuration-driven synchronizer for one entity type
//! - [`orchestrator`]: Job registry, composite plans and status tracking
//! - [`scheduler`]: Periodic triggers for composite plans
//!
//! # Example
//!
//! ```ignore
//! use record_sync::sync::{Orchestrator, RateLimiter, UpstreamClient};
//!
//! let orchestrator = Orchestrator::new(&config.orchestrator);
//! let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
//! let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
//! register_entities(&orchestrator, &config, upstream, limiter, db);
//!
//! orchestrator.trigger_sync("daily", CancellationToken::new()).await?;
//! ```

pub mod compare;
pub mod entity;
pub mod http_client;
pub mod orchestrator;
pub mod rate_limiter;
pub mod reconcile;
pub mod scheduler;
pub mod synchronizer;

pub use compare::FieldComparator;
pub use entity::{register_entities, EntityMapping, EntitySynchronizer, UpstreamPager};
pub use http_client::{Page, PageRequest, UpstreamClient, UpstreamSource};
pub use orchestrator::{Orchestrator, DAILY_SYNC, HISTORICAL_SYNC, WEEKLY_SYNC};
pub use rate_limiter::{RateLimiter, RateLimiterState};
pub use reconcile::{
    fields_differ, ComparableField, DuplicateKeyPolicy, ItemSource, NaturalKey, PassOutcome,
    ReconcileOptions, Reconciler, RecordTransform, UpsertOutcome,
};
pub use scheduler::SyncScheduler;
pub use synchronizer::{StatsCell, SyncContext, Synchronizer};
