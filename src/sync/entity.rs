//! Configuration-driven entity synchronizer
//!
//! Each entry under `entities:` in the configuration becomes one
//! `EntitySynchronizer`: it pages through an upstream resource, maps every
//! item onto the configured target fields and reconciles the result against
//! the store collection.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, EntityConfig, FieldMappingConfig};
use crate::database::Database;
use crate::error::{SyncError, TransformError};
use crate::models::{RecordData, Scope, Stats};
use crate::sync::http_client::{PageRequest, UpstreamSource};
use crate::sync::orchestrator::Orchestrator;
use crate::sync::rate_limiter::RateLimiter;
use crate::sync::reconcile::{
    ComparableField, DuplicateKeyPolicy, ItemSource, NaturalKey, ReconcileOptions, Reconciler,
    RecordTransform,
};
use crate::sync::synchronizer::{StatsCell, SyncContext, Synchronizer};

/// Field mapping and key derivation for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    key_fields: Vec<String>,
    fields: Vec<(String, FieldMappingConfig)>,
    year_scoped: bool,
}

impl EntityMapping {
    /// Build the mapping from an entity definition
    pub fn from_config(config: &EntityConfig) -> Self {
        Self {
            key_fields: config.key_fields.clone(),
            fields: config
                .fields
                .iter()
                .map(|(name, mapping)| (name.clone(), mapping.clone()))
                .collect(),
            year_scoped: config.year_scoped,
        }
    }

    /// Fields that take part in the upsert decision
    pub fn comparable(&self) -> Vec<ComparableField> {
        self.fields
            .iter()
            .filter(|(_, mapping)| mapping.compare_enabled)
            .map(|(name, mapping)| ComparableField::new(name.clone(), mapping.compare))
            .collect()
    }

    /// Whether passes are scoped to a year
    pub fn year_scoped(&self) -> bool {
        self.year_scoped
    }
}

impl RecordTransform for EntityMapping {
    fn transform(&self, item: &Value) -> Result<RecordData, TransformError> {
        if !item.is_object() {
            return Err(TransformError::NotAnObject);
        }

        let mut data = RecordData::new();
        for (target, mapping) in &self.fields {
            let value = lookup(item, &mapping.source).filter(|v| !v.is_null());
            if value.is_none() && mapping.required {
                return Err(TransformError::MissingField(target.clone()));
            }
            data.insert(target.clone(), value.cloned().unwrap_or(Value::Null));
        }

        Ok(data)
    }

    fn natural_key(
        &self,
        data: &RecordData,
        year: Option<i32>,
    ) -> Result<NaturalKey, TransformError> {
        let mut parts = Vec::with_capacity(self.key_fields.len() + 1);
        for field in &self.key_fields {
            parts.push(key_part(field, data.get(field))?);
        }
        if self.year_scoped {
            parts.push(year.map(|y| y.to_string()).unwrap_or_default());
        }
        Ok(NaturalKey::compose(parts))
    }
}

/// Resolve a JSON pointer (`/a/0/b`) or a dotted path (`a.0.b`)
fn lookup<'v>(item: &'v Value, source: &str) -> Option<&'v Value> {
    if source.starts_with('/') {
        return item.pointer(source);
    }

    source.split('.').try_fold(item, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn key_part(field: &str, value: Option<&Value>) -> Result<String, TransformError> {
    match value {
        None | Some(Value::Null) => Err(TransformError::MissingField(field.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => Err(TransformError::InvalidKey {
            field: field.to_string(),
            reason: "empty string".to_string(),
        }),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(_) => Err(TransformError::InvalidKey {
            field: field.to_string(),
            reason: "nested value".to_string(),
        }),
    }
}

/// Offset pager over one upstream resource
///
/// Every page fetch goes through the rate limiter.
pub struct UpstreamPager<'a> {
    upstream: &'a dyn UpstreamSource,
    limiter: &'a RateLimiter,
    resource: &'a str,
    next: Option<PageRequest>,
}

impl<'a> UpstreamPager<'a> {
    /// Pager starting at offset 0
    pub fn new(
        upstream: &'a dyn UpstreamSource,
        limiter: &'a RateLimiter,
        resource: &'a str,
        page_size: usize,
        year: Option<i32>,
    ) -> Self {
        Self {
            upstream,
            limiter,
            resource,
            next: Some(PageRequest::first(page_size.max(1), year)),
        }
    }
}

#[async_trait]
impl ItemSource for UpstreamPager<'_> {
    async fn next_page(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Value>>, SyncError> {
        let Some(request) = self.next else {
            return Ok(None);
        };

        let upstream = self.upstream;
        let resource = self.resource;
        let page = self
            .limiter
            .execute_with_retry(cancel, || upstream.fetch_page(resource, &request))
            .await?;

        self.next = if page.has_more && !page.items.is_empty() {
            Some(request.next(page.items.len()))
        } else {
            None
        };

        Ok(Some(page.items))
    }
}

/// Synchronizer for one configured entity
pub struct EntitySynchronizer {
    name: String,
    resource: String,
    collection: String,
    page_size: usize,
    duplicate_policy: DuplicateKeyPolicy,
    mapping: EntityMapping,
    upstream: Arc<dyn UpstreamSource>,
    limiter: Arc<RateLimiter>,
    db: Arc<dyn Database>,
    stats: StatsCell,
}

impl EntitySynchronizer {
    /// Create a synchronizer for a configured entity
    pub fn new(
        name: impl Into<String>,
        config: &EntityConfig,
        default_page_size: usize,
        upstream: Arc<dyn UpstreamSource>,
        limiter: Arc<RateLimiter>,
        db: Arc<dyn Database>,
    ) -> Self {
        let name = name.into();
        Self {
            collection: config.collection.clone().unwrap_or_else(|| name.clone()),
            resource: config.resource.clone(),
            page_size: config.page_size.unwrap_or(default_page_size),
            duplicate_policy: config.duplicate_policy,
            mapping: EntityMapping::from_config(config),
            name,
            upstream,
            limiter,
            db,
            stats: StatsCell::default(),
        }
    }

    /// Year a pass with the given context covers
    ///
    /// Year-scoped entities default to the current year; other entities
    /// always reconcile the whole collection.
    fn pass_year(&self, ctx: &SyncContext) -> Option<i32> {
        if self.mapping.year_scoped() {
            Some(ctx.year.unwrap_or_else(|| Utc::now().year()))
        } else {
            if let Some(year) = ctx.year {
                debug!(job = %self.name, year, "Entity is not year-scoped, ignoring year");
            }
            None
        }
    }
}

#[async_trait]
impl Synchronizer for EntitySynchronizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sync(&self, ctx: &SyncContext) -> Result<(), SyncError> {
        self.stats.reset();

        let year = self.pass_year(ctx);
        let options = ReconcileOptions::new(self.collection.clone())
            .with_scope(Scope::from_year(year))
            .with_comparable(self.mapping.comparable())
            .with_duplicate_policy(self.duplicate_policy);

        info!(
            job = %self.name,
            resource = %self.resource,
            collection = %self.collection,
            year = ?year,
            "Starting entity sync"
        );

        let reconciler = Reconciler::new(self.db.clone(), options);
        let mut pager = UpstreamPager::new(
            self.upstream.as_ref(),
            self.limiter.as_ref(),
            &self.resource,
            self.page_size,
            year,
        );

        let outcome = reconciler.run(&mut pager, &self.mapping, &ctx.cancel).await;
        self.stats.set(outcome.stats);
        outcome.result
    }

    fn stats(&self) -> Stats {
        self.stats.get()
    }
}

/// Register one synchronizer per configured entity
///
/// Returns the number of registered entities.
pub fn register_entities(
    orchestrator: &Orchestrator,
    config: &Config,
    upstream: Arc<dyn UpstreamSource>,
    limiter: Arc<RateLimiter>,
    db: Arc<dyn Database>,
) -> usize {
    for (name, entity) in &config.entities {
        let synchronizer = EntitySynchronizer::new(
            name.clone(),
            entity,
            config.upstream.page_size,
            upstream.clone(),
            limiter.clone(),
            db.clone(),
        );
        orchestrator.register_service(name.clone(), Arc::new(synchronizer));
    }

    debug!(count = config.entities.len(), "Registered entity synchronizers");
    config.entities.len()
}
