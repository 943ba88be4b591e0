//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use record_sync::config::{Config, EntityConfig, FieldMappingConfig, RateLimitConfig};
use record_sync::database::{Database, SqliteDatabase};
use record_sync::server::AppState;
use record_sync::sync::{
    register_entities, DuplicateKeyPolicy, FieldComparator, Orchestrator, RateLimiter,
    UpstreamClient,
};

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

fn field(source: &str, compare: FieldComparator, required: bool) -> FieldMappingConfig {
    FieldMappingConfig {
        source: source.to_string(),
        compare,
        required,
        compare_enabled: true,
    }
}

/// `persons` entity keyed by upstream id
pub fn persons_entity() -> EntityConfig {
    let mut fields = BTreeMap::new();
    fields.insert(
        "person_id".to_string(),
        field("/id", FieldComparator::Numeric, true),
    );
    fields.insert(
        "first_name".to_string(),
        field("name.first", FieldComparator::Text, false),
    );
    fields.insert(
        "grade".to_string(),
        field("/grade", FieldComparator::Numeric, false),
    );

    EntityConfig {
        resource: "persons".to_string(),
        collection: None,
        key_fields: vec!["person_id".to_string()],
        fields,
        year_scoped: false,
        duplicate_policy: DuplicateKeyPolicy::LastWriteWins,
        page_size: Some(2),
    }
}

/// Year-scoped `bunks` entity keyed by upstream id
pub fn bunks_entity() -> EntityConfig {
    let mut fields = BTreeMap::new();
    fields.insert(
        "bunk_id".to_string(),
        field("/id", FieldComparator::Numeric, true),
    );
    fields.insert(
        "name".to_string(),
        field("/name", FieldComparator::Text, false),
    );

    EntityConfig {
        resource: "bunks".to_string(),
        collection: None,
        key_fields: vec!["bunk_id".to_string()],
        fields,
        year_scoped: true,
        duplicate_policy: DuplicateKeyPolicy::LastWriteWins,
        page_size: None,
    }
}

/// Configuration pointing at a mock upstream with no pacing delays
pub fn create_test_config(upstream_uri: &str) -> Config {
    let mut config = Config::default();
    config.upstream.base_url = upstream_uri.to_string();
    config.upstream.timeout_secs = 5;
    config.rate_limit = RateLimitConfig {
        api_delay_ms: 0,
        backoff_multiplier: 2.0,
        max_delay_ms: 0,
        max_attempts: 3,
        jitter: false,
    };
    config.orchestrator.job_spacing_ms = 0;
    config.orchestrator.plans = BTreeMap::from([
        (
            "daily".to_string(),
            vec!["persons".to_string(), "bunks".to_string()],
        ),
        (
            "historical".to_string(),
            vec!["persons".to_string(), "bunks".to_string()],
        ),
    ]);
    config
        .entities
        .insert("persons".to_string(), persons_entity());
    config.entities.insert("bunks".to_string(), bunks_entity());
    config
}

/// Orchestrator wired to the real HTTP client and the given store
pub fn create_test_orchestrator(config: &Config, db: Arc<dyn Database>) -> Arc<Orchestrator> {
    let upstream = Arc::new(UpstreamClient::new(&config.upstream).expect("Failed to build client"));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let orchestrator = Orchestrator::new(&config.orchestrator).with_history(db.clone());
    register_entities(&orchestrator, config, upstream, limiter, db);
    Arc::new(orchestrator)
}

/// Upstream person item
pub fn person(id: i64, first: &str, grade: i64) -> Value {
    json!({"id": id, "name": {"first": first}, "grade": grade})
}

/// Serve one page of a resource at the given offset
pub async fn mount_page(server: &MockServer, resource: &str, offset: usize, items: Vec<Value>, has_more: bool) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", resource)))
        .and(query_param("offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": items,
            "has_more": has_more,
        })))
        .mount(server)
        .await;
}

/// Run the admin router in the background and return its address
///
/// The server shuts down when the returned sender is dropped or sent.
pub async fn run_test_server(
    state: AppState,
) -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>) {
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local address");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let app = record_sync::server::build_router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
    });

    (addr, shutdown_tx)
}
