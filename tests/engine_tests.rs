//! Engine integration tests
//!
//! Run the full tier stack against the in-memory distributed store and an
//! in-memory SQLite database. Expiry tests use a paused clock.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use tierkv::adapters::{InMemoryEventCollector, InMemoryStore, SqliteExecutor};
use tierkv::domain::{DistributedStore, SqlExecutor, Tier};
use tierkv::metrics::outcome;
use tierkv::model::FieldMap;
use tierkv::sql::{Dialect, Executed, Statement, TableMeta};
use tierkv::{AnyKey, Context, Engine, EngineConfig, Error, ExecMode, KeyInfo, KvPair, KvPairs};

// =============================================================================
// Fixtures
// =============================================================================

/// Counts row queries so tests can tell whether the relational tier was hit.
struct CountingSql {
    inner: SqliteExecutor,
    queries: AtomicUsize,
}

impl CountingSql {
    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlExecutor for CountingSql {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn query(&self, statement: &Statement) -> tierkv::Result<Vec<FieldMap>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(statement).await
    }

    async fn execute(&self, statement: &Statement) -> tierkv::Result<Executed> {
        self.inner.execute(statement).await
    }

    async fn table_meta(&self, table: &str) -> tierkv::Result<Option<TableMeta>> {
        self.inner.table_meta(table).await
    }

    async fn health_check(&self) -> tierkv::Result<bool> {
        self.inner.health_check().await
    }
}

struct Harness {
    engine: Engine,
    store: InMemoryStore,
    sql: Arc<CountingSql>,
    events: Arc<InMemoryEventCollector>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    async fn with_config(config: EngineConfig) -> Self {
        let sqlite = SqliteExecutor::in_memory().unwrap();
        sqlite
            .execute_batch(
                "CREATE TABLE users (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    score INTEGER
                );
                INSERT INTO users (id, name, score) VALUES (1, 'ann', 10);",
            )
            .unwrap();

        let store = InMemoryStore::new();
        let sql = Arc::new(CountingSql {
            inner: sqlite,
            queries: AtomicUsize::new(0),
        });
        let events = Arc::new(InMemoryEventCollector::new());
        let engine = Engine::builder(config, Arc::new(store.clone()), sql.clone())
            .events(events.clone())
            .build()
            .await
            .unwrap();

        Self {
            engine,
            store,
            sql,
            events,
        }
    }

    fn data_key(&self, kind: &str, id: &str) -> String {
        self.engine.keys().data(kind, id)
    }

    async fn markers(&self, kind: &str, id: &str) -> Vec<String> {
        let pattern = format!("{}::expire::{}::{}::*", self.engine.keys().prefix(), kind, id);
        self.store.keys(&pattern).await.unwrap()
    }

    async fn user_name(&self, id: i64) -> Option<Value> {
        let statement = Statement::new("SELECT name FROM users WHERE id = ?", vec![json!(id)]);
        let rows = self.sql.inner.query(&statement).await.unwrap();
        rows.into_iter().next().and_then(|mut row| row.remove("name"))
    }
}

fn fields(value: Value) -> FieldMap {
    value.as_object().cloned().unwrap()
}

fn user(id: &str) -> (KvPairs, AnyKey) {
    (
        KvPairs::from(KvPair::new("user", id)),
        AnyKey::from(KeyInfo::for_table("users")),
    )
}

/// Poll `check` on the (usually paused) clock until it holds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..600 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Read / Write Paths
// =============================================================================

#[tokio::test]
async fn test_save_then_find_round_trip() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let mut pairs = KvPairs::from(KvPair::with_data(
        "profile",
        "p1",
        fields(json!({"city": "Lagos", "age": 31})),
    ));
    let mut keys = AnyKey::from(KeyInfo::new());
    assert!(h.engine.save(&ctx, &mut pairs, &mut keys).await.unwrap());

    let mut found = KvPairs::from(KvPair::new("profile", "p1"));
    let mut keys = AnyKey::from(KeyInfo::new());
    assert!(h.engine.find(&ctx, &mut found, &mut keys).await.unwrap());
    assert_eq!(found[0].data, fields(json!({"city": "Lagos", "age": 31})));

    let mut keys = AnyKey::from(KeyInfo::new());
    assert!(h.engine.exists(&ctx, &mut found, &mut keys).await.unwrap());
}

#[tokio::test]
async fn test_find_promotes_relational_rows() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let (mut pairs, mut keys) = user("1");
    assert!(h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap());
    assert_eq!(pairs[0].data.get("name"), Some(&json!("ann")));
    assert!(h.store.exists(&h.data_key("user", "1")).await.unwrap());
    assert_eq!(h.events.events_of_type("KeyPromoted").len(), 1);

    let queries = h.sql.queries();
    let (mut pairs, mut keys) = user("1");
    assert!(h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap());
    assert_eq!(pairs[0].data.get("name"), Some(&json!("ann")));
    assert_eq!(h.sql.queries(), queries);
    assert!(h.engine.metrics().hits(Tier::Local) >= 1);
}

#[tokio::test]
async fn test_find_missing_key() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let (mut pairs, mut keys) = user("404");
    assert!(!h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap());
    assert!(pairs[0].is_empty());
    assert_eq!(h.engine.get(&ctx, "nothing").await.unwrap(), None);
}

#[tokio::test]
async fn test_insert_backfills_generated_id() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let mut pairs = KvPairs::from(KvPair::with_data("user", "*", fields(json!({"name": "cy"}))));
    let mut keys = AnyKey::from(KeyInfo::for_table("users"));
    assert!(h.engine.insert(&ctx, &mut pairs, &mut keys).await.unwrap());

    assert!(pairs[0].generated);
    assert_eq!(pairs[0].data.get("id"), Some(&json!(2)));
    assert_eq!(h.user_name(2).await, Some(json!("cy")));
    assert!(h.store.exists(&h.data_key("user", &pairs[0].id)).await.unwrap());
}

#[tokio::test]
async fn test_update_writes_changed_fields() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let mut pairs = KvPairs::from(KvPair::with_data(
        "user",
        "1",
        fields(json!({"name": "zed", "score": "10"})),
    ));
    let mut keys = AnyKey::from(KeyInfo::for_table("users"));
    assert!(h.engine.update(&ctx, &mut pairs, &mut keys).await.unwrap());

    assert_eq!(h.user_name(1).await, Some(json!("zed")));
    assert_eq!(pairs[0].data.get("score"), Some(&json!(10)));
}

#[tokio::test]
async fn test_update_merges_into_cached_value() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let (mut pairs, mut keys) = user("1");
    h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap();

    let mut pairs = KvPairs::from(KvPair::with_data("user", "1", fields(json!({"score": 99}))));
    let mut keys = AnyKey::from(KeyInfo::for_table("users"));
    assert!(h.engine.update(&ctx, &mut pairs, &mut keys).await.unwrap());

    let cached = h.store.hash_get_all(&h.data_key("user", "1")).await.unwrap();
    assert_eq!(cached.get("score"), Some(&json!(99)));
    assert_eq!(cached.get("name"), Some(&json!("ann")));
}

#[tokio::test]
async fn test_update_with_unknown_field_lands_in_default_table() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let mut pairs = KvPairs::from(KvPair::with_data(
        "user",
        "1",
        fields(json!({"score": 10, "nickname": "x"})),
    ));
    let mut keys = AnyKey::from(KeyInfo::for_table("users"));
    assert!(h.engine.update(&ctx, &mut pairs, &mut keys).await.unwrap());
    assert_eq!(h.events.events_of_type("FallbackUsed").len(), 1);
    assert_eq!(h.user_name(1).await, Some(json!("ann")));

    let (mut found, mut keys) = user("1");
    assert!(h.engine.find(&ctx, &mut found, &mut keys).await.unwrap());
    assert_eq!(found[0].data.get("nickname"), Some(&json!("x")));
    assert_eq!(found[0].data.get("name"), Some(&json!("ann")));
    assert_eq!(found[0].data.get("score"), Some(&json!(10)));
}

#[tokio::test]
async fn test_update_rejects_unknown_fields_without_fallback() {
    let h = Harness::with_config(EngineConfig {
        fallback_to_default: false,
        ..EngineConfig::default()
    })
    .await;
    let ctx = Context::asynchronous();

    let mut pairs = KvPairs::from(KvPair::with_data("user", "1", fields(json!({"nickname": "a"}))));
    let mut keys = AnyKey::from(KeyInfo::for_table("users"));
    let err = h.engine.update(&ctx, &mut pairs, &mut keys).await.unwrap_err();

    assert_matches!(
        err,
        Error::SchemaMismatch { ref fields, .. } if fields == &vec!["nickname".to_string()]
    );
    assert_eq!(err.status_code(), 400);
    assert_eq!(h.engine.pool().pending(), 0);
}

#[tokio::test]
async fn test_get_and_set_returns_previous_value() {
    let h = Harness::new().await;
    let ctx = Context::sync();
    assert_ok!(h.engine.set(&ctx, "counter", "1", "").await);

    let mut pairs = KvPairs::from(KvPair::with_text("data", "counter", "2"));
    let mut keys = AnyKey::from(KeyInfo::new());
    assert!(h.engine.get_and_set(&ctx, &mut pairs, &mut keys).await.unwrap());

    let previous = pairs[0].previous.clone().unwrap();
    assert_eq!(previous.get("_DEFAULT_"), Some(&json!("1")));
    assert_eq!(h.engine.get(&ctx, "counter").await.unwrap().as_deref(), Some("2"));
}

#[tokio::test]
async fn test_delete_clears_every_tier() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let (mut pairs, mut keys) = user("1");
    h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap();

    let (mut pairs, mut keys) = user("1");
    assert!(h.engine.delete(&ctx, &mut pairs, &mut keys).await.unwrap());
    assert_eq!(h.user_name(1).await, None);
    assert!(!h.store.exists(&h.data_key("user", "1")).await.unwrap());
    assert!(!h.engine.cache().data().contains("user:1"));

    let (mut pairs, mut keys) = user("1");
    assert!(!h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap());
}

#[tokio::test]
async fn test_rebinding_a_key_is_rejected() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    let (mut pairs, mut keys) = user("1");
    h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap();

    let mut keys = AnyKey::from(KeyInfo::for_table("orders"));
    assert_matches!(
        h.engine.find(&ctx, &mut pairs, &mut keys).await,
        Err(Error::BindingConflict { .. })
    );
}

#[tokio::test]
async fn test_misaligned_batches_are_rejected() {
    let h = Harness::new().await;
    let mut pairs = KvPairs::from(vec![KvPair::new("user", "1"), KvPair::new("user", "2")]);
    let mut keys = AnyKey::from(KeyInfo::for_table("users"));

    assert_err!(h.engine.find(&Context::sync(), &mut pairs, &mut keys).await);
}

// =============================================================================
// Expire Policies
// =============================================================================

#[tokio::test]
async fn test_expire_registers_once_until_reset() {
    let h = Harness::new().await;

    h.engine.set(&Context::sync(), "k", "v", "30").await.unwrap();
    let first = h.markers("data", "k").await;
    assert_eq!(first.len(), 1);

    h.engine.set(&Context::sync(), "k", "v", "30").await.unwrap();
    assert_eq!(h.markers("data", "k").await, first);

    h.engine.set(&Context::sync(), "k", "v", "+30").await.unwrap();
    let reset = h.markers("data", "k").await;
    assert_eq!(reset.len(), 1);
    assert_ne!(reset, first);
}

#[tokio::test]
async fn test_expire_zero_cancels() {
    let h = Harness::new().await;
    let ctx = Context::sync();

    h.engine.set(&ctx, "k", "v", "30").await.unwrap();
    assert_eq!(h.markers("data", "k").await.len(), 1);

    h.engine.set(&ctx, "k", "v", "0").await.unwrap();
    assert!(h.markers("data", "k").await.is_empty());
    assert_eq!(h.engine.get(&ctx, "k").await.unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn test_default_expire_applies_to_bare_requests() {
    let h = Harness::with_config(EngineConfig {
        default_expire: "60".to_string(),
        ..EngineConfig::default()
    })
    .await;

    h.engine.set(&Context::sync(), "k", "v", "").await.unwrap();
    assert_eq!(h.markers("data", "k").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_expire_writes_back_and_evicts() {
    let h = Harness::new().await;
    let background = h.engine.start(CancellationToken::new());
    let ctx = Context::sync();

    h.engine.set(&ctx, "foo", "bar", "120").await.unwrap();
    let data_key = h.data_key("data", "foo");
    assert!(h.store.exists(&data_key).await.unwrap());

    eventually(|| async { !h.store.exists(&data_key).await.unwrap() }).await;
    h.engine.pool().wait_idle().await;

    assert_eq!(h.engine.metrics().expire_events(outcome::WRITTEN_BACK), 1);
    assert_eq!(h.events.events_of_type("KeyWrittenBack").len(), 1);
    assert!(h.markers("data", "foo").await.is_empty());

    // The value now lives in the default table and is promoted on read.
    assert_eq!(h.engine.get(&ctx, "foo").await.unwrap().as_deref(), Some("bar"));
    assert!(h.store.exists(&data_key).await.unwrap());

    background.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeating_expire_refreshes_from_relational() {
    let h = Harness::new().await;
    let background = h.engine.start(CancellationToken::new());
    let ctx = Context::sync();

    let mut pairs = KvPairs::from(KvPair::new("user", "1"));
    let mut keys = AnyKey::from(KeyInfo::for_table("users").with_expire("-10"));
    assert!(h.engine.find(&ctx, &mut pairs, &mut keys).await.unwrap());

    h.sql
        .inner
        .execute_batch("UPDATE users SET name = 'bob' WHERE id = 1")
        .unwrap();

    let data_key = h.data_key("user", "1");
    eventually(|| async {
        h.store.hash_get(&data_key, "name").await.unwrap() == Some(json!("bob"))
    })
    .await;

    assert!(h.engine.metrics().expire_events(outcome::REFRESHED) >= 1);
    assert_eq!(h.markers("user", "1").await.len(), 1);
    let routing = h.store.hash_get(&h.engine.keys().routing("user"), "1").await.unwrap();
    assert!(routing.is_some());

    background.shutdown().await;
}

// =============================================================================
// Async Mode
// =============================================================================

#[tokio::test]
async fn test_async_save_lands_after_drain() {
    let h = Harness::new().await;
    let background = h.engine.start(CancellationToken::new());
    let ctx = Context::asynchronous();

    let mut pairs = KvPairs::from(KvPair::with_text("data", "later", "v"));
    let mut keys = AnyKey::from(KeyInfo::new().with_expire("30"));
    assert!(h.engine.save(&ctx, &mut pairs, &mut keys).await.unwrap());

    h.engine.pool().wait_idle().await;
    assert!(h.store.exists(&h.data_key("data", "later")).await.unwrap());
    assert_eq!(h.markers("data", "later").await.len(), 1);

    background.shutdown().await;
}

#[tokio::test]
async fn test_async_failures_are_traced() {
    let h = Harness::with_config(EngineConfig {
        fallback_to_default: false,
        ..EngineConfig::default()
    })
    .await;
    let background = h.engine.start(CancellationToken::new());
    let ctx = Context::with_trace_id("req-42", ExecMode::Async);

    let mut pairs = KvPairs::from(KvPair::with_data(
        "user",
        "dup",
        fields(json!({"id": 1, "name": "dup"})),
    ));
    let mut keys = AnyKey::from(KeyInfo::for_table("users"));
    assert!(h.engine.insert(&ctx, &mut pairs, &mut keys).await.unwrap());

    h.engine.pool().wait_idle().await;

    let records = h.engine.trace("req-42").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].label, "insert");
    assert_eq!(h.engine.metrics().async_failures(), 1);
    assert_eq!(h.user_name(1).await, Some(json!("ann")));
    assert!(!h.store.exists(&h.data_key("user", "dup")).await.unwrap());

    background.shutdown().await;
}
