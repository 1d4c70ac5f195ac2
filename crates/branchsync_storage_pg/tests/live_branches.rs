// End-to-end checks against two real PostgreSQL databases.
//
// Set BRANCHSYNC_TEST_DEV_URL and BRANCHSYNC_TEST_PROD_URL to two disposable
// databases (PostgreSQL 13+, connecting as a role allowed to set
// session_replication_role) to run these; every test returns early otherwise.
// The fixture drops and recreates `products`, `orders`, `documents` and `session`
// in `public`, and drops the `audit` schema.

use std::sync::Arc;
use std::time::Duration;

use branchsync_storage_pg::core::{
    diff_is_clean, Branch, EngineError, Phase, QueryOutcome, RecordingSink, SyncEvent,
};
use branchsync_storage_pg::{
    AdvisoryLock, BranchRegistry, CheckpointStore, PgConfig, QueryGateway, RollbackExecutor, SyncEngine,
    SyncRequest, SyncSettings, SYNC_LOCK_KEY,
};
use once_cell::sync::Lazy;
use sqlx::{Executor, PgPool};

/// Tests share two databases; run them one at a time.
static LIVE: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

const FIXTURE: &str = r#"
DROP SCHEMA IF EXISTS audit CASCADE;
DROP TABLE IF EXISTS public.orders, public.products, public.documents, public.session CASCADE;
DROP TABLE IF EXISTS drizzle.__drizzle_migrations;
CREATE TABLE public.products (
    id    serial PRIMARY KEY,
    name  text NOT NULL,
    price numeric(10, 2) NOT NULL DEFAULT 0
);
CREATE TABLE public.orders (
    id         bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    product_id int REFERENCES public.products (id),
    qty        int NOT NULL,
    doubled    int GENERATED ALWAYS AS (qty * 2) STORED
);
CREATE TABLE public.documents (id int PRIMARY KEY, doc json);
CREATE TABLE public.session (sid text PRIMARY KEY, data text);
"#;

/// Out-of-order and duplicate keys plus odd spacing: only `json` keeps this text.
const RAW_DOC: &str = r#"{"b": 1,  "a": 2, "a": 3}"#;

struct Live {
    registry: Arc<BranchRegistry>,
    checkpoints: CheckpointStore,
}

impl Live {
    async fn setup() -> Option<Self> {
        let dev = std::env::var("BRANCHSYNC_TEST_DEV_URL").ok()?;
        let prod = std::env::var("BRANCHSYNC_TEST_PROD_URL").ok()?;
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let cfg = PgConfig {
            lock_timeout: Duration::from_millis(800),
            batch_size: 7,
            ..PgConfig::default()
        }
        .with_url(Branch::Dev, dev)
        .with_url(Branch::Prod, prod);
        let registry = Arc::new(BranchRegistry::new(cfg));
        let checkpoints = CheckpointStore::new(registry.clone());

        for branch in Branch::ALL {
            checkpoints.install(branch).await.unwrap();
            registry.resolve(branch).unwrap().execute(FIXTURE).await.unwrap();
        }
        Some(Self { registry, checkpoints })
    }

    fn pool(&self, branch: Branch) -> &PgPool {
        self.registry.resolve(branch).unwrap()
    }

    async fn exec(&self, branch: Branch, sql: &str) {
        self.pool(branch).execute(sql).await.unwrap();
    }

    async fn count(&self, branch: Branch, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT count(*) FROM public.{table}"))
            .fetch_one(self.pool(branch))
            .await
            .unwrap()
    }

    async fn images(&self, branch: Branch, table: &str) -> Vec<String> {
        sqlx::query_scalar(&format!("SELECT to_json(t)::text FROM public.{table} t ORDER BY 1"))
            .fetch_all(self.pool(branch))
            .await
            .unwrap()
    }

    async fn doc(&self, branch: Branch, id: i32) -> String {
        sqlx::query_scalar("SELECT doc::text FROM public.documents WHERE id = $1")
            .bind(id)
            .fetch_one(self.pool(branch))
            .await
            .unwrap()
    }

    async fn last_value(&self, branch: Branch, sequence: &str) -> Option<i64> {
        sqlx::query_scalar("SELECT last_value FROM pg_sequences WHERE schemaname = 'public' AND sequencename = $1")
            .bind(sequence)
            .fetch_one(self.pool(branch))
            .await
            .unwrap()
    }
}

async fn seed_products(live: &Live, branch: Branch, n: usize) {
    live.exec(
        branch,
        &format!("INSERT INTO public.products (name, price) SELECT 'p' || g, g FROM generate_series(1, {n}) g"),
    )
    .await;
}

// =====================
// Checkpoints and rollback (scenarios A-C, P2, P6)
// =====================

#[tokio::test]
async fn checkpoint_diff_and_rollback_round_trip() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 3).await;

    // A
    let ckpt1 = live
        .checkpoints
        .create(Branch::Dev, "pre-migration", Some("before schema change"), Some("tests"))
        .await
        .unwrap();
    let diff = live.checkpoints.diff(Branch::Dev, ckpt1).await.unwrap();
    assert!(diff_is_clean(&diff), "{diff:?}");

    let listed = live.checkpoints.list(Branch::Dev).await.unwrap();
    assert_eq!(listed[0].id, ckpt1);
    assert_eq!(listed[0].label, "pre-migration");
    assert_eq!(listed[0].created_by.as_deref(), Some("tests"));

    // B
    seed_products(&live, Branch::Dev, 10).await;
    let diff = live.checkpoints.diff(Branch::Dev, ckpt1).await.unwrap();
    let products = diff.iter().find(|d| d.table_name == "products").unwrap();
    assert_eq!(products.delta, 10);
    assert_eq!(products.checkpoint_count, 3);

    // P6
    assert_eq!(diff, live.checkpoints.diff(Branch::Dev, ckpt1).await.unwrap());

    // C / P2
    RollbackExecutor::new(live.registry.clone())
        .rollback(Branch::Dev, ckpt1)
        .await
        .unwrap();
    let diff = live.checkpoints.diff(Branch::Dev, ckpt1).await.unwrap();
    assert!(diff_is_clean(&diff), "{diff:?}");
    assert_eq!(live.count(Branch::Dev, "products").await, 3);

    let summary = live.checkpoints.capture_summary(Branch::Dev, ckpt1).await.unwrap();
    assert!(summary.iter().any(|t| t.table_name == "products" && t.row_count == 3));
}

#[tokio::test]
async fn rollback_restores_generated_and_identity_columns() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 2).await;
    live.exec(Branch::Dev, "INSERT INTO public.orders (product_id, qty) VALUES (1, 4), (2, 5)").await;
    let before = live.images(Branch::Dev, "orders").await;

    let ckpt = live.checkpoints.create(Branch::Dev, "orders", None, None).await.unwrap();
    live.exec(Branch::Dev, "DELETE FROM public.orders; DELETE FROM public.products").await;

    RollbackExecutor::new(live.registry.clone()).rollback(Branch::Dev, ckpt).await.unwrap();
    assert_eq!(live.images(Branch::Dev, "orders").await, before);
}

#[tokio::test]
async fn rollback_keeps_json_documents_byte_for_byte() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    live.exec(Branch::Dev, &format!("INSERT INTO public.documents VALUES (1, '{RAW_DOC}')")).await;

    let ckpt = live.checkpoints.create(Branch::Dev, "documents", None, None).await.unwrap();
    live.exec(Branch::Dev, "UPDATE public.documents SET doc = '{}'").await;

    RollbackExecutor::new(live.registry.clone()).rollback(Branch::Dev, ckpt).await.unwrap();
    assert_eq!(live.doc(Branch::Dev, 1).await, RAW_DOC);
}

#[tokio::test]
async fn rollback_refuses_to_empty_uncaptured_referencing_tables() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 3).await;
    let ckpt = live.checkpoints.create(Branch::Dev, "before audit", None, None).await.unwrap();

    // audit is outside the captured schemas but points into them
    live.exec(
        Branch::Dev,
        "CREATE SCHEMA audit;
         CREATE TABLE audit.refs (product_id int REFERENCES public.products (id));
         INSERT INTO audit.refs VALUES (1), (2);",
    )
    .await;
    seed_products(&live, Branch::Dev, 2).await;

    let err = RollbackExecutor::new(live.registry.clone())
        .rollback(Branch::Dev, ckpt)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transaction { phase: Phase::Restore, .. }), "{err:?}");

    let refs: i64 = sqlx::query_scalar("SELECT count(*) FROM audit.refs")
        .fetch_one(live.pool(Branch::Dev))
        .await
        .unwrap();
    assert_eq!(refs, 2);
    assert_eq!(live.count(Branch::Dev, "products").await, 5);
}

#[tokio::test]
async fn failed_restore_leaves_branch_unchanged() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 3).await;
    let ckpt = live.checkpoints.create(Branch::Dev, "narrow", None, None).await.unwrap();

    // the captured rows have no value for a column added later
    live.exec(
        Branch::Dev,
        "ALTER TABLE public.products ADD COLUMN sku text NOT NULL DEFAULT 'x';
         ALTER TABLE public.products ALTER COLUMN sku DROP DEFAULT;
         INSERT INTO public.products (name, price, sku) VALUES ('late', 1, 'new');",
    )
    .await;
    let before = live.images(Branch::Dev, "products").await;

    let err = RollbackExecutor::new(live.registry.clone())
        .rollback(Branch::Dev, ckpt)
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Restore), "{err:?}");
    assert_eq!(err.safety_checkpoint(), Some(ckpt));
    assert_eq!(live.images(Branch::Dev, "products").await, before);

    // nothing is left holding the lock
    live.exec(Branch::Dev, "ALTER TABLE public.products DROP COLUMN sku").await;
    RollbackExecutor::new(live.registry.clone()).rollback(Branch::Dev, ckpt).await.unwrap();
    assert_eq!(live.count(Branch::Dev, "products").await, 3);
}

#[tokio::test]
async fn unknown_checkpoint_is_not_found() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    let missing = uuid::Uuid::new_v4().into();

    let err = RollbackExecutor::new(live.registry.clone())
        .rollback(Branch::Dev, missing)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(matches!(live.checkpoints.diff(Branch::Dev, missing).await, Err(EngineError::NotFound(_))));

    // a checkpoint belongs to the branch it was taken on
    let on_prod = live.checkpoints.create(Branch::Prod, "prod only", None, None).await.unwrap();
    assert!(matches!(live.checkpoints.get(Branch::Dev, on_prod).await, Err(EngineError::NotFound(_))));
}

// =====================
// Sync (scenarios D-E, P1, P3-P5)
// =====================

#[tokio::test]
async fn sync_replaces_target_data_and_keeps_safety_checkpoint() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Prod, 1).await;
    live.exec(
        Branch::Prod,
        "INSERT INTO public.orders (product_id, qty) SELECT 1, g FROM generate_series(1, 500) g",
    )
    .await;

    // D
    let sink = RecordingSink::new();
    let report = SyncEngine::new(live.registry.clone())
        .sync(SyncRequest::new(Branch::Dev, Branch::Prod).actor("tests").sink(&sink))
        .await
        .unwrap();
    assert_eq!(live.count(Branch::Prod, "orders").await, 0);

    let summary = live.checkpoints.capture_summary(Branch::Prod, report.checkpoint_id).await.unwrap();
    let orders = summary.iter().find(|t| t.table_name == "orders").unwrap();
    assert_eq!(orders.row_count, 500);
    let safety = live.checkpoints.get(Branch::Prod, report.checkpoint_id).await.unwrap();
    assert!(safety.label.contains("pre-sync from dev"), "{}", safety.label);

    let events = sink.events();
    assert_eq!(sink.terminal_count(), 1);
    assert!(matches!(events.last(), Some(SyncEvent::Done { checkpoint_id }) if *checkpoint_id == report.checkpoint_id));
    match events.iter().find(|e| matches!(e, SyncEvent::Tables { .. })) {
        Some(SyncEvent::Tables { tables }) => {
            assert!(!tables.contains(&"session".to_string()));
            assert!(tables.windows(2).all(|w| w[0] <= w[1]));
        }
        _ => panic!("no tables event"),
    }
}

#[tokio::test]
async fn sync_copies_rows_and_sequences() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 30).await;
    live.exec(Branch::Dev, "INSERT INTO public.orders (product_id, qty) SELECT g, g FROM generate_series(1, 30) g").await;
    live.exec(Branch::Prod, "INSERT INTO public.session VALUES ('keep-me', 'prod session')").await;
    seed_products(&live, Branch::Prod, 3).await;

    let sink = RecordingSink::new();
    let report = SyncEngine::new(live.registry.clone())
        .sync(SyncRequest::new(Branch::Dev, Branch::Prod).sink(&sink))
        .await
        .unwrap();

    // P1
    for table in ["products", "orders"] {
        assert_eq!(live.images(Branch::Dev, table).await, live.images(Branch::Prod, table).await, "{table}");
    }
    assert_eq!(report.total_rows(), 60);
    // excluded operational table is untouched
    assert_eq!(live.count(Branch::Prod, "session").await, 1);

    // P4
    for seq in ["products_id_seq", "orders_id_seq"] {
        assert_eq!(live.last_value(Branch::Dev, seq).await, live.last_value(Branch::Prod, seq).await, "{seq}");
    }
    assert!(report.sequences_restored >= 2);

    // batches of 7: cumulative progress for 30 rows
    let progress: Vec<u64> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            SyncEvent::TableProgress { table, rows } if table == "orders" => Some(*rows),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![7, 14, 21, 28, 30]);
}

#[tokio::test]
async fn sync_keeps_json_documents_byte_for_byte() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    live.exec(
        Branch::Dev,
        &format!("INSERT INTO public.documents VALUES (1, '{RAW_DOC}'), (2, NULL), (3, '[1, 1.50, \"x\"]')"),
    )
    .await;

    SyncEngine::new(live.registry.clone())
        .sync(SyncRequest::new(Branch::Dev, Branch::Prod))
        .await
        .unwrap();
    assert_eq!(live.doc(Branch::Prod, 1).await, RAW_DOC);
    assert_eq!(live.images(Branch::Dev, "documents").await, live.images(Branch::Prod, "documents").await);
}

#[tokio::test]
async fn sync_past_deadline_times_out_and_leaves_target_untouched() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 5).await;
    seed_products(&live, Branch::Prod, 2).await;
    let before = live.images(Branch::Prod, "products").await;

    // a reader on the target keeps TRUNCATE waiting past the deadline
    let mut blocker = live.pool(Branch::Prod).begin().await.unwrap();
    sqlx::query("LOCK TABLE public.products IN ACCESS SHARE MODE")
        .execute(&mut *blocker)
        .await
        .unwrap();

    let engine = SyncEngine::new(live.registry.clone());
    let hurried = SyncEngine::with_settings(
        live.registry.clone(),
        SyncSettings {
            deadline: Duration::from_millis(300),
            ..engine.settings().clone()
        },
    );
    let sink = RecordingSink::new();
    let err = hurried
        .sync(SyncRequest::new(Branch::Dev, Branch::Prod).sink(&sink))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)), "{err:?}");

    let errors: Vec<_> = sink.events().into_iter().filter(|e| matches!(e, SyncEvent::Error { .. })).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(sink.terminal_count(), 1);
    match &errors[0] {
        SyncEvent::Error { phase, safety_checkpoint, .. } => {
            assert_eq!(*phase, Phase::Truncate);
            assert!(safety_checkpoint.is_some());
        }
        other => panic!("expected error event, got {other:?}"),
    }

    blocker.rollback().await.unwrap();
    assert_eq!(live.images(Branch::Prod, "products").await, before);

    // the lock went with the failed attempt
    engine.sync(SyncRequest::new(Branch::Dev, Branch::Prod)).await.unwrap();
    assert_eq!(live.count(Branch::Prod, "products").await, 5);
}

#[tokio::test]
async fn self_sync_leaves_target_untouched() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    let before = live.checkpoints.list(Branch::Prod).await.unwrap().len();

    // E / P3
    let err = SyncEngine::new(live.registry.clone())
        .sync(SyncRequest::new(Branch::Prod, Branch::Prod))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    assert_eq!(live.checkpoints.list(Branch::Prod).await.unwrap().len(), before);
}

#[tokio::test]
async fn failed_copy_rolls_back_and_releases_lock() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 5).await;
    seed_products(&live, Branch::Prod, 2).await;
    // target-only NOT NULL column the source cannot fill
    live.exec(Branch::Prod, "ALTER TABLE public.products ADD COLUMN sku text NOT NULL DEFAULT 'x'; ALTER TABLE public.products ALTER COLUMN sku DROP DEFAULT").await;
    let before = live.images(Branch::Prod, "products").await;

    let engine = SyncEngine::new(live.registry.clone());
    let sink = RecordingSink::new();
    let err = engine
        .sync(SyncRequest::new(Branch::Dev, Branch::Prod).sink(&sink))
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some(Phase::CopyRows));
    let safety = err.safety_checkpoint().expect("safety checkpoint reported");
    assert!(live.checkpoints.get(Branch::Prod, safety).await.is_ok());
    assert_eq!(live.images(Branch::Prod, "products").await, before);
    assert!(matches!(sink.events().last(), Some(SyncEvent::Error { phase: Phase::CopyRows, .. })));

    // P5: the next sync gets the lock
    live.exec(Branch::Prod, "ALTER TABLE public.products DROP COLUMN sku").await;
    engine.sync(SyncRequest::new(Branch::Dev, Branch::Prod)).await.unwrap();
    assert_eq!(live.count(Branch::Prod, "products").await, 5);
}

#[tokio::test]
async fn held_lock_makes_sync_and_rollback_contend() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    let ckpt = live.checkpoints.create(Branch::Prod, "held", None, None).await.unwrap();

    let held = AdvisoryLock::acquire(live.pool(Branch::Prod), Branch::Prod, SYNC_LOCK_KEY, Duration::from_secs(1))
        .await
        .unwrap();

    let sink = RecordingSink::new();
    let err = SyncEngine::new(live.registry.clone())
        .sync(SyncRequest::new(Branch::Dev, Branch::Prod).sink(&sink))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LockContention(_)), "{err:?}");
    match sink.events().last() {
        Some(SyncEvent::Error { phase, safety_checkpoint, .. }) => {
            assert_eq!(*phase, Phase::AcquireLock);
            assert!(safety_checkpoint.is_some());
        }
        other => panic!("expected error event, got {other:?}"),
    }

    let err = RollbackExecutor::new(live.registry.clone())
        .rollback(Branch::Prod, ckpt)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LockContention(_)));

    held.release().await;
    RollbackExecutor::new(live.registry.clone()).rollback(Branch::Prod, ckpt).await.unwrap();
}

#[tokio::test]
async fn dropped_lock_guard_frees_the_lock() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    let pool = live.pool(Branch::Dev);
    {
        let _guard = AdvisoryLock::acquire(pool, Branch::Dev, SYNC_LOCK_KEY, Duration::from_secs(1))
            .await
            .unwrap();
    }
    // the detached session closes asynchronously
    let again = AdvisoryLock::acquire(pool, Branch::Dev, SYNC_LOCK_KEY, Duration::from_secs(5)).await;
    assert!(again.is_ok());
    again.unwrap().release().await;
}

// =====================
// Gateway
// =====================

#[tokio::test]
async fn gateway_introspects_and_queries() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    seed_products(&live, Branch::Dev, 4).await;
    let gateway = QueryGateway::new(live.registry.clone());

    let tables = gateway.list_tables(Branch::Dev).await.unwrap();
    let products = tables.iter().find(|t| t.schema == "public" && t.name == "products").unwrap();
    assert_eq!(products.table_type, "BASE TABLE");
    assert!(products.size_bytes > 0);

    let columns = gateway.table_columns(Branch::Dev, "public", "products").await.unwrap();
    let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["id", "name", "price"]);
    assert!(!columns[1].is_nullable);

    let indexes = gateway.table_indexes(Branch::Dev, "public", "products").await.unwrap();
    assert!(indexes.iter().any(|i| i.is_primary && i.is_unique));
    assert!(matches!(
        gateway.table_columns(Branch::Dev, "public", "nope").await,
        Err(EngineError::NotFound(_))
    ));

    match gateway
        .execute_query(Branch::Dev, "SELECT id, name FROM public.products ORDER BY id;")
        .await
        .unwrap()
    {
        QueryOutcome::Success(result) => {
            assert_eq!(result.row_count, 4);
            assert_eq!(result.columns[0].name, "id");
            assert_eq!(result.columns[0].r#type, "INT4");
            assert_eq!(result.rows[0], vec![serde_json::json!(1), serde_json::json!("p1")]);
        }
        other => panic!("expected success, got {other:?}"),
    }

    match gateway
        .execute_query(Branch::Dev, "SELECT 12345678901234567890.123::numeric AS n, 0.1::float8 AS f")
        .await
        .unwrap()
    {
        QueryOutcome::Success(result) => {
            assert_eq!(result.columns[0].r#type, "NUMERIC");
            assert_eq!(result.rows[0], vec![serde_json::json!("12345678901234567890.123"), serde_json::json!(0.1)]);
        }
        other => panic!("expected success, got {other:?}"),
    }

    let failed = gateway.execute_query(Branch::Dev, "SELEC nonsense").await.unwrap();
    assert!(!failed.is_success());

    let show = gateway.execute_query(Branch::Dev, "SHOW search_path").await.unwrap();
    assert!(show.is_success(), "{show:?}");

    let write = gateway.execute_read_only(Branch::Dev, "DELETE FROM public.products").await.unwrap();
    assert!(!write.is_success());
    assert_eq!(live.count(Branch::Dev, "products").await, 4);
}

fn first_cell(outcome: QueryOutcome) -> serde_json::Value {
    match outcome {
        QueryOutcome::Success(result) => result.rows[0][0].clone(),
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn diagnostic_session_settings_do_not_leak_into_the_pool() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    let Ok(dev) = std::env::var("BRANCHSYNC_TEST_DEV_URL") else { return };
    // one connection: every call below reuses the same session
    let single = Arc::new(BranchRegistry::new(
        PgConfig { max_connections: 1, ..live.registry.config().clone() }.with_url(Branch::Dev, dev),
    ));
    let gateway = QueryGateway::new(single.clone());

    for sql in ["SET search_path TO nowhere", "SET statement_timeout TO '4321s'"] {
        let outcome = gateway.execute_query(Branch::Dev, sql).await.unwrap();
        assert!(outcome.is_success(), "{sql}: {outcome:?}");
    }
    assert_ne!(first_cell(gateway.execute_query(Branch::Dev, "SHOW search_path").await.unwrap()), "nowhere");
    assert_ne!(first_cell(gateway.execute_query(Branch::Dev, "SHOW statement_timeout").await.unwrap()), "4321s");

    // unqualified names resolve through the default path again
    let count = gateway.execute_query(Branch::Dev, "SELECT count(*) FROM products").await.unwrap();
    assert!(count.is_success(), "{count:?}");
    single.shutdown().await;
}

#[tokio::test]
async fn migration_history_is_empty_until_tracked() {
    let _serial = LIVE.lock().await;
    let Some(live) = Live::setup().await else { return };
    let gateway = QueryGateway::new(live.registry.clone());
    assert!(gateway.migration_history(Branch::Prod).await.unwrap().is_empty());

    live.exec(
        Branch::Prod,
        "CREATE SCHEMA IF NOT EXISTS drizzle;
         CREATE TABLE drizzle.__drizzle_migrations (id serial PRIMARY KEY, hash text NOT NULL, created_at bigint);
         INSERT INTO drizzle.__drizzle_migrations (hash, created_at) VALUES ('a1', 1700000000000), ('b2', 1700000100000);",
    )
    .await;
    let history = gateway.migration_history(Branch::Prod).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].hash, "b2");
}
