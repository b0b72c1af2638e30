// Tenant-scoped state store backing the Memory Service
//
// Four memory kinds with different semantics (working, episodic, semantic,
// procedural) plus the plan/task execution records. One SQLite database in
// WAL mode behind a connection pool; vectors are stored as f32 BLOBs and
// ranked in process with cosine similarity. Per-kind operations live in
// sibling files as `impl MemoryStore` blocks.
//
// Module organization:
// - `working`    - plan-scoped key/value CRUD
// - `episodic`   - append-only interaction log + vector search
// - `semantic`   - knowledge items with upsert-by-key and privacy
// - `procedural` - triggered procedures + vector search
// - `plans`      - plan state machine records
// - `tasks`      - task/sub-task tracking and parent lookup

mod episodic;
mod plans;
mod procedural;
mod semantic;
mod tasks;
mod working;

pub use episodic::{EpisodicRecord, Role};
pub use plans::{PlanFilter, PlanRecord, PlanStatus, PlanUpdate};
pub use procedural::ProceduralRecord;
pub use semantic::{SemanticRecord, SemanticUpsert};
pub use tasks::TaskRecord;
pub use working::WorkingMemoryRecord;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::embeddings::EmbeddingProvider;

/// Tenant + user scope every request-level operation carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub tenant_id: String,
    pub user_id: String,
}

impl Scope {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    pool: Pool<SqliteConnectionManager>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl MemoryStore {
    pub fn open(path: impl AsRef<Path>, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA foreign_keys=ON;
                 PRAGMA busy_timeout=5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("failed to create memory connection pool")?;

        let store = Self { pool, provider };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("memory pool exhausted")
    }

    pub(crate) fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS working_memory (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    plan_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(tenant_id, user_id, plan_id, key)
                );

                CREATE TABLE IF NOT EXISTS episodic_memory (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    embedding BLOB,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_episodic_scope
                    ON episodic_memory(tenant_id, user_id, created_at);

                CREATE TABLE IF NOT EXISTS semantic_memory (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    external_id TEXT,
                    content_hash TEXT NOT NULL,
                    is_public INTEGER NOT NULL DEFAULT 0,
                    tags TEXT NOT NULL DEFAULT '[]',
                    source TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    embedding BLOB,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS ux_semantic_public_external
                    ON semantic_memory(tenant_id, external_id)
                    WHERE is_public = 1 AND external_id IS NOT NULL;
                CREATE UNIQUE INDEX IF NOT EXISTS ux_semantic_private_external
                    ON semantic_memory(tenant_id, user_id, external_id)
                    WHERE is_public = 0 AND external_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_semantic_scope
                    ON semantic_memory(tenant_id, user_id);

                CREATE TABLE IF NOT EXISTS procedural_memory (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    procedure_type TEXT NOT NULL,
                    trigger_condition TEXT NOT NULL,
                    content TEXT NOT NULL,
                    embedding BLOB,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS plan_contexts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    plan_id TEXT NOT NULL,
                    session_id TEXT,
                    goal_event TEXT NOT NULL,
                    goal_data TEXT NOT NULL DEFAULT '{}',
                    response_event TEXT,
                    status TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT '{}',
                    current_state TEXT,
                    correlation_ids TEXT NOT NULL DEFAULT '[]',
                    parent_plan_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(tenant_id, plan_id)
                );

                CREATE TABLE IF NOT EXISTS task_contexts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    task_id TEXT NOT NULL,
                    plan_id TEXT,
                    event_type TEXT NOT NULL,
                    response_event TEXT,
                    response_topic TEXT NOT NULL DEFAULT 'action-results',
                    data TEXT NOT NULL DEFAULT '{}',
                    sub_tasks TEXT NOT NULL DEFAULT '[]',
                    state TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(tenant_id, task_id)
                );
                "#,
            )
            .context("failed to initialize memory schema")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::embeddings::HashingProvider;

    /// Fresh store on a scratch database; the TempDir must outlive the store.
    pub fn test_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(HashingProvider::new(64));
        let store = MemoryStore::open(dir.path().join("memory.db"), provider).unwrap();
        (store, dir)
    }

    pub fn scope(tenant: &str, user: &str) -> Scope {
        Scope::new(tenant, user)
    }
}
