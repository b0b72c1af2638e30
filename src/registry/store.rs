// SQLite-backed storage for the registry
//
// Two durable entity kinds: event definitions (name -> schema) and agents
// (id -> capabilities + liveness). Capability rows cascade with their agent.
// All writes go through short transactions on pooled connections; the pool
// runs WAL mode so the reaper and readers do not block each other.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{now_str, parse_timestamp, to_timestamp};

// ─────────────────────────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────────────────────────

/// Durable definition of an event type: its name, home topic and schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    #[serde(alias = "event_name")]
    pub event_name: String,
    pub topic: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "payload_schema")]
    pub payload_schema: Value,
    #[serde(default, alias = "response_schema", skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default, alias = "created_at", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updated_at", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One task an agent can perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    #[serde(alias = "task_name")]
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "consumed_event")]
    pub consumed_event: String,
    #[serde(default, alias = "produced_events")]
    pub produced_events: Vec<String>,
}

/// Registered agent with capabilities and liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    #[serde(alias = "agent_id")]
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, alias = "consumed_events")]
    pub consumed_events: Vec<String>,
    #[serde(default, alias = "produced_events")]
    pub produced_events: Vec<String>,
    #[serde(default, alias = "last_heartbeat", skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Filters for agent discovery queries.
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub agent_id: Option<String>,
    /// Substring match, case-insensitive
    pub name: Option<String>,
    pub consumed_event: Option<String>,
    pub produced_event: Option<String>,
    pub include_expired: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RegistryStore {
    pool: Pool<SqliteConnectionManager>,
}

impl RegistryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
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
            .context("failed to create registry connection pool")?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("registry pool exhausted")
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS event_definitions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_name TEXT NOT NULL UNIQUE,
                    topic TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    payload_schema TEXT NOT NULL DEFAULT '{}',
                    response_schema TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    agent_id TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    consumed_events TEXT NOT NULL DEFAULT '[]',
                    produced_events TEXT NOT NULL DEFAULT '[]',
                    last_heartbeat TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_agents_heartbeat
                    ON agents(last_heartbeat);

                CREATE TABLE IF NOT EXISTS agent_capabilities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    agent_row_id INTEGER NOT NULL
                        REFERENCES agents(id) ON DELETE CASCADE,
                    task_name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    consumed_event TEXT NOT NULL,
                    produced_events TEXT NOT NULL DEFAULT '[]'
                );
                CREATE INDEX IF NOT EXISTS idx_capabilities_agent
                    ON agent_capabilities(agent_row_id);
                "#,
            )
            .context("failed to initialize registry schema")
    }

    // ── Event definitions ────────────────────────────────────────────────────

    /// Insert or update a definition by `event_name`. Duplicate names are
    /// resolved by update, never surfaced as conflicts.
    pub fn upsert_event(&self, def: &EventDefinition) -> Result<EventDefinition> {
        let conn = self.conn()?;
        let now = now_str();

        conn.execute(
            r#"
            INSERT INTO event_definitions
                (event_name, topic, description, payload_schema, response_schema,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(event_name) DO UPDATE SET
                topic = excluded.topic,
                description = excluded.description,
                payload_schema = excluded.payload_schema,
                response_schema = excluded.response_schema,
                updated_at = excluded.updated_at
            "#,
            params![
                def.event_name,
                def.topic,
                def.description,
                serde_json::to_string(&def.payload_schema)?,
                def.response_schema
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                now,
            ],
        )?;

        self.get_event(&def.event_name)?
            .context("upserted event definition not found")
    }

    pub fn get_event(&self, event_name: &str) -> Result<Option<EventDefinition>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT event_name, topic, description, payload_schema, response_schema,
                    created_at, updated_at
             FROM event_definitions WHERE event_name = ?1",
            params![event_name],
            row_to_event,
        )
        .optional()
        .context("event lookup failed")
    }

    /// List definitions, optionally filtered by name and/or topic.
    pub fn query_events(
        &self,
        event_name: Option<&str>,
        topic: Option<&str>,
    ) -> Result<Vec<EventDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_name, topic, description, payload_schema, response_schema,
                    created_at, updated_at
             FROM event_definitions
             WHERE (?1 IS NULL OR event_name = ?1)
               AND (?2 IS NULL OR topic = ?2)
             ORDER BY event_name",
        )?;
        let rows = stmt.query_map(params![event_name, topic], row_to_event)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("event query failed")
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    /// Register or replace an agent. The capability set is wiped and
    /// re-inserted in the same transaction, so a query can never observe a
    /// mix of old and new rows. `last_heartbeat` is reset to now.
    pub fn upsert_agent(&self, def: &AgentDefinition) -> Result<(AgentDefinition, bool)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_str();

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM agents WHERE agent_id = ?1",
                params![def.agent_id],
                |row| row.get(0),
            )
            .optional()?;
        let created = existing.is_none();

        let row_id = match existing {
            Some(row_id) => {
                tx.execute(
                    "UPDATE agents SET name = ?2, description = ?3,
                         consumed_events = ?4, produced_events = ?5,
                         last_heartbeat = ?6, updated_at = ?6
                     WHERE id = ?1",
                    params![
                        row_id,
                        def.name,
                        def.description,
                        serde_json::to_string(&def.consumed_events)?,
                        serde_json::to_string(&def.produced_events)?,
                        now,
                    ],
                )?;
                tx.execute(
                    "DELETE FROM agent_capabilities WHERE agent_row_id = ?1",
                    params![row_id],
                )?;
                row_id
            }
            None => {
                tx.execute(
                    "INSERT INTO agents
                         (agent_id, name, description, consumed_events,
                          produced_events, last_heartbeat, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)",
                    params![
                        def.agent_id,
                        def.name,
                        def.description,
                        serde_json::to_string(&def.consumed_events)?,
                        serde_json::to_string(&def.produced_events)?,
                        now,
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        for cap in &def.capabilities {
            tx.execute(
                "INSERT INTO agent_capabilities
                     (agent_row_id, task_name, description, consumed_event, produced_events)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row_id,
                    cap.task_name,
                    cap.description,
                    cap.consumed_event,
                    serde_json::to_string(&cap.produced_events)?,
                ],
            )?;
        }

        tx.commit()?;

        let stored = self
            .get_agent(&def.agent_id)?
            .context("upserted agent not found")?;
        Ok((stored, created))
    }

    /// Direct lookup regardless of liveness. TTL-aware lookups go through
    /// `query_agents` with the configured TTL.
    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentDefinition>> {
        let query = AgentQuery {
            agent_id: Some(agent_id.to_string()),
            include_expired: true,
            ..Default::default()
        };
        Ok(self.query_agents(&query, 0)?.into_iter().next())
    }

    /// Discovery query. Unless `include_expired` is set, rows whose
    /// heartbeat is older than `ttl_seconds` are filtered out.
    pub fn query_agents(&self, query: &AgentQuery, ttl_seconds: u64) -> Result<Vec<AgentDefinition>> {
        let conn = self.conn()?;

        let threshold = if query.include_expired {
            None
        } else {
            Some(to_timestamp(
                Utc::now() - ChronoDuration::seconds(ttl_seconds as i64),
            ))
        };

        let mut stmt = conn.prepare(
            "SELECT id, agent_id, name, description, consumed_events,
                    produced_events, last_heartbeat
             FROM agents
             WHERE (?1 IS NULL OR agent_id = ?1)
               AND (?2 IS NULL OR name LIKE '%' || ?2 || '%')
               AND (?3 IS NULL OR last_heartbeat >= ?3)
             ORDER BY name",
        )?;

        let rows = stmt.query_map(
            params![query.agent_id, query.name, threshold],
            |row| {
                let row_id: i64 = row.get(0)?;
                let consumed: String = row.get(4)?;
                let produced: String = row.get(5)?;
                let heartbeat: String = row.get(6)?;
                Ok((
                    row_id,
                    AgentDefinition {
                        agent_id: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        capabilities: Vec::new(),
                        consumed_events: serde_json::from_str(&consumed).unwrap_or_default(),
                        produced_events: serde_json::from_str(&produced).unwrap_or_default(),
                        last_heartbeat: parse_timestamp(&heartbeat),
                    },
                ))
            },
        )?;

        let mut agents = Vec::new();
        for row in rows {
            let (row_id, mut agent) = row?;
            agent.capabilities = self.capabilities_for(&conn, row_id)?;
            agents.push(agent);
        }

        // JSON-array membership filters run here; SQLite has no contains
        // operator over text-encoded arrays.
        if let Some(consumed) = &query.consumed_event {
            agents.retain(|a| a.consumed_events.iter().any(|e| e == consumed));
        }
        if let Some(produced) = &query.produced_event {
            agents.retain(|a| a.produced_events.iter().any(|e| e == produced));
        }

        Ok(agents)
    }

    fn capabilities_for(
        &self,
        conn: &rusqlite::Connection,
        agent_row_id: i64,
    ) -> Result<Vec<Capability>> {
        let mut stmt = conn.prepare(
            "SELECT task_name, description, consumed_event, produced_events
             FROM agent_capabilities WHERE agent_row_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![agent_row_id], |row| {
            let produced: String = row.get(3)?;
            Ok(Capability {
                task_name: row.get(0)?,
                description: row.get(1)?,
                consumed_event: row.get(2)?,
                produced_events: serde_json::from_str(&produced).unwrap_or_default(),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("capability query failed")
    }

    /// Refresh an agent's liveness. Returns false when the agent is unknown.
    pub fn touch_heartbeat(&self, agent_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_str();
        let changed = conn.execute(
            "UPDATE agents SET last_heartbeat = ?2, updated_at = ?2 WHERE agent_id = ?1",
            params![agent_id, now],
        )?;
        Ok(changed > 0)
    }

    /// Delete an agent; capability rows go with it (FK cascade).
    pub fn delete_agent(&self, agent_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM agents WHERE agent_id = ?1", params![agent_id])?;
        Ok(changed > 0)
    }

    /// Reap agents whose heartbeat is older than the TTL. Returns how many
    /// were deleted.
    pub fn delete_expired_agents(&self, ttl_seconds: u64) -> Result<usize> {
        let conn = self.conn()?;
        let threshold = to_timestamp(Utc::now() - ChronoDuration::seconds(ttl_seconds as i64));
        let deleted = conn.execute(
            "DELETE FROM agents WHERE last_heartbeat < ?1",
            params![threshold],
        )?;
        Ok(deleted)
    }

    /// Remove capability rows whose agent no longer exists. The FK cascade
    /// should make this a no-op; it self-heals databases written before the
    /// cascade existed or with foreign keys off.
    pub fn delete_orphan_capabilities(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM agent_capabilities
             WHERE agent_row_id NOT IN (SELECT id FROM agents)",
            [],
        )?;
        Ok(deleted)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventDefinition> {
    let payload: String = row.get(3)?;
    let response: Option<String> = row.get(4)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    Ok(EventDefinition {
        event_name: row.get(0)?,
        topic: row.get(1)?,
        description: row.get(2)?,
        payload_schema: serde_json::from_str(&payload).unwrap_or(Value::Null),
        response_schema: response.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_timestamp(&created),
        updated_at: parse_timestamp(&updated),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_store() -> (RegistryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path().join("registry.db")).unwrap();
        (store, dir)
    }

    fn agent(agent_id: &str, capabilities: Vec<Capability>) -> AgentDefinition {
        AgentDefinition {
            agent_id: agent_id.to_string(),
            name: format!("{}-name", agent_id),
            description: String::new(),
            capabilities,
            consumed_events: vec!["x.requested".to_string()],
            produced_events: vec!["x.completed".to_string()],
            last_heartbeat: None,
        }
    }

    fn capability(task: &str) -> Capability {
        Capability {
            task_name: task.to_string(),
            description: String::new(),
            consumed_event: "x.requested".to_string(),
            produced_events: vec!["x.completed".to_string()],
        }
    }

    #[test]
    fn event_upsert_updates_in_place() {
        let (store, _dir) = test_store();

        let first = store
            .upsert_event(&EventDefinition {
                event_name: "x.requested".into(),
                topic: "action-requests".into(),
                description: "v1".into(),
                payload_schema: json!({"type": "object"}),
                response_schema: None,
                created_at: None,
                updated_at: None,
            })
            .unwrap();

        let second = store
            .upsert_event(&EventDefinition {
                event_name: "x.requested".into(),
                topic: "action-requests".into(),
                description: "v2".into(),
                payload_schema: json!({"type": "object", "required": ["q"]}),
                response_schema: Some(json!({"type": "object"})),
                created_at: None,
                updated_at: None,
            })
            .unwrap();

        assert_eq!(store.query_events(None, None).unwrap().len(), 1);
        assert_eq!(second.description, "v2");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn event_query_filters_by_name_and_topic() {
        let (store, _dir) = test_store();
        for (name, topic) in [
            ("a.requested", "action-requests"),
            ("a.completed", "action-results"),
        ] {
            store
                .upsert_event(&EventDefinition {
                    event_name: name.into(),
                    topic: topic.into(),
                    description: String::new(),
                    payload_schema: json!({}),
                    response_schema: None,
                    created_at: None,
                    updated_at: None,
                })
                .unwrap();
        }

        assert_eq!(store.query_events(None, None).unwrap().len(), 2);
        assert_eq!(
            store
                .query_events(Some("a.requested"), None)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .query_events(None, Some("action-results"))
                .unwrap()
                .len(),
            1
        );
        assert!(store.query_events(Some("missing"), None).unwrap().is_empty());
    }

    #[test]
    fn agent_upsert_replaces_capabilities_without_leftovers() {
        let (store, _dir) = test_store();

        let (_, created) = store
            .upsert_agent(&agent("a1", vec![capability("old-1"), capability("old-2")]))
            .unwrap();
        assert!(created);

        let (stored, created) = store
            .upsert_agent(&agent("a1", vec![capability("new-only")]))
            .unwrap();
        assert!(!created);

        let tasks: Vec<&str> = stored
            .capabilities
            .iter()
            .map(|c| c.task_name.as_str())
            .collect();
        assert_eq!(tasks, vec!["new-only"]);
        assert_eq!(store.delete_orphan_capabilities().unwrap(), 0);
    }

    #[test]
    fn default_queries_hide_expired_agents() {
        let (store, _dir) = test_store();
        store.upsert_agent(&agent("fresh", vec![])).unwrap();

        let active = store
            .query_agents(&AgentQuery::default(), 3600)
            .unwrap();
        assert_eq!(active.len(), 1);

        // With a zero TTL everything just registered is already expired.
        let expired_view = store.query_agents(&AgentQuery::default(), 0).unwrap();
        assert!(expired_view.is_empty());

        let all = store
            .query_agents(
                &AgentQuery {
                    include_expired: true,
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn heartbeat_touch_and_idempotence() {
        let (store, _dir) = test_store();
        store.upsert_agent(&agent("a1", vec![])).unwrap();

        let before = store
            .get_agent("a1")
            .unwrap()
            .unwrap()
            .last_heartbeat
            .unwrap();

        assert!(store.touch_heartbeat("a1").unwrap());
        assert!(store.touch_heartbeat("a1").unwrap());
        assert!(!store.touch_heartbeat("ghost").unwrap());

        let after = store
            .get_agent("a1")
            .unwrap()
            .unwrap()
            .last_heartbeat
            .unwrap();
        // Repeated heartbeats only move the timestamp forward.
        assert!(after >= before);
        assert_eq!(store.query_agents(&AgentQuery::default(), 3600).unwrap().len(), 1);
    }

    #[test]
    fn reaper_delete_cascades_capabilities() {
        let (store, _dir) = test_store();
        store
            .upsert_agent(&agent("doomed", vec![capability("task")]))
            .unwrap();

        // TTL 0: the agent registered above is instantly expired.
        assert_eq!(store.delete_expired_agents(0).unwrap(), 1);
        assert!(store.get_agent("doomed").unwrap().is_none());
        assert_eq!(store.delete_orphan_capabilities().unwrap(), 0);
    }

    #[test]
    fn discovery_filters_by_consumed_and_produced_events() {
        let (store, _dir) = test_store();
        let mut consumer = agent("consumer", vec![]);
        consumer.consumed_events = vec!["order.created".into()];
        consumer.produced_events = vec![];
        store.upsert_agent(&consumer).unwrap();

        let mut producer = agent("producer", vec![]);
        producer.consumed_events = vec![];
        producer.produced_events = vec!["order.created".into()];
        store.upsert_agent(&producer).unwrap();

        let consumers = store
            .query_agents(
                &AgentQuery {
                    consumed_event: Some("order.created".into()),
                    ..Default::default()
                },
                3600,
            )
            .unwrap();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].agent_id, "consumer");

        let producers = store
            .query_agents(
                &AgentQuery {
                    produced_event: Some("order.created".into()),
                    ..Default::default()
                },
                3600,
            )
            .unwrap();
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].agent_id, "producer");
    }

    #[test]
    fn name_filter_is_substring_case_insensitive() {
        let (store, _dir) = test_store();
        let mut a = agent("a1", vec![]);
        a.name = "Research Worker".into();
        store.upsert_agent(&a).unwrap();

        let hits = store
            .query_agents(
                &AgentQuery {
                    name: Some("research".into()),
                    ..Default::default()
                },
                3600,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_agent_reports_absence() {
        let (store, _dir) = test_store();
        store.upsert_agent(&agent("a1", vec![])).unwrap();
        assert!(store.delete_agent("a1").unwrap());
        assert!(!store.delete_agent("a1").unwrap());
    }
}
