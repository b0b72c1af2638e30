// Working memory - plan-scoped key/value state
//
// The scratch space a plan carries between steps. Values are arbitrary JSON
// (string, number, bool, null, list, object) and upsert in place. Every
// operation filters by (tenant_id, user_id): a row created by one user is
// invisible and undeletable by another even within the same tenant and plan.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::{MemoryStore, Scope};
use crate::util::{now_str, parse_timestamp};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkingMemoryRecord {
    pub tenant_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub key: String,
    pub value: Value,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MemoryStore {
    /// Upsert one key. Existing rows keep their created_at.
    pub fn working_set(
        &self,
        scope: &Scope,
        plan_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<WorkingMemoryRecord> {
        let conn = self.conn()?;
        let now = now_str();
        conn.execute(
            r#"
            INSERT INTO working_memory
                (tenant_id, user_id, plan_id, key, value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(tenant_id, user_id, plan_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![
                scope.tenant_id,
                scope.user_id,
                plan_id,
                key,
                serde_json::to_string(value)?,
                now,
            ],
        )?;

        self.working_get(scope, plan_id, key)?
            .context("upserted working memory row not found")
    }

    pub fn working_get(
        &self,
        scope: &Scope,
        plan_id: &str,
        key: &str,
    ) -> Result<Option<WorkingMemoryRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT tenant_id, user_id, plan_id, key, value, created_at, updated_at
             FROM working_memory
             WHERE tenant_id = ?1 AND user_id = ?2 AND plan_id = ?3 AND key = ?4",
            params![scope.tenant_id, scope.user_id, plan_id, key],
            row_to_record,
        )
        .optional()
        .context("working memory lookup failed")
    }

    /// All keys of one plan, for the SDK's plan-state snapshot.
    pub fn working_list(&self, scope: &Scope, plan_id: &str) -> Result<Vec<WorkingMemoryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, user_id, plan_id, key, value, created_at, updated_at
             FROM working_memory
             WHERE tenant_id = ?1 AND user_id = ?2 AND plan_id = ?3
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![scope.tenant_id, scope.user_id, plan_id], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("working memory list failed")
    }

    /// Delete one key. Idempotent: a missing key reports `false`, never an
    /// error.
    pub fn working_delete_key(&self, scope: &Scope, plan_id: &str, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM working_memory
             WHERE tenant_id = ?1 AND user_id = ?2 AND plan_id = ?3 AND key = ?4",
            params![scope.tenant_id, scope.user_id, plan_id, key],
        )?;
        Ok(deleted > 0)
    }

    /// Delete every key of a plan (for this user). Returns the count.
    pub fn working_delete_plan(&self, scope: &Scope, plan_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM working_memory
             WHERE tenant_id = ?1 AND user_id = ?2 AND plan_id = ?3",
            params![scope.tenant_id, scope.user_id, plan_id],
        )?;
        Ok(deleted)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkingMemoryRecord> {
    let value: String = row.get(4)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    Ok(WorkingMemoryRecord {
        tenant_id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        key: row.get(3)?,
        value: serde_json::from_str(&value).unwrap_or(Value::Null),
        created_at: parse_timestamp(&created),
        updated_at: parse_timestamp(&updated),
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{scope, test_store};
    use serde_json::json;

    #[test]
    fn values_of_every_json_kind_round_trip() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        for (key, value) in [
            ("goal", json!("buy 100 widgets")),
            ("index", json!(42)),
            ("ratio", json!(30.5)),
            ("done", json!(true)),
            ("nothing", json!(null)),
            ("tasks", json!(["research", "order"])),
            ("config", json!({"retries": 3, "opts": ["verbose"]})),
        ] {
            store.working_set(&s, "plan-1", key, &value).unwrap();
            let got = store.working_get(&s, "plan-1", key).unwrap().unwrap();
            assert_eq!(got.value, value, "key {}", key);
        }
    }

    #[test]
    fn upsert_updates_in_place_and_keeps_created_at() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        let first = store.working_set(&s, "p", "k", &json!(1)).unwrap();
        let second = store.working_set(&s, "p", "k", &json!(2)).unwrap();

        assert_eq!(second.value, json!(2));
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(store.working_list(&s, "p").unwrap().len(), 1);
    }

    #[test]
    fn users_are_isolated_within_a_tenant() {
        let (store, _dir) = test_store();
        let alice = scope("t1", "alice");
        let bob = scope("t1", "bob");

        store.working_set(&alice, "p", "secret", &json!("a")).unwrap();

        assert!(store.working_get(&bob, "p", "secret").unwrap().is_none());
        assert!(!store.working_delete_key(&bob, "p", "secret").unwrap());
        // Alice's row survived Bob's delete attempt.
        assert!(store.working_get(&alice, "p", "secret").unwrap().is_some());
    }

    #[test]
    fn delete_key_is_idempotent() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");
        store.working_set(&s, "p", "k", &json!(1)).unwrap();

        assert!(store.working_delete_key(&s, "p", "k").unwrap());
        assert!(!store.working_delete_key(&s, "p", "k").unwrap());
    }

    #[test]
    fn delete_plan_removes_all_keys_and_counts() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");
        store.working_set(&s, "P", "k1", &json!(1)).unwrap();
        store.working_set(&s, "P", "k2", &json!(2)).unwrap();
        store.working_set(&s, "other", "k1", &json!(3)).unwrap();

        assert_eq!(store.working_delete_plan(&s, "P").unwrap(), 2);
        assert!(store.working_get(&s, "P", "k1").unwrap().is_none());
        assert!(store.working_get(&s, "P", "k2").unwrap().is_none());
        // Unrelated plans are untouched.
        assert!(store.working_get(&s, "other", "k1").unwrap().is_some());
        assert_eq!(store.working_delete_plan(&s, "P").unwrap(), 0);
    }
}
