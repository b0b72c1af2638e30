// Task contexts - per-worker units of work and their sub-tasks
//
// A parent task that delegates appends each sub-task id to `sub_tasks[]`;
// that array is the canonical index for finding the parent when a result
// arrives (results carry the sub-task id as their correlation id). Per
// sub-task status/result metadata lives inside `state`, not here. Rows are
// keyed (tenant_id, task_id), so two tenants can hold the same task_id
// without collision.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::MemoryStore;
use crate::util::{now_str, parse_timestamp};

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub tenant_id: String,
    pub user_id: String,
    pub task_id: String,
    pub plan_id: Option<String>,
    pub event_type: String,
    pub response_event: Option<String>,
    pub response_topic: String,
    pub data: Value,
    /// Sub-task ids this row is the parent of; exactly one parent per id
    pub sub_tasks: Vec<String>,
    pub state: Value,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MemoryStore {
    /// Insert or update by (tenant_id, task_id). On conflict the mutable
    /// fields (plan_id, data, sub_tasks, state) are replaced; identity and
    /// routing fields keep their original values.
    pub fn task_upsert(&self, record: &TaskRecord) -> Result<TaskRecord> {
        let conn = self.conn()?;
        let now = now_str();
        conn.execute(
            r#"
            INSERT INTO task_contexts
                (tenant_id, user_id, task_id, plan_id, event_type, response_event,
                 response_topic, data, sub_tasks, state, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            ON CONFLICT(tenant_id, task_id) DO UPDATE SET
                plan_id = excluded.plan_id,
                data = excluded.data,
                sub_tasks = excluded.sub_tasks,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                record.tenant_id,
                record.user_id,
                record.task_id,
                record.plan_id,
                record.event_type,
                record.response_event,
                record.response_topic,
                serde_json::to_string(&record.data)?,
                serde_json::to_string(&record.sub_tasks)?,
                serde_json::to_string(&record.state)?,
                now,
            ],
        )?;

        self.task_get(&record.tenant_id, &record.task_id)?
            .context("upserted task not found")
    }

    pub fn task_get(&self, tenant_id: &str, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{} WHERE tenant_id = ?1 AND task_id = ?2", SELECT_TASK),
            params![tenant_id, task_id],
            row_to_record,
        )
        .optional()
        .context("task lookup failed")
    }

    /// Partial update of the delegation bookkeeping.
    pub fn task_update(
        &self,
        tenant_id: &str,
        task_id: &str,
        sub_tasks: Option<&[String]>,
        state: Option<&Value>,
    ) -> Result<Option<TaskRecord>> {
        let conn = self.conn()?;
        let now = now_str();
        let changed = conn.execute(
            "UPDATE task_contexts SET
                 sub_tasks = COALESCE(?3, sub_tasks),
                 state = COALESCE(?4, state),
                 updated_at = ?5
             WHERE tenant_id = ?1 AND task_id = ?2",
            params![
                tenant_id,
                task_id,
                sub_tasks.map(serde_json::to_string).transpose()?,
                state.map(serde_json::to_string).transpose()?,
                now,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.task_get(tenant_id, task_id)
    }

    pub fn task_delete(&self, tenant_id: &str, task_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM task_contexts WHERE tenant_id = ?1 AND task_id = ?2",
            params![tenant_id, task_id],
        )?;
        Ok(deleted > 0)
    }

    /// Find the parent task of a sub-task id: the row whose `sub_tasks[]`
    /// contains it. The LIKE prefilter narrows the scan; membership is
    /// verified on the parsed array.
    pub fn task_get_by_subtask(
        &self,
        tenant_id: &str,
        sub_task_id: &str,
    ) -> Result<Option<TaskRecord>> {
        let conn = self.conn()?;
        let needle = format!("%{}%", sub_task_id);
        let mut stmt = conn.prepare(&format!(
            "{} WHERE tenant_id = ?1 AND sub_tasks LIKE ?2",
            SELECT_TASK
        ))?;
        let rows = stmt.query_map(params![tenant_id, needle], row_to_record)?;
        for row in rows {
            let task = row?;
            if task.sub_tasks.iter().any(|s| s == sub_task_id) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }
}

const SELECT_TASK: &str = "SELECT tenant_id, user_id, task_id, plan_id, event_type, response_event,
        response_topic, data, sub_tasks, state, created_at, updated_at
 FROM task_contexts";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let data: String = row.get(7)?;
    let sub_tasks: String = row.get(8)?;
    let state: String = row.get(9)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(TaskRecord {
        tenant_id: row.get(0)?,
        user_id: row.get(1)?,
        task_id: row.get(2)?,
        plan_id: row.get(3)?,
        event_type: row.get(4)?,
        response_event: row.get(5)?,
        response_topic: row.get(6)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        sub_tasks: serde_json::from_str(&sub_tasks).unwrap_or_default(),
        state: serde_json::from_str(&state).unwrap_or(Value::Null),
        created_at: parse_timestamp(&created),
        updated_at: parse_timestamp(&updated),
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_store;
    use super::*;
    use serde_json::json;

    fn task(tenant: &str, task_id: &str, sub_tasks: Vec<&str>) -> TaskRecord {
        TaskRecord {
            tenant_id: tenant.into(),
            user_id: "u1".into(),
            task_id: task_id.into(),
            plan_id: Some("P1".into()),
            event_type: "order.requested".into(),
            response_event: Some("order.completed".into()),
            response_topic: "action-results".into(),
            data: json!({"sku": "x"}),
            sub_tasks: sub_tasks.into_iter().map(String::from).collect(),
            state: json!({"_sub_tasks": {}}),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn upsert_then_update_bookkeeping() {
        let (store, _dir) = test_store();

        let stored = store.task_upsert(&task("t1", "T1", vec![])).unwrap();
        assert!(stored.sub_tasks.is_empty());

        let updated = store
            .task_update(
                "t1",
                "T1",
                Some(&["S1".to_string()]),
                Some(&json!({"_sub_tasks": {"S1": {"status": "pending"}}})),
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.sub_tasks, vec!["S1"]);
        // Routing fields survive the update.
        assert_eq!(updated.response_event.as_deref(), Some("order.completed"));

        assert!(store.task_update("t1", "ghost", None, None).unwrap().is_none());
    }

    #[test]
    fn upsert_conflict_replaces_mutable_fields() {
        let (store, _dir) = test_store();
        let first = store.task_upsert(&task("t1", "T1", vec!["S1"])).unwrap();

        let mut second = task("t1", "T1", vec!["S1", "S2"]);
        second.data = json!({"sku": "y"});
        let stored = store.task_upsert(&second).unwrap();

        assert_eq!(stored.sub_tasks, vec!["S1", "S2"]);
        assert_eq!(stored.data, json!({"sku": "y"}));
        assert_eq!(stored.created_at, first.created_at);
    }

    #[test]
    fn parent_lookup_by_subtask_id() {
        let (store, _dir) = test_store();
        store.task_upsert(&task("t1", "T1", vec!["S1", "S2"])).unwrap();
        store.task_upsert(&task("t1", "T2", vec!["S3"])).unwrap();

        for sub in ["S1", "S2"] {
            let parent = store.task_get_by_subtask("t1", sub).unwrap().unwrap();
            assert_eq!(parent.task_id, "T1");
        }
        assert_eq!(
            store.task_get_by_subtask("t1", "S3").unwrap().unwrap().task_id,
            "T2"
        );
        assert!(store.task_get_by_subtask("t1", "S99").unwrap().is_none());
    }

    #[test]
    fn subtask_lookup_rejects_substring_false_positives() {
        let (store, _dir) = test_store();
        store.task_upsert(&task("t1", "T1", vec!["S11"])).unwrap();

        // "S1" is a substring of "S11" but not a member of sub_tasks.
        assert!(store.task_get_by_subtask("t1", "S1").unwrap().is_none());
    }

    #[test]
    fn tenants_do_not_collide_on_task_id() {
        let (store, _dir) = test_store();
        store.task_upsert(&task("t1", "T1", vec!["S1"])).unwrap();
        let mut other = task("t2", "T1", vec!["S9"]);
        other.data = json!({"sku": "tenant-two"});
        store.task_upsert(&other).unwrap();

        assert_eq!(
            store.task_get("t1", "T1").unwrap().unwrap().data,
            json!({"sku": "x"})
        );
        assert_eq!(
            store.task_get("t2", "T1").unwrap().unwrap().data,
            json!({"sku": "tenant-two"})
        );
        // Sub-task lookup honors the tenant boundary too.
        assert!(store.task_get_by_subtask("t2", "S1").unwrap().is_none());
    }

    #[test]
    fn delete_reports_absence() {
        let (store, _dir) = test_store();
        store.task_upsert(&task("t1", "T1", vec![])).unwrap();
        assert!(store.task_delete("t1", "T1").unwrap());
        assert!(!store.task_delete("t1", "T1").unwrap());
    }
}
