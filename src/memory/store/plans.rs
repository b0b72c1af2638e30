// Plan contexts - persisted state machines for multi-step workflows
//
// A plan row is the authoritative record a planner reads back on every
// transition. `correlation_ids` carries both the plan id and the client's
// original correlation id so a response arriving on either can be routed to
// the plan. Deleting a plan also clears its working memory.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MemoryStore, Scope};
use crate::util::{now_str, parse_timestamp};

/// Plan lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Paused => "paused",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PlanStatus::Pending),
            "running" => Ok(PlanStatus::Running),
            "paused" => Ok(PlanStatus::Paused),
            "completed" => Ok(PlanStatus::Completed),
            "failed" => Ok(PlanStatus::Failed),
            other => Err(format!("unknown plan status: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub tenant_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub session_id: Option<String>,
    pub goal_event: String,
    pub goal_data: Value,
    pub response_event: Option<String>,
    pub status: PlanStatus,
    /// Serialized state machine + accumulated results
    pub state: Value,
    pub current_state: Option<String>,
    pub correlation_ids: Vec<String>,
    pub parent_plan_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial update for a plan; None fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct PlanUpdate {
    pub status: Option<PlanStatus>,
    pub state: Option<Value>,
    pub current_state: Option<String>,
    pub correlation_ids: Option<Vec<String>>,
}

/// Filters for plan listing.
#[derive(Debug, Clone, Default)]
pub struct PlanFilter {
    pub status: Option<PlanStatus>,
    pub session_id: Option<String>,
}

impl MemoryStore {
    /// Persist a new plan (or replace a stale row with the same plan_id -
    /// plan ids are minted fresh per run, so a conflict means a retry).
    pub fn plan_create(&self, record: &PlanRecord) -> Result<PlanRecord> {
        let conn = self.conn()?;
        let now = now_str();
        conn.execute(
            r#"
            INSERT INTO plan_contexts
                (tenant_id, user_id, plan_id, session_id, goal_event, goal_data,
                 response_event, status, state, current_state, correlation_ids,
                 parent_plan_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(tenant_id, plan_id) DO UPDATE SET
                session_id = excluded.session_id,
                goal_event = excluded.goal_event,
                goal_data = excluded.goal_data,
                response_event = excluded.response_event,
                status = excluded.status,
                state = excluded.state,
                current_state = excluded.current_state,
                correlation_ids = excluded.correlation_ids,
                parent_plan_id = excluded.parent_plan_id,
                updated_at = excluded.updated_at
            "#,
            params![
                record.tenant_id,
                record.user_id,
                record.plan_id,
                record.session_id,
                record.goal_event,
                serde_json::to_string(&record.goal_data)?,
                record.response_event,
                record.status.as_str(),
                serde_json::to_string(&record.state)?,
                record.current_state,
                serde_json::to_string(&record.correlation_ids)?,
                record.parent_plan_id,
                now,
            ],
        )?;

        self.plan_get(&record.tenant_id, &record.plan_id)?
            .context("created plan not found")
    }

    pub fn plan_get(&self, tenant_id: &str, plan_id: &str) -> Result<Option<PlanRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{} WHERE tenant_id = ?1 AND plan_id = ?2", SELECT_PLAN),
            params![tenant_id, plan_id],
            row_to_record,
        )
        .optional()
        .context("plan lookup failed")
    }

    /// Find the plan whose `correlation_ids` array contains the argument.
    /// Routes responses that carry either the plan id or the client's
    /// original correlation id.
    pub fn plan_get_by_correlation(
        &self,
        tenant_id: &str,
        correlation_id: &str,
    ) -> Result<Option<PlanRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE tenant_id = ?1", SELECT_PLAN))?;
        let rows = stmt.query_map(params![tenant_id], row_to_record)?;
        for row in rows {
            let plan = row?;
            if plan.correlation_ids.iter().any(|c| c == correlation_id) {
                return Ok(Some(plan));
            }
        }
        Ok(None)
    }

    pub fn plan_list(&self, scope: &Scope, filter: &PlanFilter) -> Result<Vec<PlanRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE tenant_id = ?1 AND user_id = ?2
                AND (?3 IS NULL OR status = ?3)
                AND (?4 IS NULL OR session_id = ?4)
              ORDER BY created_at DESC, id DESC",
            SELECT_PLAN
        ))?;
        let rows = stmt.query_map(
            params![
                scope.tenant_id,
                scope.user_id,
                filter.status.map(|s| s.as_str()),
                filter.session_id,
            ],
            row_to_record,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("plan list failed")
    }

    /// Apply a partial update; returns the fresh row, or None when absent.
    pub fn plan_update(
        &self,
        tenant_id: &str,
        plan_id: &str,
        update: &PlanUpdate,
    ) -> Result<Option<PlanRecord>> {
        let conn = self.conn()?;
        let now = now_str();
        let changed = conn.execute(
            "UPDATE plan_contexts SET
                 status = COALESCE(?3, status),
                 state = COALESCE(?4, state),
                 current_state = COALESCE(?5, current_state),
                 correlation_ids = COALESCE(?6, correlation_ids),
                 updated_at = ?7
             WHERE tenant_id = ?1 AND plan_id = ?2",
            params![
                tenant_id,
                plan_id,
                update.status.map(|s| s.as_str()),
                update
                    .state
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                update.current_state,
                update
                    .correlation_ids
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                now,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.plan_get(tenant_id, plan_id)
    }

    /// Delete a plan and all of its working memory (every user's rows: the
    /// plan is gone, so is its scratch state).
    pub fn plan_delete(&self, tenant_id: &str, plan_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM plan_contexts WHERE tenant_id = ?1 AND plan_id = ?2",
            params![tenant_id, plan_id],
        )?;
        tx.execute(
            "DELETE FROM working_memory WHERE tenant_id = ?1 AND plan_id = ?2",
            params![tenant_id, plan_id],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }
}

const SELECT_PLAN: &str = "SELECT tenant_id, user_id, plan_id, session_id, goal_event, goal_data,
        response_event, status, state, current_state, correlation_ids,
        parent_plan_id, created_at, updated_at, id
 FROM plan_contexts";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRecord> {
    let goal_data: String = row.get(5)?;
    let status: String = row.get(7)?;
    let state: String = row.get(8)?;
    let correlation_ids: String = row.get(10)?;
    let created: String = row.get(12)?;
    let updated: String = row.get(13)?;
    Ok(PlanRecord {
        tenant_id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        session_id: row.get(3)?,
        goal_event: row.get(4)?,
        goal_data: serde_json::from_str(&goal_data).unwrap_or(Value::Null),
        response_event: row.get(6)?,
        status: status.parse().unwrap_or(PlanStatus::Pending),
        state: serde_json::from_str(&state).unwrap_or(Value::Null),
        current_state: row.get(9)?,
        correlation_ids: serde_json::from_str(&correlation_ids).unwrap_or_default(),
        parent_plan_id: row.get(11)?,
        created_at: parse_timestamp(&created),
        updated_at: parse_timestamp(&updated),
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{scope, test_store};
    use super::*;
    use serde_json::json;

    fn plan(plan_id: &str, correlation_ids: Vec<&str>) -> PlanRecord {
        PlanRecord {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            plan_id: plan_id.into(),
            session_id: Some("s1".into()),
            goal_event: "research.requested".into(),
            goal_data: json!({"topic": "storage engines"}),
            response_event: Some("research.completed".into()),
            status: PlanStatus::Pending,
            state: json!({}),
            current_state: None,
            correlation_ids: correlation_ids.into_iter().map(String::from).collect(),
            parent_plan_id: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn create_get_and_update_cycle() {
        let (store, _dir) = test_store();

        store.plan_create(&plan("P1", vec!["P1", "C-client"])).unwrap();
        let loaded = store.plan_get("t1", "P1").unwrap().unwrap();
        assert_eq!(loaded.status, PlanStatus::Pending);
        assert_eq!(loaded.goal_event, "research.requested");

        let updated = store
            .plan_update(
                "t1",
                "P1",
                &PlanUpdate {
                    status: Some(PlanStatus::Running),
                    current_state: Some("gathering".into()),
                    state: Some(json!({"_sub_tasks": {}})),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, PlanStatus::Running);
        assert_eq!(updated.current_state.as_deref(), Some("gathering"));
        // Untouched fields survive the partial update.
        assert_eq!(updated.correlation_ids, vec!["P1", "C-client"]);

        assert!(store.plan_update("t1", "ghost", &PlanUpdate::default()).unwrap().is_none());
    }

    #[test]
    fn lookup_by_any_correlation_id() {
        let (store, _dir) = test_store();
        store.plan_create(&plan("P1", vec!["P1", "C-client"])).unwrap();
        store.plan_create(&plan("P2", vec!["P2"])).unwrap();

        let by_plan = store.plan_get_by_correlation("t1", "P1").unwrap().unwrap();
        assert_eq!(by_plan.plan_id, "P1");
        let by_client = store.plan_get_by_correlation("t1", "C-client").unwrap().unwrap();
        assert_eq!(by_client.plan_id, "P1");
        assert!(store.plan_get_by_correlation("t1", "unknown").unwrap().is_none());
        // Correlation ids do not leak across tenants.
        assert!(store.plan_get_by_correlation("t2", "P1").unwrap().is_none());
    }

    #[test]
    fn list_filters_by_status_and_session() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        store.plan_create(&plan("P1", vec!["P1"])).unwrap();
        store.plan_create(&plan("P2", vec!["P2"])).unwrap();
        store
            .plan_update(
                "t1",
                "P2",
                &PlanUpdate {
                    status: Some(PlanStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap();

        let pending = store
            .plan_list(
                &s,
                &PlanFilter {
                    status: Some(PlanStatus::Pending),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].plan_id, "P1");

        let all = store.plan_list(&s, &PlanFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn delete_plan_clears_working_memory() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        store.plan_create(&plan("P1", vec!["P1"])).unwrap();
        store.working_set(&s, "P1", "k1", &json!(1)).unwrap();
        store.working_set(&s, "P1", "k2", &json!(2)).unwrap();

        assert!(store.plan_delete("t1", "P1").unwrap());
        assert!(store.plan_get("t1", "P1").unwrap().is_none());
        assert!(store.working_get(&s, "P1", "k1").unwrap().is_none());
        assert!(store.working_get(&s, "P1", "k2").unwrap().is_none());
        assert!(!store.plan_delete("t1", "P1").unwrap());
    }
}
