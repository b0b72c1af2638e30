// Task coordination handle
//
// Encodes the delegation contract a worker follows when it fans work out to
// other workers:
//
// - the parent persists itself BEFORE publishing any sub-request, so an
//   arriving result always finds its parent;
// - each sub-request's correlation_id IS the sub-task id, appended to the
//   parent's `sub_tasks[]` (the canonical parent-finding index);
// - per-sub-task status/result metadata lives under `state._sub_tasks`;
// - recording a result is idempotent - a sub-task already completed is a
//   no-op, which makes duplicate deliveries harmless;
// - completion publishes the client-requested response_event with the
//   client's original correlation id, then deletes the task context.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::AgentContext;
use crate::events::EventEnvelope;
use crate::memory::dto::TaskDto;

/// Key inside `state` carrying per-sub-task bookkeeping.
const SUB_TASKS_KEY: &str = "_sub_tasks";

/// One child request in a parallel fan-out.
#[derive(Debug, Clone)]
pub struct DelegationSpec {
    pub event_type: String,
    pub data: Value,
    pub response_event: String,
}

/// What happened when a result was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// First result for this sub-task; bookkeeping updated
    Recorded,
    /// The sub-task was already completed; nothing changed
    AlreadyCompleted,
    /// The id is not a sub-task of this parent
    UnknownSubTask,
}

pub struct TaskHandle {
    pub task: TaskDto,
    context: AgentContext,
}

impl TaskHandle {
    /// Wrap an incoming action request as a task.
    ///
    /// The request's correlation id becomes the task id: the response the
    /// client waits for must carry exactly that id.
    pub fn from_request(context: AgentContext, request: &EventEnvelope) -> Self {
        let task = TaskDto {
            tenant_id: request
                .tenant_id
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            user_id: request
                .user_id
                .clone()
                .unwrap_or_else(|| context.memory.user_id().to_string()),
            task_id: request.correlation_id.clone(),
            plan_id: request
                .data
                .as_ref()
                .and_then(|d| d.get("plan_id"))
                .and_then(|v| v.as_str())
                .map(String::from),
            event_type: request.event_type.clone(),
            response_event: request.response_event.clone(),
            response_topic: request.response_topic().to_string(),
            data: request.data.clone().unwrap_or_else(|| json!({})),
            sub_tasks: Vec::new(),
            state: json!({}),
            created_at: None,
            updated_at: None,
        };
        Self { task, context }
    }

    /// Reload the parent task that owns `sub_task_id` (a result's
    /// correlation id). None when no row claims it.
    pub async fn restore_by_subtask(
        context: AgentContext,
        sub_task_id: &str,
    ) -> Result<Option<Self>> {
        let task = context.memory.get_task_by_subtask(sub_task_id).await?;
        Ok(task.map(|task| Self { task, context }))
    }

    pub async fn restore(context: AgentContext, task_id: &str) -> Result<Option<Self>> {
        let task = context.memory.get_task(task_id).await?;
        Ok(task.map(|task| Self { task, context }))
    }

    /// Persist the current record.
    pub async fn save(&self) -> Result<()> {
        let body = serde_json::to_value(&self.task).context("task serialization failed")?;
        self.context.memory.upsert_task(&body).await?;
        Ok(())
    }

    /// Delegate one child request. Saves the parent first, then publishes.
    /// Returns the sub-task id (= the child's correlation id).
    pub async fn delegate(
        &mut self,
        event_type: &str,
        data: Value,
        response_event: &str,
    ) -> Result<String> {
        let sub_task_id = Uuid::new_v4().to_string();
        self.track_sub_task(&sub_task_id, event_type, None);
        self.save().await?;

        self.publish_sub_request(&sub_task_id, event_type, data, response_event)
            .await?;
        Ok(sub_task_id)
    }

    /// Delegate several children sharing one parallel group. The group is
    /// complete when every member has completed. Returns the group id.
    pub async fn delegate_parallel(&mut self, specs: Vec<DelegationSpec>) -> Result<String> {
        let group_id = Uuid::new_v4().to_string();

        let mut ids = Vec::with_capacity(specs.len());
        for spec in &specs {
            let sub_task_id = Uuid::new_v4().to_string();
            self.track_sub_task(&sub_task_id, &spec.event_type, Some(&group_id));
            ids.push(sub_task_id);
        }
        // One save covers the whole fan-out before anything is published.
        self.save().await?;

        for (sub_task_id, spec) in ids.iter().zip(&specs) {
            self.publish_sub_request(sub_task_id, &spec.event_type, spec.data.clone(), &spec.response_event)
                .await?;
        }
        Ok(group_id)
    }

    async fn publish_sub_request(
        &self,
        sub_task_id: &str,
        event_type: &str,
        data: Value,
        response_event: &str,
    ) -> Result<()> {
        let mut request =
            EventEnvelope::action_request(&self.context.agent_id, event_type, data, response_event);
        request.correlation_id = sub_task_id.to_string();
        request.tenant_id = Some(self.task.tenant_id.clone());
        request.user_id = Some(self.task.user_id.clone());
        self.context.publish(&request).await?;
        Ok(())
    }

    /// Record a sub-task in the local bookkeeping (not yet persisted).
    fn track_sub_task(&mut self, sub_task_id: &str, event_type: &str, group_id: Option<&str>) {
        self.task.sub_tasks.push(sub_task_id.to_string());
        let mut entry = json!({
            "status": "pending",
            "event_type": event_type,
        });
        if let Some(group) = group_id {
            entry["parallel_group_id"] = json!(group);
        }
        sub_task_entries(&mut self.task.state).insert(sub_task_id.to_string(), entry);
    }

    /// Record a sub-task result. Idempotent: completing an already-completed
    /// sub-task changes nothing.
    pub async fn record_result(
        &mut self,
        sub_task_id: &str,
        result: &Value,
    ) -> Result<ResultDisposition> {
        if !self.task.sub_tasks.iter().any(|s| s == sub_task_id) {
            return Ok(ResultDisposition::UnknownSubTask);
        }

        let entries = sub_task_entries(&mut self.task.state);
        let entry = entries
            .entry(sub_task_id.to_string())
            .or_insert_with(|| json!({"status": "pending"}));

        if entry.get("status").and_then(|s| s.as_str()) == Some("completed") {
            return Ok(ResultDisposition::AlreadyCompleted);
        }
        entry["status"] = json!("completed");
        entry["result"] = result.clone();

        self.save().await?;
        Ok(ResultDisposition::Recorded)
    }

    /// Whether every member of a parallel group has completed.
    pub fn parallel_group_complete(&self, group_id: &str) -> bool {
        let Some(entries) = self.task.state.get(SUB_TASKS_KEY).and_then(|v| v.as_object()) else {
            return false;
        };
        let members: Vec<&Value> = entries
            .values()
            .filter(|e| e.get("parallel_group_id").and_then(|g| g.as_str()) == Some(group_id))
            .collect();
        !members.is_empty()
            && members
                .iter()
                .all(|e| e.get("status").and_then(|s| s.as_str()) == Some("completed"))
    }

    /// Collected results of a parallel group, keyed by sub-task id, once the
    /// group is complete.
    pub fn aggregate_parallel_results(&self, group_id: &str) -> Option<Value> {
        if !self.parallel_group_complete(group_id) {
            return None;
        }
        let entries = self.task.state.get(SUB_TASKS_KEY)?.as_object()?;
        let results: Map<String, Value> = entries
            .iter()
            .filter(|(_, e)| {
                e.get("parallel_group_id").and_then(|g| g.as_str()) == Some(group_id)
            })
            .map(|(id, e)| (id.clone(), e.get("result").cloned().unwrap_or(Value::Null)))
            .collect();
        Some(Value::Object(results))
    }

    /// Whether every tracked sub-task has completed.
    pub fn is_complete(&self) -> bool {
        let Some(entries) = self.task.state.get(SUB_TASKS_KEY).and_then(|v| v.as_object()) else {
            return self.task.sub_tasks.is_empty();
        };
        self.task.sub_tasks.iter().all(|id| {
            entries
                .get(id)
                .and_then(|e| e.get("status"))
                .and_then(|s| s.as_str())
                == Some("completed")
        })
    }

    /// Publish the client-requested response and drop the task context.
    ///
    /// The response carries the client's original correlation id (= the task
    /// id) on the task's response topic; at-most-once completion follows
    /// from the delete - a second completion attempt has no row to work on.
    pub async fn complete(self, result: Value) -> Result<()> {
        if let Some(response_event) = &self.task.response_event {
            let mut response = EventEnvelope::new(
                &self.context.agent_id,
                response_event,
                self.task
                    .response_topic
                    .parse()
                    .unwrap_or(crate::events::EventTopic::ActionResults),
            );
            response.data = Some(result);
            response.correlation_id = self.task.task_id.clone();
            response.tenant_id = Some(self.task.tenant_id.clone());
            response.user_id = Some(self.task.user_id.clone());
            self.context.publish(&response).await?;
        }

        self.context.memory.delete_task(&self.task.task_id).await?;
        Ok(())
    }
}

/// The mutable `_sub_tasks` map inside a task state, created on demand.
fn sub_task_entries(state: &mut Value) -> &mut Map<String, Value> {
    if !state.is_object() {
        *state = json!({});
    }
    let obj = state.as_object_mut().expect("state forced to object");
    obj.entry(SUB_TASKS_KEY.to_string())
        .or_insert_with(|| json!({}));
    obj.get_mut(SUB_TASKS_KEY)
        .and_then(|v| v.as_object_mut())
        .expect("sub task map forced to object")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{AgentConfig, AgentContext};

    fn handle() -> TaskHandle {
        let context = AgentContext::new_for_tests(&AgentConfig::new("test"));
        let request = EventEnvelope::action_request(
            "client",
            "order.requested",
            json!({"sku": "x"}),
            "order.completed",
        );
        TaskHandle::from_request(context, &request)
    }

    #[test]
    fn task_id_is_the_request_correlation_id() {
        let context = AgentContext::new_for_tests(&AgentConfig::new("test"));
        let mut request =
            EventEnvelope::action_request("client", "t.x", json!({}), "t.done");
        request.correlation_id = "C-client".into();
        request.tenant_id = Some("t1".into());

        let handle = TaskHandle::from_request(context, &request);
        assert_eq!(handle.task.task_id, "C-client");
        assert_eq!(handle.task.tenant_id, "t1");
        assert_eq!(handle.task.response_event.as_deref(), Some("t.done"));
        assert_eq!(handle.task.response_topic, "action-results");
    }

    #[test]
    fn tracking_builds_index_and_group_metadata() {
        let mut handle = handle();
        handle.track_sub_task("S1", "step.one", None);
        handle.track_sub_task("S2", "step.two", Some("G1"));
        handle.track_sub_task("S3", "step.three", Some("G1"));

        assert_eq!(handle.task.sub_tasks, vec!["S1", "S2", "S3"]);
        let entries = handle.task.state.get("_sub_tasks").unwrap();
        assert_eq!(entries["S1"]["status"], "pending");
        assert!(entries["S1"].get("parallel_group_id").is_none());
        assert_eq!(entries["S2"]["parallel_group_id"], "G1");
    }

    #[test]
    fn group_completion_requires_every_member() {
        let mut handle = handle();
        handle.track_sub_task("S1", "a", Some("G1"));
        handle.track_sub_task("S2", "b", Some("G1"));
        handle.track_sub_task("S3", "c", Some("other"));

        assert!(!handle.parallel_group_complete("G1"));

        let entries = sub_task_entries(&mut handle.task.state);
        entries.get_mut("S1").unwrap()["status"] = json!("completed");
        assert!(!handle.parallel_group_complete("G1"));

        let entries = sub_task_entries(&mut handle.task.state);
        entries.get_mut("S2").unwrap()["status"] = json!("completed");
        assert!(handle.parallel_group_complete("G1"));
        // The other group is untouched.
        assert!(!handle.parallel_group_complete("other"));
        assert!(!handle.parallel_group_complete("no-such-group"));
    }

    #[test]
    fn aggregation_returns_results_keyed_by_sub_task() {
        let mut handle = handle();
        handle.track_sub_task("S1", "a", Some("G1"));
        handle.track_sub_task("S2", "b", Some("G1"));

        let entries = sub_task_entries(&mut handle.task.state);
        for (id, value) in [("S1", json!({"n": 1})), ("S2", json!({"n": 2}))] {
            let entry = entries.get_mut(id).unwrap();
            entry["status"] = json!("completed");
            entry["result"] = value;
        }

        let aggregated = handle.aggregate_parallel_results("G1").unwrap();
        assert_eq!(aggregated["S1"], json!({"n": 1}));
        assert_eq!(aggregated["S2"], json!({"n": 2}));
    }

    #[tokio::test]
    async fn recording_results_is_idempotent() {
        let mut handle = handle();
        handle.track_sub_task("S1", "a", None);

        // Unknown ids are rejected before any persistence is attempted.
        assert_eq!(
            handle.record_result("S99", &json!({})).await.unwrap(),
            ResultDisposition::UnknownSubTask
        );

        // A completed sub-task is a no-op, checked before the save.
        let entries = sub_task_entries(&mut handle.task.state);
        let entry = entries.get_mut("S1").unwrap();
        entry["status"] = json!("completed");
        entry["result"] = json!({"n": 1});

        assert_eq!(
            handle.record_result("S1", &json!({"n": 2})).await.unwrap(),
            ResultDisposition::AlreadyCompleted
        );
        assert_eq!(
            handle.task.state["_sub_tasks"]["S1"]["result"],
            json!({"n": 1})
        );
    }

    #[test]
    fn is_complete_tracks_the_canonical_index() {
        let mut handle = handle();
        assert!(handle.is_complete());

        handle.track_sub_task("S1", "a", None);
        assert!(!handle.is_complete());

        let entries = sub_task_entries(&mut handle.task.state);
        entries.get_mut("S1").unwrap()["status"] = json!("completed");
        assert!(handle.is_complete());
    }
}
