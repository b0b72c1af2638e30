// Wire DTOs for the Memory Service
//
// Response keys are camelCase; requests tolerate both snake_case and
// camelCase via aliases. DTOs are decoupled from the store records so the
// storage layer can evolve without changing the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::{
    EpisodicRecord, PlanRecord, PlanStatus, ProceduralRecord, Role, SemanticRecord, TaskRecord,
    WorkingMemoryRecord,
};

// ─────────────────────────────────────────────────────────────────────────────
// Working memory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WorkingSetRequest {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingMemoryDto {
    pub tenant_id: String,
    pub user_id: String,
    pub plan_id: String,
    pub key: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<WorkingMemoryRecord> for WorkingMemoryDto {
    fn from(r: WorkingMemoryRecord) -> Self {
        Self {
            tenant_id: r.tenant_id,
            user_id: r.user_id,
            plan_id: r.plan_id,
            key: r.key,
            value: r.value,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteKeyResponse {
    pub success: bool,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePlanResponse {
    pub success: bool,
    pub count_deleted: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Episodic memory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EpisodicAppendRequest {
    #[serde(alias = "agentId")]
    pub agent_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodicDto {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl From<EpisodicRecord> for EpisodicDto {
    fn from(r: EpisodicRecord) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            agent_id: r.agent_id,
            role: r.role,
            content: r.content,
            metadata: r.metadata,
            created_at: r.created_at,
            score: r.score,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Semantic memory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SemanticStoreRequest {
    pub content: String,
    #[serde(default, alias = "externalId")]
    pub external_id: Option<String>,
    #[serde(default, alias = "isPublic")]
    pub is_public: bool,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct SemanticSearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default = "default_true", alias = "includePublic")]
    pub include_public: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticDto {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub external_id: Option<String>,
    pub is_public: bool,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl From<SemanticRecord> for SemanticDto {
    fn from(r: SemanticRecord) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            content: r.content,
            external_id: r.external_id,
            is_public: r.is_public,
            tags: r.tags,
            source: r.source,
            metadata: r.metadata,
            created_at: r.created_at,
            updated_at: r.updated_at,
            score: r.score,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Procedural memory
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProceduralStoreRequest {
    #[serde(alias = "agentId")]
    pub agent_id: String,
    #[serde(alias = "procedureType")]
    pub procedure_type: String,
    #[serde(alias = "triggerCondition")]
    pub trigger_condition: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProceduralDto {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub procedure_type: String,
    pub trigger_condition: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl From<ProceduralRecord> for ProceduralDto {
    fn from(r: ProceduralRecord) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            agent_id: r.agent_id,
            procedure_type: r.procedure_type,
            trigger_condition: r.trigger_condition,
            content: r.content,
            created_at: r.created_at,
            score: r.score,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plans
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PlanCreateRequest {
    #[serde(default, alias = "planId")]
    pub plan_id: Option<String>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "goalEvent")]
    pub goal_event: String,
    #[serde(default, alias = "goalData")]
    pub goal_data: Option<Value>,
    #[serde(default, alias = "responseEvent")]
    pub response_event: Option<String>,
    #[serde(default)]
    pub status: Option<PlanStatus>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default, alias = "currentState")]
    pub current_state: Option<String>,
    #[serde(default, alias = "correlationIds")]
    pub correlation_ids: Option<Vec<String>>,
    #[serde(default, alias = "parentPlanId")]
    pub parent_plan_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PlanUpdateRequest {
    #[serde(default)]
    pub status: Option<PlanStatus>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default, alias = "currentState")]
    pub current_state: Option<String>,
    #[serde(default, alias = "correlationIds")]
    pub correlation_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDto {
    pub tenant_id: String,
    pub user_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub goal_event: String,
    pub goal_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_event: Option<String>,
    pub status: PlanStatus,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<String>,
    pub correlation_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<PlanRecord> for PlanDto {
    fn from(r: PlanRecord) -> Self {
        Self {
            tenant_id: r.tenant_id,
            user_id: r.user_id,
            plan_id: r.plan_id,
            session_id: r.session_id,
            goal_event: r.goal_event,
            goal_data: r.goal_data,
            response_event: r.response_event,
            status: r.status,
            state: r.state,
            current_state: r.current_state,
            correlation_ids: r.correlation_ids,
            parent_plan_id: r.parent_plan_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TaskUpsertRequest {
    #[serde(alias = "taskId")]
    pub task_id: String,
    #[serde(default, alias = "planId")]
    pub plan_id: Option<String>,
    #[serde(alias = "eventType")]
    pub event_type: String,
    #[serde(default, alias = "responseEvent")]
    pub response_event: Option<String>,
    #[serde(default, alias = "responseTopic")]
    pub response_topic: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, alias = "subTasks")]
    pub sub_tasks: Option<Vec<String>>,
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TaskUpdateRequest {
    #[serde(default, alias = "subTasks")]
    pub sub_tasks: Option<Vec<String>>,
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    pub tenant_id: String,
    pub user_id: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_event: Option<String>,
    pub response_topic: String,
    pub data: Value,
    pub sub_tasks: Vec<String>,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<TaskRecord> for TaskDto {
    fn from(r: TaskRecord) -> Self {
        Self {
            tenant_id: r.tenant_id,
            user_id: r.user_id,
            task_id: r.task_id,
            plan_id: r.plan_id,
            event_type: r.event_type,
            response_event: r.response_event,
            response_topic: r.response_topic,
            data: r.data,
            sub_tasks: r.sub_tasks,
            state: r.state,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_serialize_camel_case() {
        let dto = WorkingMemoryDto {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            plan_id: "p1".into(),
            key: "k".into(),
            value: json!(1),
            created_at: None,
            updated_at: None,
        };
        let wire = serde_json::to_value(&dto).unwrap();
        assert!(wire.get("tenantId").is_some());
        assert!(wire.get("planId").is_some());
        assert!(wire.get("tenant_id").is_none());
    }

    #[test]
    fn requests_accept_both_key_styles() {
        let snake: SemanticStoreRequest = serde_json::from_value(json!({
            "content": "x",
            "external_id": "doc",
            "is_public": true
        }))
        .unwrap();
        assert_eq!(snake.external_id.as_deref(), Some("doc"));
        assert!(snake.is_public);

        let camel: SemanticStoreRequest = serde_json::from_value(json!({
            "content": "x",
            "externalId": "doc",
            "isPublic": true
        }))
        .unwrap();
        assert_eq!(camel.external_id.as_deref(), Some("doc"));
        assert!(camel.is_public);
    }

    #[test]
    fn search_request_defaults() {
        let req: SemanticSearchRequest =
            serde_json::from_value(json!({ "query": "x" })).unwrap();
        assert!(req.include_public);
        assert_eq!(req.limit, None);
    }
}
