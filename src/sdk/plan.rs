// Plan coordination handle
//
// A planner persists the plan record BEFORE emitting any sub-request; the
// record's `correlation_ids` holds both the plan id and the client's
// original correlation id, so responses carrying either route back to the
// plan. The persisted record is authoritative: every transition reads it
// back and writes through the Memory Service.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use uuid::Uuid;

use super::AgentContext;
use crate::events::{EventEnvelope, EventTopic};
use crate::memory::dto::PlanDto;
use crate::memory::store::PlanStatus;

/// Event type announced on `system-events` when a plan pauses for input.
pub const WAITING_FOR_INPUT_EVENT: &str = "plan.waiting_for_input";

pub struct PlanHandle {
    pub plan: PlanDto,
    context: AgentContext,
}

impl PlanHandle {
    /// Create and persist a plan for an incoming goal request.
    ///
    /// Returns only after the record is durable - sub-requests may fan out
    /// the moment this returns, and their results must find the plan.
    pub async fn start(context: AgentContext, goal: &EventEnvelope) -> Result<Self> {
        let plan_id = Uuid::new_v4().to_string();
        let body = json!({
            "planId": plan_id.clone(),
            "sessionId": goal.session_id.clone(),
            "goalEvent": goal.event_type.clone(),
            "goalData": goal.data.clone().unwrap_or_else(|| json!({})),
            "responseEvent": goal.response_event.clone(),
            "status": PlanStatus::Pending,
            "state": {},
            "correlationIds": [plan_id, goal.correlation_id.clone()],
        });

        let plan = context
            .memory
            .create_plan(&body)
            .await
            .context("failed to persist plan")?;
        Ok(Self { plan, context })
    }

    pub async fn restore(context: AgentContext, plan_id: &str) -> Result<Option<Self>> {
        let plan = context.memory.get_plan(plan_id).await?;
        Ok(plan.map(|plan| Self { plan, context }))
    }

    /// Reload by any correlation id the plan is known under.
    pub async fn restore_by_correlation(
        context: AgentContext,
        correlation_id: &str,
    ) -> Result<Option<Self>> {
        let plan = context.memory.get_plan_by_correlation(correlation_id).await?;
        Ok(plan.map(|plan| Self { plan, context }))
    }

    /// The client's original correlation id: the entry of
    /// `correlation_ids` that is not the plan id itself.
    pub fn client_correlation_id(&self) -> &str {
        self.plan
            .correlation_ids
            .iter()
            .find(|c| **c != self.plan.plan_id)
            .unwrap_or(&self.plan.plan_id)
    }

    /// Persist a state-machine transition.
    pub async fn transition(
        &mut self,
        status: Option<PlanStatus>,
        state: Option<Value>,
        current_state: Option<&str>,
    ) -> Result<()> {
        let updated = self
            .context
            .memory
            .update_plan(
                &self.plan.plan_id,
                status,
                state.as_ref(),
                current_state,
                None,
            )
            .await?
            .context("plan vanished during update")?;
        self.plan = updated;
        Ok(())
    }

    pub async fn mark_running(&mut self, current_state: &str) -> Result<()> {
        self.transition(Some(PlanStatus::Running), None, Some(current_state))
            .await
    }

    /// Pause for external input: record what the plan waits for, flip to
    /// paused, and announce it on `system-events`.
    pub async fn pause(&mut self, waiting_for: &str, timeout_seconds: Option<u64>) -> Result<()> {
        let mut state = self.plan.state.clone();
        if !state.is_object() {
            state = json!({});
        }
        state["_waiting_for"] = json!(waiting_for);
        state["_wait_timeout"] = json!(timeout_seconds);

        self.transition(Some(PlanStatus::Paused), Some(state), None)
            .await?;

        let mut notice = EventEnvelope::system_event(
            &self.context.agent_id,
            WAITING_FOR_INPUT_EVENT,
            json!({
                "plan_id": self.plan.plan_id,
                "waiting_for": waiting_for,
                "timeout_seconds": timeout_seconds,
            }),
        );
        notice.correlation_id = self.plan.plan_id.clone();
        notice.tenant_id = Some(self.plan.tenant_id.clone());
        notice.session_id = self.plan.session_id.clone();
        self.context.publish(&notice).await?;
        Ok(())
    }

    /// Resume a paused plan with the input it was waiting for. The input is
    /// recorded in state; the caller's transition handler drives what
    /// happens next.
    pub async fn resume(&mut self, input: Value) -> Result<()> {
        let mut state = self.plan.state.clone();
        if !state.is_object() {
            state = json!({});
        }
        state["_resume_input"] = input;
        if let Some(obj) = state.as_object_mut() {
            obj.remove("_waiting_for");
            obj.remove("_wait_timeout");
        }

        self.transition(Some(PlanStatus::Running), Some(state), None)
            .await
    }

    /// Terminal success: persist `completed`, then publish the response the
    /// client asked for, with the client's original correlation id, on
    /// `action-results`.
    pub async fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(Some(PlanStatus::Completed), None, Some("completed"))
            .await?;

        if let Some(response_event) = self.plan.response_event.clone() {
            let mut response = EventEnvelope::new(
                &self.context.agent_id,
                response_event,
                EventTopic::ActionResults,
            );
            response.data = Some(result);
            response.correlation_id = self.client_correlation_id().to_string();
            response.tenant_id = Some(self.plan.tenant_id.clone());
            response.user_id = Some(self.plan.user_id.clone());
            response.session_id = self.plan.session_id.clone();
            self.context.publish(&response).await?;
        }
        Ok(())
    }

    /// Terminal failure: persist `failed` and publish the failure on
    /// `action-results` so the client is not left waiting for the timeout.
    pub async fn fail(&mut self, error: &str) -> Result<()> {
        let mut state = self.plan.state.clone();
        if !state.is_object() {
            state = json!({});
        }
        state["_error"] = json!(error);
        self.transition(Some(PlanStatus::Failed), Some(state), Some("failed"))
            .await?;

        if let Some(response_event) = self.plan.response_event.clone() {
            let mut response = EventEnvelope::new(
                &self.context.agent_id,
                response_event,
                EventTopic::ActionResults,
            );
            response.data = Some(json!({"success": false, "error": error}));
            response.correlation_id = self.client_correlation_id().to_string();
            response.tenant_id = Some(self.plan.tenant_id.clone());
            response.user_id = Some(self.plan.user_id.clone());
            response.session_id = self.plan.session_id.clone();
            self.context.publish(&response).await?;
        }
        Ok(())
    }

    /// Drop the plan and its working memory once nobody needs it.
    pub async fn delete(self) -> Result<bool> {
        self.context.memory.delete_plan(&self.plan.plan_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::AgentConfig;

    fn plan_dto(plan_id: &str, correlation_ids: Vec<&str>) -> PlanDto {
        PlanDto {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            plan_id: plan_id.into(),
            session_id: None,
            goal_event: "research.requested".into(),
            goal_data: json!({}),
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
    fn client_correlation_is_the_non_plan_entry() {
        let context = crate::sdk::AgentContext::new_for_tests(&AgentConfig::new("test"));
        let handle = PlanHandle {
            plan: plan_dto("P1", vec!["P1", "C-client"]),
            context,
        };
        assert_eq!(handle.client_correlation_id(), "C-client");
    }

    #[test]
    fn client_correlation_falls_back_to_plan_id() {
        let context = crate::sdk::AgentContext::new_for_tests(&AgentConfig::new("test"));
        let handle = PlanHandle {
            plan: plan_dto("P1", vec!["P1"]),
            context,
        };
        assert_eq!(handle.client_correlation_id(), "P1");
    }
}
