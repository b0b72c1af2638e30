// Procedural memory - learned procedures an agent can be triggered into
//
// Rows pair a trigger condition with procedure content; retrieval is vector
// search over the trigger text so an agent can ask "what do I know how to do
// in this situation".

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{MemoryStore, Scope};
use crate::embeddings::{blob_to_embedding, cosine_similarity, embedding_to_blob};
use crate::util::{now_str, parse_timestamp};

#[derive(Debug, Clone)]
pub struct ProceduralRecord {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub procedure_type: String,
    pub trigger_condition: String,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Similarity to the query; only set on search results
    pub score: Option<f32>,
}

impl MemoryStore {
    /// Store one procedure. The trigger condition is what gets embedded -
    /// retrieval matches situations, not procedure bodies.
    pub fn procedural_store(
        &self,
        scope: &Scope,
        agent_id: &str,
        procedure_type: &str,
        trigger_condition: &str,
        content: &str,
    ) -> Result<ProceduralRecord> {
        let embedding = self
            .provider()
            .embed(trigger_condition)
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;

        let id = Uuid::new_v4().to_string();
        let now = now_str();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO procedural_memory
                 (id, tenant_id, user_id, agent_id, procedure_type,
                  trigger_condition, content, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                scope.tenant_id,
                scope.user_id,
                agent_id,
                procedure_type,
                trigger_condition,
                content,
                embedding_to_blob(&embedding),
                now,
            ],
        )?;

        Ok(ProceduralRecord {
            id,
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            agent_id: agent_id.to_string(),
            procedure_type: procedure_type.to_string(),
            trigger_condition: trigger_condition.to_string(),
            content: content.to_string(),
            created_at: parse_timestamp(&now),
            score: None,
        })
    }

    /// Vector search over trigger conditions, similarity descending.
    pub fn procedural_search(
        &self,
        scope: &Scope,
        agent_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ProceduralRecord>> {
        let query_embedding = self
            .provider()
            .embed(query)
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, user_id, agent_id, procedure_type,
                    trigger_condition, content, created_at, embedding
             FROM procedural_memory
             WHERE tenant_id = ?1 AND user_id = ?2
               AND (?3 IS NULL OR agent_id = ?3)",
        )?;
        let rows = stmt.query_map(
            params![scope.tenant_id, scope.user_id, agent_id],
            |row| {
                let created: String = row.get(7)?;
                let blob: Option<Vec<u8>> = row.get(8)?;
                let similarity = blob
                    .map(|b| cosine_similarity(&query_embedding, &blob_to_embedding(&b)))
                    .unwrap_or(0.0);
                Ok(ProceduralRecord {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    user_id: row.get(2)?,
                    agent_id: row.get(3)?,
                    procedure_type: row.get(4)?,
                    trigger_condition: row.get(5)?,
                    content: row.get(6)?,
                    created_at: parse_timestamp(&created),
                    score: Some(similarity),
                })
            },
        )?;

        let mut results = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("procedural search failed")?;
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{scope, test_store};

    #[test]
    fn store_and_search_by_trigger() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        store
            .procedural_store(
                &s,
                "a1",
                "recovery",
                "payment provider returns a timeout",
                "retry twice with backoff then escalate",
            )
            .unwrap();
        store
            .procedural_store(
                &s,
                "a1",
                "greeting",
                "new customer joins the channel",
                "send the welcome flow",
            )
            .unwrap();

        let hits = store
            .procedural_search(&s, Some("a1"), "timeout from the payment provider", 5)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].procedure_type, "recovery");
        assert!(hits[0].score.unwrap() > hits[1].score.unwrap());
    }

    #[test]
    fn search_is_scoped_to_the_user() {
        let (store, _dir) = test_store();
        let alice = scope("t1", "alice");
        let bob = scope("t1", "bob");

        store
            .procedural_store(&alice, "a1", "habit", "daily report due", "compile the numbers")
            .unwrap();

        assert!(store.procedural_search(&bob, None, "daily report", 5).unwrap().is_empty());
    }
}
