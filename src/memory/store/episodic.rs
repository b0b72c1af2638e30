// Episodic memory - append-only interaction log
//
// Immutable rows recording what an agent saw and said. Content is embedded
// at append time; search embeds the query and ranks by cosine similarity,
// recency queries read newest-first.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{MemoryStore, Scope};
use crate::embeddings::{blob_to_embedding, cosine_similarity, embedding_to_blob};
use crate::util::{now_str, parse_timestamp};

/// Hard cap on `limit` for recency and search queries.
pub const MAX_LIMIT: usize = 100;

/// Default result window.
pub const DEFAULT_LIMIT: usize = 10;

/// Who produced an interaction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpisodicRecord {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Value,
    pub created_at: Option<DateTime<Utc>>,
    /// Similarity to the query; only set on search results
    pub score: Option<f32>,
}

impl MemoryStore {
    /// Append one interaction. The row is immutable once written.
    pub fn episodic_append(
        &self,
        scope: &Scope,
        agent_id: &str,
        role: Role,
        content: &str,
        metadata: Value,
    ) -> Result<EpisodicRecord> {
        let embedding = self
            .provider()
            .embed(content)
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;

        let id = Uuid::new_v4().to_string();
        let now = now_str();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO episodic_memory
                 (id, tenant_id, user_id, agent_id, role, content, metadata,
                  embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                scope.tenant_id,
                scope.user_id,
                agent_id,
                role.as_str(),
                content,
                serde_json::to_string(&metadata)?,
                embedding_to_blob(&embedding),
                now,
            ],
        )?;

        Ok(EpisodicRecord {
            id,
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            agent_id: agent_id.to_string(),
            role,
            content: content.to_string(),
            metadata,
            created_at: parse_timestamp(&now),
            score: None,
        })
    }

    /// Newest rows first, up to `limit` (capped at 100, default 10).
    pub fn episodic_recent(
        &self,
        scope: &Scope,
        agent_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<EpisodicRecord>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, user_id, agent_id, role, content, metadata, created_at
             FROM episodic_memory
             WHERE tenant_id = ?1 AND user_id = ?2
               AND (?3 IS NULL OR agent_id = ?3)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![scope.tenant_id, scope.user_id, agent_id, limit as i64],
            row_to_record,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("episodic recency query failed")
    }

    /// Vector search over the user's log, ordered by similarity descending.
    pub fn episodic_search(
        &self,
        scope: &Scope,
        agent_id: Option<&str>,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EpisodicRecord>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let query_embedding = self
            .provider()
            .embed(query)
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, user_id, agent_id, role, content, metadata,
                    created_at, embedding
             FROM episodic_memory
             WHERE tenant_id = ?1 AND user_id = ?2
               AND (?3 IS NULL OR agent_id = ?3)",
        )?;
        let rows = stmt.query_map(
            params![scope.tenant_id, scope.user_id, agent_id],
            |row| {
                let mut record = row_to_record(row)?;
                let blob: Option<Vec<u8>> = row.get(8)?;
                let similarity = blob
                    .map(|b| cosine_similarity(&query_embedding, &blob_to_embedding(&b)))
                    .unwrap_or(0.0);
                record.score = Some(similarity);
                Ok(record)
            },
        )?;

        let mut results = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("episodic search failed")?;
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodicRecord> {
    let role: String = row.get(4)?;
    let metadata: String = row.get(6)?;
    let created: String = row.get(7)?;
    Ok(EpisodicRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        agent_id: row.get(3)?,
        role: role.parse().unwrap_or(Role::System),
        content: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at: parse_timestamp(&created),
        score: None,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{scope, test_store};
    use super::*;
    use serde_json::json;

    #[test]
    fn recent_returns_newest_first_with_limit() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        for n in 0..5 {
            store
                .episodic_append(&s, "a1", Role::User, &format!("message {}", n), json!({}))
                .unwrap();
        }

        let recent = store.episodic_recent(&s, Some("a1"), Some(3)).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "message 4");
        assert_eq!(recent[2].content, "message 2");
    }

    #[test]
    fn limit_is_capped_and_defaulted() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");
        for n in 0..12 {
            store
                .episodic_append(&s, "a1", Role::Tool, &format!("m{}", n), json!({}))
                .unwrap();
        }

        assert_eq!(store.episodic_recent(&s, None, None).unwrap().len(), 10);
        // Requests beyond the cap are clamped, not rejected.
        assert_eq!(
            store.episodic_recent(&s, None, Some(100_000)).unwrap().len(),
            12
        );
    }

    #[test]
    fn search_ranks_by_similarity_and_attaches_scores() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        store
            .episodic_append(&s, "a1", Role::Assistant, "rust borrow checker lifetimes", json!({}))
            .unwrap();
        store
            .episodic_append(&s, "a1", Role::Assistant, "pasta carbonara recipe", json!({}))
            .unwrap();

        let hits = store
            .episodic_search(&s, Some("a1"), "borrow checker in rust", Some(2))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score.is_some());
        assert_eq!(hits[0].content, "rust borrow checker lifetimes");
        assert!(hits[0].score.unwrap() >= hits[1].score.unwrap());
    }

    #[test]
    fn scope_and_agent_filters_apply() {
        let (store, _dir) = test_store();
        let alice = scope("t1", "alice");
        let bob = scope("t1", "bob");

        store
            .episodic_append(&alice, "a1", Role::User, "alice says hi", json!({}))
            .unwrap();
        store
            .episodic_append(&alice, "a2", Role::User, "other agent", json!({}))
            .unwrap();

        assert!(store.episodic_recent(&bob, None, None).unwrap().is_empty());
        assert_eq!(store.episodic_recent(&alice, None, None).unwrap().len(), 2);
        assert_eq!(
            store.episodic_recent(&alice, Some("a1"), None).unwrap().len(),
            1
        );
    }
}
