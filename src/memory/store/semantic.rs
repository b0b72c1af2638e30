// Semantic memory - durable knowledge items
//
// Knowledge is upserted, never duplicated: a write matches an existing row
// by external_id when one is given, otherwise by the SHA-256 hash of its
// content. The match scope depends on visibility - public items live at
// (tenant, key), private items at (tenant, user, key) - and two partial
// unique indexes in the schema enforce exactly that. Public rows are shared
// tenant-wide with last-writer-wins conflict resolution.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;
use uuid::Uuid;

use super::{MemoryStore, Scope};
use crate::embeddings::{blob_to_embedding, cosine_similarity, embedding_to_blob};
use crate::util::{now_str, parse_timestamp, sha256_hex};

/// Cap and default for search windows.
pub const MAX_LIMIT: usize = 100;
pub const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct SemanticRecord {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub content: String,
    pub external_id: Option<String>,
    pub content_hash: String,
    pub is_public: bool,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub metadata: Value,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Similarity to the query; only set on search results
    pub score: Option<f32>,
}

/// One semantic write, as received from the API.
#[derive(Debug, Clone)]
pub struct SemanticUpsert {
    pub content: String,
    pub external_id: Option<String>,
    pub is_public: bool,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub metadata: Value,
}

impl MemoryStore {
    /// Insert or update a knowledge item under the upsert key rules.
    /// The embedding is regenerated on every write.
    pub fn semantic_upsert(&self, scope: &Scope, upsert: &SemanticUpsert) -> Result<SemanticRecord> {
        let content_hash = sha256_hex(&upsert.content);
        let embedding = self
            .provider()
            .embed(&upsert.content)
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_str();

        let existing_id = find_match(&tx, scope, upsert, &content_hash)?;

        let id = match existing_id {
            Some(id) => {
                // user_id moves to the current writer: for public rows that
                // records last-writer-wins ownership, for private rows it is
                // the same user by construction of the match scope.
                tx.execute(
                    "UPDATE semantic_memory SET
                         content = ?2, content_hash = ?3, is_public = ?4,
                         tags = ?5, source = ?6, metadata = ?7, embedding = ?8,
                         user_id = ?9, updated_at = ?10
                     WHERE id = ?1",
                    params![
                        id,
                        upsert.content,
                        content_hash,
                        upsert.is_public,
                        serde_json::to_string(&upsert.tags)?,
                        upsert.source,
                        serde_json::to_string(&upsert.metadata)?,
                        embedding_to_blob(&embedding),
                        scope.user_id,
                        now,
                    ],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO semantic_memory
                         (id, tenant_id, user_id, content, external_id, content_hash,
                          is_public, tags, source, metadata, embedding,
                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                    params![
                        id,
                        scope.tenant_id,
                        scope.user_id,
                        upsert.content,
                        upsert.external_id,
                        content_hash,
                        upsert.is_public,
                        serde_json::to_string(&upsert.tags)?,
                        upsert.source,
                        serde_json::to_string(&upsert.metadata)?,
                        embedding_to_blob(&embedding),
                        now,
                    ],
                )?;
                id
            }
        };
        tx.commit()?;

        self.semantic_get_by_id(&id)?
            .context("upserted semantic row not found")
    }

    fn semantic_get_by_id(&self, id: &str) -> Result<Option<SemanticRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_RECORD),
            params![id],
            row_to_record,
        )
        .optional()
        .context("semantic lookup failed")
    }

    /// Lookup by external id: the caller's private row first, then the
    /// tenant-wide public one.
    pub fn semantic_get_by_external(
        &self,
        scope: &Scope,
        external_id: &str,
    ) -> Result<Option<SemanticRecord>> {
        let conn = self.conn()?;
        let private = conn
            .query_row(
                &format!(
                    "{} WHERE tenant_id = ?1 AND user_id = ?2 AND external_id = ?3
                        AND is_public = 0",
                    SELECT_RECORD
                ),
                params![scope.tenant_id, scope.user_id, external_id],
                row_to_record,
            )
            .optional()?;
        if private.is_some() {
            return Ok(private);
        }

        conn.query_row(
            &format!(
                "{} WHERE tenant_id = ?1 AND external_id = ?2 AND is_public = 1",
                SELECT_RECORD
            ),
            params![scope.tenant_id, external_id],
            row_to_record,
        )
        .optional()
        .context("semantic lookup failed")
    }

    /// Vector search under the privacy rule: the caller's own rows plus,
    /// unless `include_public` is off, every public row in the tenant.
    pub fn semantic_search(
        &self,
        scope: &Scope,
        query: &str,
        limit: Option<usize>,
        include_public: bool,
    ) -> Result<Vec<SemanticRecord>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let query_embedding = self
            .provider()
            .embed(query)
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, user_id, content, external_id, content_hash,
                    is_public, tags, source, metadata, created_at, updated_at,
                    embedding
             FROM semantic_memory
             WHERE tenant_id = ?1
               AND (user_id = ?2 OR (?3 AND is_public = 1))",
        )?;
        let rows = stmt.query_map(
            params![scope.tenant_id, scope.user_id, include_public],
            |row| {
                let mut record = row_to_record(row)?;
                let blob: Option<Vec<u8>> = row.get(12)?;
                let similarity = blob
                    .map(|b| cosine_similarity(&query_embedding, &blob_to_embedding(&b)))
                    .unwrap_or(0.0);
                record.score = Some(similarity);
                Ok(record)
            },
        )?;

        let mut results = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("semantic search failed")?;
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }
}

const SELECT_RECORD: &str = "SELECT id, tenant_id, user_id, content, external_id, content_hash,
        is_public, tags, source, metadata, created_at, updated_at
 FROM semantic_memory";

/// Resolve the row a write should update, per the upsert key rules.
fn find_match(
    tx: &Transaction<'_>,
    scope: &Scope,
    upsert: &SemanticUpsert,
    content_hash: &str,
) -> Result<Option<String>> {
    let sql_and_params: (&str, Vec<&dyn rusqlite::ToSql>) = match (&upsert.external_id, upsert.is_public)
    {
        (Some(external_id), true) => (
            "SELECT id FROM semantic_memory
             WHERE tenant_id = ?1 AND external_id = ?2 AND is_public = 1",
            vec![&scope.tenant_id, external_id],
        ),
        (Some(external_id), false) => (
            "SELECT id FROM semantic_memory
             WHERE tenant_id = ?1 AND user_id = ?2 AND external_id = ?3 AND is_public = 0",
            vec![&scope.tenant_id, &scope.user_id, external_id],
        ),
        (None, true) => (
            "SELECT id FROM semantic_memory
             WHERE tenant_id = ?1 AND content_hash = ?2 AND is_public = 1",
            vec![&scope.tenant_id, &content_hash],
        ),
        (None, false) => (
            "SELECT id FROM semantic_memory
             WHERE tenant_id = ?1 AND user_id = ?2 AND content_hash = ?3 AND is_public = 0",
            vec![&scope.tenant_id, &scope.user_id, &content_hash],
        ),
    };

    tx.query_row(sql_and_params.0, &sql_and_params.1[..], |row| row.get(0))
        .optional()
        .context("semantic match lookup failed")
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SemanticRecord> {
    let tags: String = row.get(7)?;
    let metadata: String = row.get(9)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(SemanticRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        external_id: row.get(4)?,
        content_hash: row.get(5)?,
        is_public: row.get(6)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        source: row.get(8)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at: parse_timestamp(&created),
        updated_at: parse_timestamp(&updated),
        score: None,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{scope, test_store};
    use super::*;
    use serde_json::json;

    fn upsert(content: &str) -> SemanticUpsert {
        SemanticUpsert {
            content: content.to_string(),
            external_id: None,
            is_public: false,
            tags: Vec::new(),
            source: None,
            metadata: json!({}),
        }
    }

    fn upsert_ext(content: &str, external_id: &str, is_public: bool) -> SemanticUpsert {
        SemanticUpsert {
            external_id: Some(external_id.to_string()),
            is_public,
            ..upsert(content)
        }
    }

    #[test]
    fn upsert_by_external_id_updates_and_keeps_created_at() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        let first = store.semantic_upsert(&s, &upsert_ext("v1", "doc", false)).unwrap();
        let second = store.semantic_upsert(&s, &upsert_ext("v2", "doc", false)).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "v2");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        // The search surface sees exactly one row, the second write.
        let hits = store.semantic_search(&s, "v2", None, true).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "v2");
    }

    #[test]
    fn content_hash_dedupes_when_no_external_id() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        let first = store
            .semantic_upsert(&s, &upsert("Python is a programming language"))
            .unwrap();
        let second = store
            .semantic_upsert(&s, &upsert("Python is a programming language"))
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(store.semantic_search(&s, "python", None, true).unwrap().len(), 1);

        // Different content is a different row.
        store.semantic_upsert(&s, &upsert("Rust is different")).unwrap();
        assert_eq!(store.semantic_search(&s, "language", None, true).unwrap().len(), 2);
    }

    #[test]
    fn private_rows_are_invisible_across_users() {
        let (store, _dir) = test_store();
        let alice = scope("t1", "alice");
        let bob = scope("t1", "bob");

        store
            .semantic_upsert(&alice, &upsert_ext("alice secret notes", "notes", false))
            .unwrap();

        assert!(store.semantic_search(&bob, "secret notes", None, true).unwrap().is_empty());
        assert!(store.semantic_get_by_external(&bob, "notes").unwrap().is_none());
        assert!(store.semantic_get_by_external(&alice, "notes").unwrap().is_some());
    }

    #[test]
    fn public_rows_are_tenant_visible_unless_opted_out() {
        let (store, _dir) = test_store();
        let alice = scope("t1", "alice");
        let bob = scope("t1", "bob");

        store
            .semantic_upsert(&alice, &upsert_ext("team API best practices", "practices", true))
            .unwrap();

        let visible = store.semantic_search(&bob, "API practices", None, true).unwrap();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].is_public);

        // include_public = false restricts to the caller's own rows.
        assert!(store
            .semantic_search(&bob, "API practices", None, false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn public_external_id_conflicts_resolve_last_writer_wins() {
        let (store, _dir) = test_store();
        let alice = scope("t1", "alice");
        let bob = scope("t1", "bob");

        let first = store
            .semantic_upsert(&alice, &upsert_ext("v-alice", "shared-doc", true))
            .unwrap();
        let second = store
            .semantic_upsert(&bob, &upsert_ext("v-bob", "shared-doc", true))
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "v-bob");
        assert_eq!(second.user_id, "bob");
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn tenants_never_share_rows() {
        let (store, _dir) = test_store();
        let t1 = scope("t1", "u");
        let t2 = scope("t2", "u");

        store
            .semantic_upsert(&t1, &upsert_ext("tenant one doc", "doc", true))
            .unwrap();

        assert!(store.semantic_search(&t2, "tenant one doc", None, true).unwrap().is_empty());
        // Same external id in another tenant creates an independent row.
        let other = store
            .semantic_upsert(&t2, &upsert_ext("tenant two doc", "doc", true))
            .unwrap();
        assert_eq!(other.content, "tenant two doc");
        assert_eq!(
            store
                .semantic_get_by_external(&t1, "doc")
                .unwrap()
                .unwrap()
                .content,
            "tenant one doc"
        );
    }

    #[test]
    fn search_orders_by_similarity_with_scores() {
        let (store, _dir) = test_store();
        let s = scope("t1", "u1");

        store.semantic_upsert(&s, &upsert("kubernetes deployment rollout")).unwrap();
        store.semantic_upsert(&s, &upsert("sourdough starter feeding")).unwrap();

        let hits = store
            .semantic_search(&s, "deployment rollout kubernetes", None, true)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "kubernetes deployment rollout");
        assert!(hits[0].score.unwrap() > hits[1].score.unwrap());
    }
}
