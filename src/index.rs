//! Search document construction and index writes.
//!
//! Each contribution becomes exactly one search document with a
//! deterministic id derived from `(user, iso_week, kind, external_id)`, so
//! re-indexing overwrites instead of duplicating. Type-specific field
//! mapping keeps commit messages and diff excerpts, PR/issue titles and
//! bodies, and release notes searchable; large fields are truncated to a
//! bounded excerpt.
//!
//! Embedding failures are collected per document and folded into the batch
//! report; whether a failed embedding fails the document or degrades it to
//! lexical-only is the single `embedding.on_failure` policy switch.

use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::config::{Config, EmbedFailurePolicy};
use crate::embedding;
use crate::models::{Contribution, ContributionType};

/// Index-resident projection of one contribution.
#[derive(Debug, Clone)]
pub struct SearchDocument {
    pub id: String,
    pub contribution_id: String,
    pub user: String,
    pub week: String,
    pub kind: ContributionType,
    pub repository: String,
    pub author: String,
    pub title: String,
    pub body: String,
    pub created_at: i64,
    pub is_selected: bool,
}

/// Outcome of indexing one batch of contributions.
#[derive(Debug, Default)]
pub struct IndexReport {
    pub indexed: u64,
    pub failed: u64,
    pub failures: Vec<String>,
}

/// Deterministic document id from the identity facets.
///
/// Fields are joined with a separator that cannot occur in them before
/// hashing, so `("ab", "c")` and `("a", "bc")` cannot collide.
pub fn document_id(user: &str, week: &str, kind: ContributionType, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [user, week, kind.as_str(), external_id] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Build the search document for a contribution, applying the type-specific
/// field mapping and excerpt bounds.
pub fn build_document(config: &Config, contribution: &Contribution, db_id: &str) -> SearchDocument {
    let week = contribution.week();
    let detail: Value = serde_json::from_str(&contribution.detail_json).unwrap_or(Value::Null);

    let (title, body) = match contribution.kind {
        ContributionType::Commit => {
            let title = contribution
                .summary
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            let mut body = contribution.summary.clone();
            let patches = patch_excerpt(&detail);
            if !patches.is_empty() {
                body.push_str("\n\n");
                body.push_str(&patches);
            }
            (title, body)
        }
        ContributionType::PullRequest | ContributionType::Issue => {
            let mut body = contribution.summary.clone();
            if let Some(text) = detail.get("body").and_then(Value::as_str) {
                if !text.is_empty() {
                    body.push_str("\n\n");
                    body.push_str(text);
                }
            }
            (contribution.summary.clone(), body)
        }
        ContributionType::Release => {
            let notes = detail
                .get("body")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let body = if notes.is_empty() {
                contribution.summary.clone()
            } else {
                format!("{}\n\n{}", contribution.summary, notes)
            };
            (contribution.summary.clone(), body)
        }
    };

    SearchDocument {
        id: document_id(
            &contribution.username,
            &week,
            contribution.kind,
            &contribution.external_id,
        ),
        contribution_id: db_id.to_string(),
        user: contribution.username.clone(),
        week,
        kind: contribution.kind,
        repository: contribution.repository.clone(),
        author: contribution.username.clone(),
        title: truncate_chars(&title, 300),
        body: truncate_chars(&body, config.index.max_excerpt_chars),
        created_at: contribution.created_at.timestamp(),
        is_selected: contribution.is_selected,
    }
}

/// Join per-file patches from the commit detail payload into one excerpt.
fn patch_excerpt(detail: &Value) -> String {
    detail
        .get("files")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.get("patch").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Truncate at a char boundary without splitting a code point.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

/// Index a batch of contributions: build documents, embed them per policy,
/// and upsert into the search store.
///
/// One document's embedding failure never aborts the batch. Write failures
/// against the search store are also collected per document.
pub async fn index_batch(
    pool: &SqlitePool,
    config: &Config,
    contributions: &[(String, Contribution)],
) -> Result<IndexReport> {
    let mut report = IndexReport::default();
    if contributions.is_empty() {
        return Ok(report);
    }

    let documents: Vec<SearchDocument> = contributions
        .iter()
        .map(|(db_id, c)| build_document(config, c, db_id))
        .collect();

    // One embedding result slot per document. Disabled provider means a
    // lexical-only index by configuration, which is not a failure.
    let vectors = embed_documents(config, &documents).await;

    for (doc, vector) in documents.iter().zip(vectors.into_iter()) {
        let vector = match vector {
            Ok(v) => v,
            Err(e) => {
                match config.embedding.on_failure {
                    EmbedFailurePolicy::Strict => {
                        tracing::warn!(doc_id = %doc.id, error = %e, "embedding failed, document skipped");
                        report.failed += 1;
                        report.failures.push(format!("{}: {}", doc.id, e));
                        continue;
                    }
                    EmbedFailurePolicy::Lenient => {
                        tracing::warn!(doc_id = %doc.id, error = %e, "embedding failed, indexing lexical-only");
                        None
                    }
                }
            }
        };

        match upsert_document(pool, config, doc, vector.as_deref()).await {
            Ok(()) => report.indexed += 1,
            Err(e) => {
                report.failed += 1;
                report.failures.push(format!("{}: {}", doc.id, e));
            }
        }
    }

    Ok(report)
}

/// Embed all documents in config-sized batches, producing one result per
/// document. A batch-level failure marks every document in that batch.
async fn embed_documents(
    config: &Config,
    documents: &[SearchDocument],
) -> Vec<Result<Option<Vec<f32>>, embedding::EmbeddingError>> {
    if !config.embedding.is_enabled() {
        return documents.iter().map(|_| Ok(None)).collect();
    }

    let mut results = Vec::with_capacity(documents.len());

    for batch in documents.chunks(config.embedding.batch_size) {
        let texts: Vec<String> = batch
            .iter()
            .map(|d| format!("{}\n{}", d.title, d.body))
            .collect();

        match embedding::embed_texts(&config.embedding, &texts).await {
            Ok(vectors) => {
                for vector in vectors {
                    results.push(Ok(Some(vector)));
                }
            }
            Err(e) => {
                let message = e.to_string();
                for _ in batch {
                    results.push(Err(embedding::EmbeddingError::Unreachable(message.clone())));
                }
            }
        }
    }

    results
}

async fn upsert_document(
    pool: &SqlitePool,
    config: &Config,
    doc: &SearchDocument,
    vector: Option<&[f32]>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO search_documents (id, contribution_id, user, week, kind, repository, author, title, body, created_at, is_selected)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            contribution_id = excluded.contribution_id,
            user = excluded.user,
            week = excluded.week,
            kind = excluded.kind,
            repository = excluded.repository,
            author = excluded.author,
            title = excluded.title,
            body = excluded.body,
            created_at = excluded.created_at,
            is_selected = excluded.is_selected
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.contribution_id)
    .bind(&doc.user)
    .bind(&doc.week)
    .bind(doc.kind.as_str())
    .bind(&doc.repository)
    .bind(&doc.author)
    .bind(&doc.title)
    .bind(&doc.body)
    .bind(doc.created_at)
    .bind(doc.is_selected)
    .execute(&mut *tx)
    .await?;

    // FTS5 has no upsert; replace the row for this document id.
    sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
        .bind(&doc.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO documents_fts (doc_id, title, body) VALUES (?, ?, ?)")
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.body)
        .execute(&mut *tx)
        .await?;

    match vector {
        Some(v) => {
            let blob = embedding::vec_to_blob(v);
            let model = config.embedding.model.as_deref().unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO document_vectors (doc_id, embedding, model, dims)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(doc_id) DO UPDATE SET
                    embedding = excluded.embedding,
                    model = excluded.model,
                    dims = excluded.dims
                "#,
            )
            .bind(&doc.id)
            .bind(blob)
            .bind(model)
            .bind(v.len() as i64)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            // A superseded vector must not survive a lexical-only reindex.
            sqlx::query("DELETE FROM document_vectors WHERE doc_id = ?")
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_commit() -> Contribution {
        Contribution {
            kind: ContributionType::Commit,
            external_id: "abc123".to_string(),
            username: "alice".to_string(),
            repository: "https://github.com/acme/api".to_string(),
            summary: "Fix pagination off-by-one\n\nThe cursor skipped page boundaries.".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 22, 9, 30, 0).unwrap(),
            detail_json: serde_json::json!({
                "files": [
                    { "filename": "src/page.rs", "patch": "@@ -1 +1 @@\n-let n = page;\n+let n = page + 1;" }
                ]
            })
            .to_string(),
            is_selected: true,
        }
    }

    #[test]
    fn test_document_id_is_stable() {
        let a = document_id("alice", "2024-W21", ContributionType::Commit, "abc123");
        let b = document_id("alice", "2024-W21", ContributionType::Commit, "abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_document_id_varies_per_facet() {
        let base = document_id("alice", "2024-W21", ContributionType::Commit, "42");
        assert_ne!(
            base,
            document_id("bob", "2024-W21", ContributionType::Commit, "42")
        );
        assert_ne!(
            base,
            document_id("alice", "2024-W22", ContributionType::Commit, "42")
        );
        // Same external id, different kind: ids must not collide.
        assert_ne!(
            base,
            document_id("alice", "2024-W21", ContributionType::Issue, "42")
        );
    }

    #[test]
    fn test_document_id_resists_boundary_shifts() {
        let a = document_id("ab", "2024-W21", ContributionType::Commit, "c");
        let b = document_id("a", "2024-W21", ContributionType::Commit, "bc");
        assert_ne!(a, b);
    }

    #[test]
    fn test_commit_document_fields() {
        let config = test_config(2000);
        let doc = build_document(&config, &sample_commit(), "row-1");

        assert_eq!(doc.title, "Fix pagination off-by-one");
        assert!(doc.body.contains("cursor skipped"));
        assert!(doc.body.contains("let n = page + 1;"));
        assert_eq!(doc.week, "2024-W21");
        assert_eq!(doc.user, "alice");
    }

    #[test]
    fn test_body_is_truncated() {
        let config = test_config(40);
        let mut c = sample_commit();
        c.summary = "x".repeat(500);
        let doc = build_document(&config, &c, "row-1");
        assert_eq!(doc.body.chars().count(), 40);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld".repeat(10);
        let t = truncate_chars(&s, 15);
        assert_eq!(t.chars().count(), 15);
    }

    #[test]
    fn test_release_document_includes_notes() {
        let config = test_config(2000);
        let c = Contribution {
            kind: ContributionType::Release,
            external_id: "1001".to_string(),
            username: "alice".to_string(),
            repository: "https://github.com/acme/api".to_string(),
            summary: "v1.2.0".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 23, 16, 0, 0).unwrap(),
            detail_json: serde_json::json!({ "body": "Fixes the sync retry loop." }).to_string(),
            is_selected: true,
        };
        let doc = build_document(&config, &c, "row-2");
        assert_eq!(doc.title, "v1.2.0");
        assert!(doc.body.contains("sync retry loop"));
    }

    fn test_config(max_excerpt_chars: usize) -> Config {
        let mut config: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/gw.sqlite"

            [server]
            bind = "127.0.0.1:7400"
            "#,
        )
        .unwrap();
        config.index.max_excerpt_chars = max_excerpt_chars;
        config
    }
}
