use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables on an already-open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Canonical contribution store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contributions (
            id TEXT PRIMARY KEY,
            repository TEXT NOT NULL,
            kind TEXT NOT NULL,
            external_id TEXT NOT NULL,
            username TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            detail_json TEXT NOT NULL DEFAULT '{}',
            is_selected INTEGER NOT NULL DEFAULT 1,
            ingested_at INTEGER NOT NULL,
            UNIQUE(repository, kind, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-repository sync checkpoints
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repo_checkpoints (
            repository TEXT PRIMARY KEY,
            last_fetched_at INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Index-resident projection of contributions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_documents (
            id TEXT PRIMARY KEY,
            contribution_id TEXT NOT NULL,
            user TEXT NOT NULL,
            week TEXT NOT NULL,
            kind TEXT NOT NULL,
            repository TEXT NOT NULL,
            author TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            is_selected INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Dense vectors, one row per embedded document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_vectors (
            doc_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over search documents
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                doc_id UNINDEXED,
                title,
                body
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_contributions_username ON contributions(username)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_contributions_created_at ON contributions(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_documents_user_week ON search_documents(user, week)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_documents_created_at ON search_documents(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
