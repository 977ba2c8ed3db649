//! Ingestion pipeline orchestration.
//!
//! Drives the full sync flow per repository: source fetch → normalization →
//! upsert → checkpoint → indexing. Repositories are independent units of
//! work with isolated failures; a rate-limited or broken repository never
//! aborts the others.
//!
//! Checkpoint rules:
//! - advanced to the cycle start time, and only when the cycle fetched at
//!   least one contribution and persistence succeeded;
//! - a zero-result cycle leaves the checkpoint untouched, so clock skew or
//!   pagination gaps cannot cause permanent data loss;
//! - a rate-limited cycle leaves the checkpoint untouched, so the skipped
//!   remainder is re-fetched on the next scheduled run.
//!
//! Cancelling a sync mid-repository drops the cycle before its checkpoint
//! write, which guarantees at-least-once re-delivery on retry.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::{Config, RepositoryConfig};
use crate::db;
use crate::index;
use crate::models::{
    Contribution, ContributionType, RawContribution, RepoSyncReport, SyncError, SyncReport,
    SyncStage,
};
use crate::normalize;
use crate::source::{GithubClient, SourceApi, SourceError};

// A checkpoint older than this makes a zero-result cycle suspicious: the
// upstream cursor may be stale rather than genuinely empty.
const STALE_CHECKPOINT_DAYS: i64 = 30;

/// Sync every configured repository with bounded parallelism.
pub async fn sync_all(
    pool: &SqlitePool,
    config: &Config,
    source: Arc<dyn SourceApi>,
    full: bool,
) -> SyncReport {
    let started = Instant::now();
    let config = Arc::new(config.clone());
    let semaphore = Arc::new(Semaphore::new(config.sync.max_concurrent_repos));

    let mut tasks = JoinSet::new();
    for repo in config.github.repositories.clone() {
        let pool = pool.clone();
        let config = config.clone();
        let source = source.clone();
        let semaphore = semaphore.clone();

        tasks.spawn(async move {
            // The semaphore is never closed; a failed acquire just means the
            // task runs unthrottled.
            let _permit = semaphore.acquire_owned().await.ok();
            sync_repository(&pool, &config, source.as_ref(), &repo, full).await
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                // A panicked repository task is isolated like any other failure.
                let mut report = RepoSyncReport::new("unknown");
                report.errors.push(SyncError {
                    repository: "unknown".to_string(),
                    stage: SyncStage::Fetching,
                    message: format!("sync task failed: {}", e),
                    retry_after_secs: None,
                });
                reports.push(report);
            }
        }
    }

    reports.sort_by(|a, b| a.repository.cmp(&b.repository));
    SyncReport::from_repo_reports(&reports, started.elapsed().as_millis() as u64)
}

/// Run one repository's sync cycle. Never fails outright: every error is
/// recorded in the returned report.
pub async fn sync_repository(
    pool: &SqlitePool,
    config: &Config,
    source: &dyn SourceApi,
    repo: &RepositoryConfig,
    full: bool,
) -> RepoSyncReport {
    let link = repo.link();
    let mut report = RepoSyncReport::new(link.clone());
    let cycle_start = Utc::now();

    let checkpoint = if full {
        None
    } else {
        match get_checkpoint(pool, &link).await {
            Ok(cp) => cp,
            Err(e) => {
                report.errors.push(SyncError {
                    repository: link,
                    stage: SyncStage::Persisting,
                    message: format!("failed to read checkpoint: {}", e),
                    retry_after_secs: None,
                });
                return report;
            }
        }
    };
    let since = checkpoint.and_then(|ts| DateTime::from_timestamp(ts, 0));

    // FETCHING — the four kinds are independent reads into disjoint buckets;
    // a failure in one must not abort the others.
    let (raw_items, fetch_errors, rate_limited) = fetch_all_kinds(source, repo, since).await;
    report.fetched = raw_items.len() as u64;
    report.errors.extend(fetch_errors);

    // NORMALIZING — malformed items are skipped at item granularity.
    let mut contributions = Vec::with_capacity(raw_items.len());
    let mut skipped = 0u64;
    for raw in &raw_items {
        match normalize::normalize(raw) {
            Ok(c) => contributions.push(c),
            Err(e) => {
                tracing::warn!(repository = %report.repository, kind = %raw.kind, error = %e, "skipping malformed item");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        report.errors.push(SyncError {
            repository: report.repository.clone(),
            stage: SyncStage::Normalizing,
            message: format!("skipped {} malformed items", skipped),
            retry_after_secs: None,
        });
    }

    // PERSISTING — one transaction per cycle; the checkpoint only moves if
    // this commits.
    let persisted = match persist_batch(pool, &contributions).await {
        Ok(pairs) => pairs,
        Err(e) => {
            report.errors.push(SyncError {
                repository: report.repository.clone(),
                stage: SyncStage::Persisting,
                message: e.to_string(),
                retry_after_secs: None,
            });
            return report;
        }
    };
    report.upserted = persisted.len() as u64;

    if report.fetched > 0 && !rate_limited {
        match set_checkpoint(pool, &report.repository, cycle_start.timestamp()).await {
            Ok(()) => report.checkpoint_advanced = true,
            Err(e) => report.errors.push(SyncError {
                repository: report.repository.clone(),
                stage: SyncStage::Persisting,
                message: format!("failed to advance checkpoint: {}", e),
                retry_after_secs: None,
            }),
        }
    } else if report.fetched == 0 && report.errors.is_empty() {
        log_zero_result(&report.repository, checkpoint);
    }

    // INDEXING — failures are reported but never roll back the upsert; the
    // contribution store is the source of truth and the index is rebuildable.
    match index::index_batch(pool, config, &persisted).await {
        Ok(index_report) => {
            report.indexed = index_report.indexed;
            report.index_failed = index_report.failed;
            if index_report.failed > 0 {
                report.errors.push(SyncError {
                    repository: report.repository.clone(),
                    stage: SyncStage::Indexing,
                    message: format!(
                        "{} documents failed to index: {}",
                        index_report.failed,
                        index_report.failures.join("; ")
                    ),
                    retry_after_secs: None,
                });
            }
        }
        Err(e) => {
            report.index_failed = persisted.len() as u64;
            report.errors.push(SyncError {
                repository: report.repository.clone(),
                stage: SyncStage::Indexing,
                message: e.to_string(),
                retry_after_secs: None,
            });
        }
    }

    report
}

/// Fetch all four kinds concurrently. Returns the flattened items, the
/// per-kind errors (rate-limit errors collapsed into a single entry), and
/// whether a rate limit was hit.
async fn fetch_all_kinds(
    source: &dyn SourceApi,
    repo: &RepositoryConfig,
    since: Option<DateTime<Utc>>,
) -> (Vec<RawContribution>, Vec<SyncError>, bool) {
    let link = repo.link();

    let (commits, pulls, issues, releases) = tokio::join!(
        source.list_since(repo, ContributionType::Commit, since),
        source.list_since(repo, ContributionType::PullRequest, since),
        source.list_since(repo, ContributionType::Issue, since),
        source.list_since(repo, ContributionType::Release, since),
    );

    let mut items = Vec::new();
    let mut errors = Vec::new();
    let mut rate_limit: Option<u64> = None;

    for (kind, result) in ContributionType::ALL
        .into_iter()
        .zip([commits, pulls, issues, releases])
    {
        match result {
            Ok(batch) => items.extend(batch),
            Err(SourceError::RateLimited { retry_after_secs }) => {
                tracing::warn!(repository = %link, %kind, retry_after_secs, "rate limited");
                rate_limit = Some(rate_limit.map_or(retry_after_secs, |r| r.max(retry_after_secs)));
            }
            Err(e) => {
                tracing::warn!(repository = %link, %kind, error = %e, "fetch failed");
                errors.push(SyncError {
                    repository: link.clone(),
                    stage: SyncStage::Fetching,
                    message: format!("{}: {}", kind, e),
                    retry_after_secs: None,
                });
            }
        }
    }

    // One structured rate-limit entry per repository, with the hint callers
    // need for the next scheduled cycle.
    if let Some(retry_after_secs) = rate_limit {
        errors.push(SyncError {
            repository: link,
            stage: SyncStage::Fetching,
            message: "rate limited by source API".to_string(),
            retry_after_secs: Some(retry_after_secs),
        });
    }

    (items, errors, rate_limit.is_some())
}

/// Upsert a batch inside one transaction. Returns `(row_id, contribution)`
/// pairs for the indexing phase.
async fn persist_batch(
    pool: &SqlitePool,
    contributions: &[Contribution],
) -> Result<Vec<(String, Contribution)>> {
    let mut pairs = Vec::with_capacity(contributions.len());
    if contributions.is_empty() {
        return Ok(pairs);
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now().timestamp();

    for contribution in contributions {
        let existing_id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM contributions WHERE repository = ? AND kind = ? AND external_id = ?",
        )
        .bind(&contribution.repository)
        .bind(contribution.kind.as_str())
        .bind(&contribution.external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let row_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        // Content fields follow the source; is_selected belongs to the user
        // and is deliberately absent from the conflict update.
        sqlx::query(
            r#"
            INSERT INTO contributions (id, repository, kind, external_id, username, summary, created_at, detail_json, is_selected, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(repository, kind, external_id) DO UPDATE SET
                username = excluded.username,
                summary = excluded.summary,
                created_at = excluded.created_at,
                detail_json = excluded.detail_json,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&row_id)
        .bind(&contribution.repository)
        .bind(contribution.kind.as_str())
        .bind(&contribution.external_id)
        .bind(&contribution.username)
        .bind(&contribution.summary)
        .bind(contribution.created_at.timestamp())
        .bind(&contribution.detail_json)
        .bind(contribution.is_selected)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // The indexing phase must see the stored selection state, not the
        // default on the freshly normalized value.
        let stored_selected: bool =
            sqlx::query_scalar("SELECT is_selected FROM contributions WHERE id = ?")
                .bind(&row_id)
                .fetch_one(&mut *tx)
                .await?;

        let mut stored = contribution.clone();
        stored.is_selected = stored_selected;
        pairs.push((row_id, stored));
    }

    tx.commit().await?;
    Ok(pairs)
}

async fn get_checkpoint(pool: &SqlitePool, repository: &str) -> Result<Option<i64>> {
    let result: Option<Option<i64>> = sqlx::query_scalar(
        "SELECT last_fetched_at FROM repo_checkpoints WHERE repository = ?",
    )
    .bind(repository)
    .fetch_optional(pool)
    .await?;

    Ok(result.flatten())
}

async fn set_checkpoint(pool: &SqlitePool, repository: &str, fetched_at: i64) -> Result<()> {
    let now = Utc::now().timestamp();
    // MAX keeps the checkpoint monotonic even if cycles land out of order.
    sqlx::query(
        r#"
        INSERT INTO repo_checkpoints (repository, last_fetched_at, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(repository) DO UPDATE SET
            last_fetched_at = MAX(COALESCE(repo_checkpoints.last_fetched_at, 0), excluded.last_fetched_at),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(repository)
    .bind(fetched_at)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Distinguish a legitimately quiet cycle from a possibly stale upstream
/// cursor (the "only advance on progress" policy can mask the latter).
fn log_zero_result(repository: &str, checkpoint: Option<i64>) {
    match checkpoint {
        None => {
            tracing::info!(repository, "full-history fetch found no contributions");
        }
        Some(ts) => {
            let age_days = (Utc::now().timestamp() - ts) / 86_400;
            if age_days > STALE_CHECKPOINT_DAYS {
                tracing::warn!(
                    repository,
                    checkpoint_age_days = age_days,
                    "zero results against an old checkpoint; upstream cursor may be stale"
                );
            } else {
                tracing::info!(repository, "no new contributions since checkpoint");
            }
        }
    }
}

/// Toggle the user-controlled inclusion flag on a contribution and mirror it
/// into the search index. Returns false if the contribution does not exist.
pub async fn set_selected(
    pool: &SqlitePool,
    repository: &str,
    kind: ContributionType,
    external_id: &str,
    selected: bool,
) -> Result<bool> {
    let row_id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM contributions WHERE repository = ? AND kind = ? AND external_id = ?",
    )
    .bind(repository)
    .bind(kind.as_str())
    .bind(external_id)
    .fetch_optional(pool)
    .await?;

    let Some(row_id) = row_id else {
        return Ok(false);
    };

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE contributions SET is_selected = ? WHERE id = ?")
        .bind(selected)
        .bind(&row_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE search_documents SET is_selected = ? WHERE contribution_id = ?")
        .bind(selected)
        .bind(&row_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(true)
}

/// CLI entry point for `gw sync`.
pub async fn run_sync(config: &Config, target: &str, full: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let client = GithubClient::new(&config.github, &config.sync)?;

    let report = match target {
        "all" => sync_all(&pool, config, Arc::new(client), full).await,
        name => {
            let Some(repo) = config
                .github
                .repositories
                .iter()
                .find(|r| r.full_name() == name)
            else {
                anyhow::bail!(
                    "Unknown repository: '{}'. Configure it under [[github.repositories]].",
                    name
                );
            };
            let started = Instant::now();
            let repo_report = sync_repository(&pool, config, &client, repo, full).await;
            SyncReport::from_repo_reports(
                std::slice::from_ref(&repo_report),
                started.elapsed().as_millis() as u64,
            )
        }
    };

    println!("sync {}", target);
    println!("  repositories processed: {}", report.repositories_processed);
    println!("  contributions fetched: {}", report.contributions_fetched);
    println!("  contributions upserted: {}", report.contributions_upserted);
    println!("  elapsed: {}ms", report.processing_time_ms);
    if !report.errors.is_empty() {
        println!("  errors:");
        for error in &report.errors {
            match error.retry_after_secs {
                Some(secs) => println!(
                    "    {} [{:?}] {} (retry after {}s)",
                    error.repository, error.stage, error.message, secs
                ),
                None => println!(
                    "    {} [{:?}] {}",
                    error.repository, error.stage, error.message
                ),
            }
        }
    }
    println!("{}", report.status);

    pool.close().await;
    Ok(())
}
