//! Repository registration status for the CLI `gw repos` command.

use anyhow::Result;
use chrono::DateTime;
use sqlx::Row;

use crate::config::Config;
use crate::db;

pub async fn list_repos(config: &Config) -> Result<()> {
    if config.github.repositories.is_empty() {
        println!("No repositories configured. Add [[github.repositories]] entries.");
        return Ok(());
    }

    let pool = db::connect(config).await?;

    println!(
        "{:<32} {:<12} {:<20} CHECKPOINT",
        "REPOSITORY", "CREDENTIAL", "TOKEN ENV"
    );

    for repo in &config.github.repositories {
        let credential = if std::env::var(&repo.token_env).is_ok() {
            "set"
        } else {
            "MISSING"
        };

        let checkpoint: Option<Option<i64>> = sqlx::query(
            "SELECT last_fetched_at FROM repo_checkpoints WHERE repository = ?",
        )
        .bind(repo.link())
        .fetch_optional(&pool)
        .await?
        .map(|row| row.get("last_fetched_at"));

        let checkpoint_display = match checkpoint.flatten() {
            Some(ts) => DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| ts.to_string()),
            None => "never synced".to_string(),
        };

        println!(
            "{:<32} {:<12} {:<20} {}",
            repo.full_name(),
            credential,
            repo.token_env,
            checkpoint_display
        );
    }

    pool.close().await;
    Ok(())
}
