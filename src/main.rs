//! # GitWeek CLI (`gw`)
//!
//! The `gw` binary is the primary interface for GitWeek. It provides
//! commands for database initialization, repository syncing, search,
//! question answering, and starting the HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! gw --config ./config/gw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gw init` | Create the SQLite database and run schema migrations |
//! | `gw repos` | List configured repositories and their sync checkpoints |
//! | `gw sync <all\|owner/name>` | Fetch, normalize, upsert, and index contributions |
//! | `gw search "<query>"` | Search indexed contributions |
//! | `gw select <owner/name> <kind> <id>` | Toggle a contribution's inclusion flag |
//! | `gw ask <user> <week> "<question>"` | Ask a question about a user's week |
//! | `gw serve api` | Start the HTTP API server |

mod answer;
mod config;
mod conversation;
mod db;
mod embedding;
mod index;
mod ingest;
mod migrate;
mod models;
mod normalize;
mod repos;
mod search;
mod server;
mod source;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::models::ContributionType;
use crate::search::SearchFilters;

/// GitWeek CLI — weekly, searchable, answerable records of code-hosting
/// activity.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gw.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gw",
    about = "GitWeek — aggregates code-hosting activity into weekly, searchable, answerable records",
    version,
    long_about = "GitWeek incrementally fetches commits, pull requests, issues, and releases \
    from the GitHub REST API, normalizes and indexes them for hybrid search, and answers \
    natural-language questions about a developer's week with evidence citations."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (contributions, repo_checkpoints, search_documents, documents_fts,
    /// document_vectors). This command is idempotent.
    Init,

    /// List configured repositories, credentials, and sync checkpoints.
    Repos,

    /// Sync contributions from the source API.
    ///
    /// Fetches commits, pull requests, issues, and releases since the last
    /// checkpoint, normalizes them, upserts them into the contribution
    /// store, and indexes them for search. Failures are isolated per
    /// repository and reported in a structured summary.
    Sync {
        /// Sync target: `all`, or one repository as `owner/name`.
        target: String,

        /// Ignore checkpoints — refetch full history.
        #[arg(long)]
        full: bool,
    },

    /// Search indexed contributions.
    ///
    /// Uses hybrid ranking (keyword + vector) when an embedding provider is
    /// configured, keyword-only otherwise.
    Search {
        /// The search query string.
        query: String,

        /// Filter by the contributing user.
        #[arg(long)]
        user: Option<String>,

        /// Filter by ISO week label (e.g. `2024-W21`).
        #[arg(long)]
        week: Option<String>,

        /// Filter by kind: commit, pull_request, issue, or release.
        #[arg(long)]
        kind: Option<String>,

        /// Filter by repository link.
        #[arg(long)]
        repository: Option<String>,

        /// Only return contributions marked as selected.
        #[arg(long)]
        selected_only: bool,

        /// Only results created on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only results created on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Result ordering: relevance, newest, or oldest.
        #[arg(long, default_value = "relevance")]
        sort: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<i64>,

        /// Number of ranked results to skip.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Toggle the inclusion flag on one contribution.
    ///
    /// Deselected contributions stay in the store but can be filtered out
    /// of search and summaries. The flag survives re-ingestion.
    Select {
        /// Repository as `owner/name`.
        repository: String,

        /// Contribution kind: commit, pull_request, issue, or release.
        kind: String,

        /// The contribution's external id (commit sha, PR/issue number,
        /// release id).
        external_id: String,

        /// Deselect instead of select.
        #[arg(long)]
        exclude: bool,
    },

    /// Ask a question about a user's week.
    ///
    /// Retrieves evidence scoped to the user and week, invokes the
    /// configured answer provider, and prints the answer with citations.
    /// Multi-turn conversation context is kept by the API server; each CLI
    /// invocation starts a fresh thread.
    Ask {
        /// The user whose activity is being asked about.
        user: String,

        /// ISO week label (e.g. `2024-W21`).
        week: String,

        /// The question.
        question: String,
    },

    /// Start the HTTP API server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

/// Server subcommands.
#[derive(Subcommand)]
enum ServeService {
    /// Start the JSON HTTP API on the configured bind address.
    Api,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Repos => {
            repos::list_repos(&cfg).await?;
        }
        Commands::Sync { target, full } => {
            ingest::run_sync(&cfg, &target, full).await?;
        }
        Commands::Search {
            query,
            user,
            week,
            kind,
            repository,
            selected_only,
            since,
            until,
            sort,
            limit,
            offset,
        } => {
            let kind = match kind {
                Some(ref value) => Some(ContributionType::parse(value).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown kind: '{}'. Use commit, pull_request, issue, or release.",
                        value
                    )
                })?),
                None => None,
            };

            let sort = search::SortOrder::parse(&sort).ok_or_else(|| {
                anyhow::anyhow!("Unknown sort: '{}'. Use relevance, newest, or oldest.", sort)
            })?;

            let filters = SearchFilters {
                user,
                week,
                kind,
                repository,
                is_selected: selected_only.then_some(true),
                since: since.as_deref().map(parse_day_start).transpose()?,
                until: until.as_deref().map(parse_day_end).transpose()?,
            };

            let pool = db::connect(&cfg).await?;
            search::run_search(&pool, &cfg, &query, &filters, sort, limit, offset).await?;
            pool.close().await;
        }
        Commands::Select {
            repository,
            kind,
            external_id,
            exclude,
        } => {
            let kind = ContributionType::parse(&kind).ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown kind: '{}'. Use commit, pull_request, issue, or release.",
                    kind
                )
            })?;
            let link = repository_link(&cfg, &repository)?;

            let pool = db::connect(&cfg).await?;
            let found =
                ingest::set_selected(&pool, &link, kind, &external_id, !exclude).await?;
            pool.close().await;

            if found {
                let state = if exclude { "deselected" } else { "selected" };
                println!("{} {} {} {}", state, repository, kind, external_id);
            } else {
                anyhow::bail!("No such contribution: {} {} {}", repository, kind, external_id);
            }
        }
        Commands::Ask {
            user,
            week,
            question,
        } => {
            if !models::is_week_label(&week) {
                anyhow::bail!("'{}' is not an ISO week label (expected YYYY-Www)", week);
            }

            let pool = db::connect(&cfg).await?;
            let store = conversation::MemoryConversationStore::new();
            let provider = answer::create_provider(&cfg.answer)?;

            let response = answer::answer_question(
                &pool,
                &cfg,
                &store,
                provider.as_ref(),
                &user,
                &week,
                &question,
                None,
            )
            .await?;
            pool.close().await;

            println!("{}", response.answer);
            println!();
            println!("confidence: {:.2}", response.confidence);
            if !response.evidence.is_empty() {
                println!("evidence:");
                for item in &response.evidence {
                    println!(
                        "  [{}] ({}) {} — {}",
                        item.id, item.kind, item.title, item.repository
                    );
                }
            }
            println!("conversation: {}", response.conversation_id);
        }
        Commands::Serve { service } => match service {
            ServeService::Api => {
                server::run_server(&cfg).await?;
            }
        },
    }

    Ok(())
}

/// Resolve `owner/name` against the configured repositories.
fn repository_link(config: &config::Config, full_name: &str) -> anyhow::Result<String> {
    config
        .github
        .repositories
        .iter()
        .find(|r| r.full_name() == full_name)
        .map(|r| r.link())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown repository: '{}'. Configure it under [[github.repositories]].",
                full_name
            )
        })
}

fn parse_day_start(s: &str) -> anyhow::Result<i64> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp())
}

fn parse_day_end(s: &str) -> anyhow::Result<i64> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    Ok(date.and_hms_opt(23, 59, 59).unwrap().and_utc().timestamp())
}
