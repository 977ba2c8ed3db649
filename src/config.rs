use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            repositories: Vec::new(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

/// One registered repository. The credential is resolved per repository from
/// the environment variable named in `token_env` and passed down explicitly,
/// never looked up globally.
#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    pub owner: String,
    pub name: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

impl RepositoryConfig {
    /// Browsable repository link, used as the repository identity everywhere.
    pub fn link(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_final_limit() -> i64 {
    12
}

/// Policy for indexing a document whose embedding call failed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbedFailurePolicy {
    /// The document is reported as failed and not indexed.
    Strict,
    /// The document is indexed lexical-only.
    Lenient,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_on_failure")]
    pub on_failure: EmbedFailurePolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: None,
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            on_failure: EmbedFailurePolicy::Strict,
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_on_failure() -> EmbedFailurePolicy {
    EmbedFailurePolicy::Strict
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Large text fields (diffs, bodies) are truncated to this many
    /// characters before indexing.
    #[serde(default = "default_max_excerpt_chars")]
    pub max_excerpt_chars: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_excerpt_chars: default_max_excerpt_chars(),
        }
    }
}

fn default_max_excerpt_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    #[serde(default = "default_answer_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Most recent turns exposed to the answer generator.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Evidence documents retrieved per question.
    #[serde(default = "default_top_k_evidence")]
    pub top_k_evidence: i64,
    #[serde(default = "default_answer_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: None,
            model: None,
            api_key_env: default_api_key_env(),
            max_history: default_max_history(),
            top_k_evidence: default_top_k_evidence(),
            timeout_secs: default_answer_timeout_secs(),
        }
    }
}

fn default_answer_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_history() -> usize {
    5
}
fn default_top_k_evidence() -> i64 {
    8
}
fn default_answer_timeout_secs() -> u64 {
    60
}

impl AnswerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Repositories synced concurrently. Each repository is an independent
    /// unit of work with isolated failures.
    #[serde(default = "default_max_concurrent_repos")]
    pub max_concurrent_repos: usize,
    #[serde(default = "default_source_timeout_secs")]
    pub source_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_repos: default_max_concurrent_repos(),
            source_timeout_secs: default_source_timeout_secs(),
        }
    }
}

fn default_max_concurrent_repos() -> usize {
    4
}
fn default_source_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    if config.index.max_excerpt_chars == 0 {
        anyhow::bail!("index.max_excerpt_chars must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        "http" => {
            if config.embedding.endpoint.is_none() {
                anyhow::bail!("embedding.endpoint must be set when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, http, or openai.",
            other
        ),
    }

    match config.answer.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.answer.model.is_none() {
                anyhow::bail!("answer.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown answer provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.answer.max_history == 0 {
        anyhow::bail!("answer.max_history must be >= 1");
    }

    if config.sync.max_concurrent_repos == 0 {
        anyhow::bail!("sync.max_concurrent_repos must be >= 1");
    }

    let mut seen = std::collections::HashSet::new();
    for repo in &config.github.repositories {
        if repo.owner.is_empty() || repo.name.is_empty() {
            anyhow::bail!("github.repositories entries need both owner and name");
        }
        if !seen.insert(repo.full_name()) {
            anyhow::bail!("duplicate repository: {}", repo.full_name());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(
            r#"
            [db]
            path = "/tmp/gw.sqlite"

            [server]
            bind = "127.0.0.1:7400"
            "#,
        )
        .unwrap();

        assert_eq!(config.retrieval.hybrid_alpha, 0.6);
        assert_eq!(config.answer.max_history, 5);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.embedding.on_failure, EmbedFailurePolicy::Strict);
        assert!(config.github.repositories.is_empty());
    }

    #[test]
    fn test_repository_link() {
        let repo = RepositoryConfig {
            owner: "acme".to_string(),
            name: "api".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        };
        assert_eq!(repo.link(), "https://github.com/acme/api");
        assert_eq!(repo.full_name(), "acme/api");
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/gw.sqlite"

            [server]
            bind = "127.0.0.1:7400"

            [embedding]
            provider = "http"
            model = "all-minilm"
            dims = 384
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.endpoint"));
    }

    #[test]
    fn test_alpha_out_of_range_rejected() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/gw.sqlite"

            [server]
            bind = "127.0.0.1:7400"

            [retrieval]
            hybrid_alpha = 1.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("hybrid_alpha"));
    }

    #[test]
    fn test_duplicate_repository_rejected() {
        let err = parse(
            r#"
            [db]
            path = "/tmp/gw.sqlite"

            [server]
            bind = "127.0.0.1:7400"

            [[github.repositories]]
            owner = "acme"
            name = "api"

            [[github.repositories]]
            owner = "acme"
            name = "api"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate repository"));
    }

    #[test]
    fn test_lenient_policy_parses() {
        let config = parse(
            r#"
            [db]
            path = "/tmp/gw.sqlite"

            [server]
            bind = "127.0.0.1:7400"

            [embedding]
            provider = "openai"
            model = "text-embedding-3-small"
            dims = 1536
            on_failure = "lenient"
            "#,
        )
        .unwrap();
        assert_eq!(config.embedding.on_failure, EmbedFailurePolicy::Lenient);
    }
}
