//! Source client for the GitHub REST API.
//!
//! Fetches the four contribution kinds (commits, pull requests, issues,
//! releases) for a repository since a checkpoint timestamp. Pagination is
//! handled here; callers see a flat list of [`RawContribution`]s.
//!
//! Rate limiting is surfaced as [`SourceError::RateLimited`] with a
//! retry-after hint, distinct from generic transport failures and from a
//! missing credential (which is a configuration error, not a rate limit).
//!
//! # Ordering
//!
//! No ordering is guaranteed across kinds. Within a kind the source API
//! order is preserved: commits and issues arrive reverse-chronological,
//! pull requests by update time descending, releases by creation descending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::config::{GithubConfig, RepositoryConfig, SyncConfig};
use crate::models::{ContributionType, RawContribution};

const PER_PAGE: usize = 100;
// Upper bound on pages per kind per cycle; keeps a runaway cursor from
// turning one cycle into an unbounded crawl.
const MAX_PAGES: usize = 50;

/// Failure classes a source fetch can surface.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited by source API, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("no credential available: environment variable {0} is not set")]
    MissingCredential(String),
    #[error("source API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// The seam between the ingestion coordinator and the external API.
///
/// The production implementation is [`GithubClient`]; tests supply scripted
/// mocks. The returned sequence is finite and not restartable — on retry the
/// caller re-issues the call from its checkpoint.
#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn list_since(
        &self,
        repo: &RepositoryConfig,
        kind: ContributionType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawContribution>, SourceError>;
}

/// Authenticated GitHub REST client.
pub struct GithubClient {
    api_base: String,
    client: reqwest::Client,
}

impl GithubClient {
    pub fn new(github: &GithubConfig, sync: &SyncConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(sync.source_timeout_secs))
            .user_agent(concat!("gitweek/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            api_base: github.api_base.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Resolve the bearer token for a repository from its configured
    /// environment variable.
    fn resolve_token(&self, repo: &RepositoryConfig) -> Result<String, SourceError> {
        std::env::var(&repo.token_env)
            .map_err(|_| SourceError::MissingCredential(repo.token_env.clone()))
    }

    fn endpoint(&self, repo: &RepositoryConfig, kind: ContributionType) -> String {
        let resource = match kind {
            ContributionType::Commit => "commits",
            ContributionType::PullRequest => "pulls",
            ContributionType::Issue => "issues",
            ContributionType::Release => "releases",
        };
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, repo.owner, repo.name, resource
        )
    }

    fn query_params(
        kind: ContributionType,
        since: Option<DateTime<Utc>>,
        page: usize,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("per_page".to_string(), PER_PAGE.to_string()),
            ("page".to_string(), page.to_string()),
        ];
        match kind {
            ContributionType::Commit => {
                if let Some(ts) = since {
                    params.push(("since".to_string(), ts.to_rfc3339()));
                }
            }
            ContributionType::PullRequest => {
                params.push(("state".to_string(), "all".to_string()));
                params.push(("sort".to_string(), "updated".to_string()));
                params.push(("direction".to_string(), "desc".to_string()));
            }
            ContributionType::Issue => {
                params.push(("state".to_string(), "all".to_string()));
                if let Some(ts) = since {
                    params.push(("since".to_string(), ts.to_rfc3339()));
                }
            }
            ContributionType::Release => {}
        }
        params
    }

    async fn fetch_page(
        &self,
        url: &str,
        token: &str,
        params: &[(String, String)],
    ) -> Result<Vec<serde_json::Value>, SourceError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 || status.as_u16() == 403 {
            if let Some(err) = classify_rate_limit(status.as_u16(), response.headers()) {
                return Err(err);
            }
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                message: truncate_message(&message),
            });
        }

        let items: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        items
            .as_array()
            .cloned()
            .ok_or_else(|| SourceError::Api {
                status: status.as_u16(),
                message: "expected a JSON array".to_string(),
            })
    }
}

#[async_trait]
impl SourceApi for GithubClient {
    async fn list_since(
        &self,
        repo: &RepositoryConfig,
        kind: ContributionType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawContribution>, SourceError> {
        let token = self.resolve_token(repo)?;
        let url = self.endpoint(repo, kind);
        let link = repo.link();

        let mut out = Vec::new();

        for page in 1..=MAX_PAGES {
            let params = Self::query_params(kind, since, page);
            let items = self.fetch_page(&url, &token, &params).await?;
            let page_len = items.len();

            for payload in items {
                // The issues endpoint also returns pull requests; those are
                // fetched by the dedicated pulls endpoint.
                if kind == ContributionType::Issue && payload.get("pull_request").is_some() {
                    continue;
                }
                if !item_in_window(kind, &payload, since) {
                    continue;
                }
                out.push(RawContribution {
                    kind,
                    repository: link.clone(),
                    payload,
                });
            }

            if page_len < PER_PAGE {
                break;
            }
        }

        Ok(out)
    }
}

/// Decide whether a 403/429 response is a rate limit and extract the
/// retry-after hint. A 403 without exhausted quota stays a generic API error.
fn classify_rate_limit(status: u16, headers: &reqwest::header::HeaderMap) -> Option<SourceError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let remaining_exhausted = header("x-ratelimit-remaining")
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    if status == 403 && !remaining_exhausted {
        return None;
    }

    let retry_after_secs = header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .or_else(|| {
            header("x-ratelimit-reset")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(|reset| (reset - Utc::now().timestamp()).max(0) as u64)
        })
        .unwrap_or(60);

    Some(SourceError::RateLimited { retry_after_secs })
}

/// Client-side window filter for kinds whose endpoint has no `since` param.
///
/// Commits and issues are filtered server-side already; pull requests and
/// releases are filtered here on their timestamps.
fn item_in_window(
    kind: ContributionType,
    payload: &serde_json::Value,
    since: Option<DateTime<Utc>>,
) -> bool {
    let Some(since) = since else {
        return true;
    };

    let field = match kind {
        ContributionType::Commit | ContributionType::Issue => return true,
        ContributionType::PullRequest => "updated_at",
        ContributionType::Release => "created_at",
    };

    match payload
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        Some(ts) => ts.with_timezone(&Utc) > since,
        // No timestamp to judge by: keep the item, the upsert is idempotent.
        None => true,
    }
}

fn truncate_message(message: &str) -> String {
    const MAX: usize = 300;
    if message.len() <= MAX {
        message.to_string()
    } else {
        let mut end = MAX;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &message[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_429_is_rate_limited_with_retry_after() {
        let err = classify_rate_limit(429, &headers(&[("retry-after", "17")])).unwrap();
        match err {
            SourceError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 17),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_403_with_quota_left_is_not_rate_limited() {
        let result = classify_rate_limit(403, &headers(&[("x-ratelimit-remaining", "42")]));
        assert!(result.is_none());
    }

    #[test]
    fn test_403_with_exhausted_quota_is_rate_limited() {
        let reset = (Utc::now().timestamp() + 120).to_string();
        let err = classify_rate_limit(
            403,
            &headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", &reset)]),
        )
        .unwrap();
        match err {
            SourceError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs > 100 && retry_after_secs <= 120);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_defaults_to_sixty_seconds() {
        let err = classify_rate_limit(429, &headers(&[])).unwrap();
        match err {
            SourceError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 60),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_window_filter_for_releases() {
        let since = Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap();
        let newer = serde_json::json!({ "created_at": "2024-05-21T10:00:00Z" });
        let older = serde_json::json!({ "created_at": "2024-05-01T10:00:00Z" });
        let missing = serde_json::json!({});

        assert!(item_in_window(ContributionType::Release, &newer, Some(since)));
        assert!(!item_in_window(ContributionType::Release, &older, Some(since)));
        assert!(item_in_window(ContributionType::Release, &missing, Some(since)));
    }

    #[test]
    fn test_commits_trust_server_side_since() {
        let since = Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap();
        let payload = serde_json::json!({});
        assert!(item_in_window(ContributionType::Commit, &payload, Some(since)));
    }

    #[test]
    fn test_query_params_per_kind() {
        let since = Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap();

        let commit = GithubClient::query_params(ContributionType::Commit, Some(since), 1);
        assert!(commit.iter().any(|(k, _)| k == "since"));

        let pulls = GithubClient::query_params(ContributionType::PullRequest, Some(since), 1);
        assert!(pulls.iter().any(|(k, v)| k == "state" && v == "all"));
        assert!(!pulls.iter().any(|(k, _)| k == "since"));

        let releases = GithubClient::query_params(ContributionType::Release, None, 3);
        assert!(releases.iter().any(|(k, v)| k == "page" && v == "3"));
    }
}
