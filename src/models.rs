//! Core data models used throughout GitWeek.
//!
//! These types represent the raw and normalized contributions, search hits,
//! and sync reports that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of developer activity a contribution records.
///
/// Each variant maps to one endpoint family of the source API. Normalization
/// dispatches on this tag instead of maintaining parallel code paths per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionType {
    Commit,
    PullRequest,
    Issue,
    Release,
}

impl ContributionType {
    /// All kinds, in the order a sync cycle fetches them.
    pub const ALL: [ContributionType; 4] = [
        ContributionType::Commit,
        ContributionType::PullRequest,
        ContributionType::Issue,
        ContributionType::Release,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionType::Commit => "commit",
            ContributionType::PullRequest => "pull_request",
            ContributionType::Issue => "issue",
            ContributionType::Release => "release",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "commit" => Some(ContributionType::Commit),
            "pull_request" => Some(ContributionType::PullRequest),
            "issue" => Some(ContributionType::Issue),
            "release" => Some(ContributionType::Release),
            _ => None,
        }
    }
}

impl fmt::Display for ContributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw item returned by the source client before normalization.
///
/// `payload` is the untouched JSON object from the source API; the
/// normalizer derives the identity key and canonical fields from it.
#[derive(Debug, Clone)]
pub struct RawContribution {
    pub kind: ContributionType,
    /// Browsable repository link (e.g. `https://github.com/org/repo`).
    pub repository: String,
    pub payload: serde_json::Value,
}

/// One normalized unit of developer activity.
///
/// Identity is `(repository, kind, external_id)`. Re-ingesting the same
/// identity updates content fields in place; `is_selected` is owned by the
/// user and survives re-ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct Contribution {
    pub kind: ContributionType,
    pub external_id: String,
    pub username: String,
    pub repository: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    /// Opaque structured metadata: diff stats, body text, labels, tag names.
    pub detail_json: String,
    pub is_selected: bool,
}

impl Contribution {
    /// ISO week label of the creation timestamp, e.g. `"2024-W21"`.
    pub fn week(&self) -> String {
        iso_week_label(self.created_at)
    }
}

/// Format a timestamp as an ISO week label (`"2024-W21"`).
pub fn iso_week_label(ts: DateTime<Utc>) -> String {
    let iso = ts.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

/// Check that a string looks like an ISO week label (`YYYY-Www`).
pub fn is_week_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 8
        && bytes[..4].iter().all(|b| b.is_ascii_digit())
        && bytes[4] == b'-'
        && bytes[5] == b'W'
        && bytes[6..].iter().all(|b| b.is_ascii_digit())
}

/// A ranked result returned by the retrieval service.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub kind: ContributionType,
    pub user: String,
    pub week: String,
    pub repository: String,
    pub created_at: i64,
    pub is_selected: bool,
    pub score: f64,
    pub snippet: String,
}

/// Stage of the sync cycle an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Fetching,
    Normalizing,
    Persisting,
    Indexing,
}

/// A structured error recorded in a sync report.
#[derive(Debug, Clone, Serialize)]
pub struct SyncError {
    pub repository: String,
    pub stage: SyncStage,
    pub message: String,
    /// Set when the source API signaled a rate limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Outcome of one repository's sync cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RepoSyncReport {
    pub repository: String,
    pub fetched: u64,
    pub upserted: u64,
    pub indexed: u64,
    pub index_failed: u64,
    pub checkpoint_advanced: bool,
    pub errors: Vec<SyncError>,
}

impl RepoSyncReport {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            fetched: 0,
            upserted: 0,
            indexed: 0,
            index_failed: 0,
            checkpoint_advanced: false,
            errors: Vec::new(),
        }
    }
}

/// Aggregate report for a full sync run across repositories.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: String,
    pub repositories_processed: u64,
    pub contributions_fetched: u64,
    pub contributions_upserted: u64,
    pub errors: Vec<SyncError>,
    pub processing_time_ms: u64,
}

impl SyncReport {
    /// Fold per-repository reports into the aggregate shape returned by
    /// `POST /sync`.
    pub fn from_repo_reports(reports: &[RepoSyncReport], elapsed_ms: u64) -> Self {
        let errors: Vec<SyncError> = reports.iter().flat_map(|r| r.errors.clone()).collect();
        let status = if errors.is_empty() {
            "ok".to_string()
        } else {
            "partial_failure".to_string()
        };
        Self {
            status,
            repositories_processed: reports.len() as u64,
            contributions_fetched: reports.iter().map(|r| r.fetched).sum(),
            contributions_upserted: reports.iter().map(|r| r.upserted).sum(),
            errors,
            processing_time_ms: elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_kind_roundtrip() {
        for kind in ContributionType::ALL {
            assert_eq!(ContributionType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ContributionType::parse("gist"), None);
    }

    #[test]
    fn test_iso_week_label() {
        // 2024-05-22 is a Wednesday in ISO week 21.
        let ts = Utc.with_ymd_and_hms(2024, 5, 22, 12, 0, 0).unwrap();
        assert_eq!(iso_week_label(ts), "2024-W21");

        // Jan 1st 2023 belongs to ISO week 52 of 2022.
        let ts = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(iso_week_label(ts), "2022-W52");
    }

    #[test]
    fn test_week_label_validation() {
        assert!(is_week_label("2024-W21"));
        assert!(is_week_label("2024-W05"));
        assert!(!is_week_label("2024-21"));
        assert!(!is_week_label("2024-W5"));
        assert!(!is_week_label("24-W05"));
        assert!(!is_week_label(""));
    }

    #[test]
    fn test_aggregate_report_status() {
        let mut a = RepoSyncReport::new("https://github.com/acme/api");
        a.fetched = 3;
        a.upserted = 3;
        let mut b = RepoSyncReport::new("https://github.com/acme/web");
        b.errors.push(SyncError {
            repository: b.repository.clone(),
            stage: SyncStage::Fetching,
            message: "rate limited".to_string(),
            retry_after_secs: Some(30),
        });

        let report = SyncReport::from_repo_reports(&[a, b], 12);
        assert_eq!(report.status, "partial_failure");
        assert_eq!(report.repositories_processed, 2);
        assert_eq!(report.contributions_fetched, 3);
        assert_eq!(report.errors.len(), 1);
    }
}
