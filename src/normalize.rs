//! Normalization of raw source items into canonical contributions.
//!
//! `normalize` is a pure function: identical raw input produces an identical
//! [`Contribution`], including the identity key. Missing optional fields
//! degrade to empty values; only an underivable identity key is an error.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::models::{Contribution, ContributionType, RawContribution};

pub fn normalize(raw: &RawContribution) -> Result<Contribution> {
    match raw.kind {
        ContributionType::Commit => normalize_commit(raw),
        ContributionType::PullRequest => normalize_pull_request(raw),
        ContributionType::Issue => normalize_issue(raw),
        ContributionType::Release => normalize_release(raw),
    }
}

fn normalize_commit(raw: &RawContribution) -> Result<Contribution> {
    let p = &raw.payload;

    let Some(sha) = str_at(p, &["sha"]) else {
        bail!("commit without a sha in {}", raw.repository);
    };

    let username = str_at(p, &["author", "login"])
        .or_else(|| str_at(p, &["commit", "author", "name"]))
        .unwrap_or_default();

    let summary = str_at(p, &["commit", "message"]).unwrap_or_default();

    let created_at = str_at(p, &["commit", "author", "date"])
        .or_else(|| str_at(p, &["commit", "committer", "date"]))
        .and_then(parse_ts)
        .unwrap_or(DateTime::UNIX_EPOCH);

    let detail = json!({
        "html_url": p.get("html_url"),
        "stats": p.get("stats"),
        "files": commit_files(p),
    });

    Ok(Contribution {
        kind: ContributionType::Commit,
        external_id: sha,
        username,
        repository: raw.repository.clone(),
        summary,
        created_at,
        detail_json: detail.to_string(),
        is_selected: true,
    })
}

fn normalize_pull_request(raw: &RawContribution) -> Result<Contribution> {
    let p = &raw.payload;

    let Some(number) = p.get("number").and_then(Value::as_i64) else {
        bail!("pull request without a number in {}", raw.repository);
    };

    let detail = json!({
        "body": p.get("body"),
        "state": p.get("state"),
        "merged_at": p.get("merged_at"),
        "labels": label_names(p),
        "additions": p.get("additions"),
        "deletions": p.get("deletions"),
        "changed_files": p.get("changed_files"),
        "html_url": p.get("html_url"),
    });

    Ok(Contribution {
        kind: ContributionType::PullRequest,
        external_id: number.to_string(),
        username: str_at(p, &["user", "login"]).unwrap_or_default(),
        repository: raw.repository.clone(),
        summary: str_at(p, &["title"]).unwrap_or_default(),
        created_at: str_at(p, &["created_at"])
            .and_then(parse_ts)
            .unwrap_or(DateTime::UNIX_EPOCH),
        detail_json: detail.to_string(),
        is_selected: true,
    })
}

fn normalize_issue(raw: &RawContribution) -> Result<Contribution> {
    let p = &raw.payload;

    let Some(number) = p.get("number").and_then(Value::as_i64) else {
        bail!("issue without a number in {}", raw.repository);
    };

    let detail = json!({
        "body": p.get("body"),
        "state": p.get("state"),
        "labels": label_names(p),
        "comments": p.get("comments"),
        "html_url": p.get("html_url"),
    });

    Ok(Contribution {
        kind: ContributionType::Issue,
        external_id: number.to_string(),
        username: str_at(p, &["user", "login"]).unwrap_or_default(),
        repository: raw.repository.clone(),
        summary: str_at(p, &["title"]).unwrap_or_default(),
        created_at: str_at(p, &["created_at"])
            .and_then(parse_ts)
            .unwrap_or(DateTime::UNIX_EPOCH),
        detail_json: detail.to_string(),
        is_selected: true,
    })
}

fn normalize_release(raw: &RawContribution) -> Result<Contribution> {
    let p = &raw.payload;

    // Numeric id preferred; the tag name is an acceptable fallback identity.
    let external_id = p
        .get("id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .or_else(|| str_at(p, &["tag_name"]));
    let Some(external_id) = external_id else {
        bail!("release without an id or tag in {}", raw.repository);
    };

    let summary = str_at(p, &["name"])
        .filter(|s| !s.is_empty())
        .or_else(|| str_at(p, &["tag_name"]))
        .unwrap_or_default();

    let detail = json!({
        "tag_name": p.get("tag_name"),
        "body": p.get("body"),
        "prerelease": p.get("prerelease"),
        "draft": p.get("draft"),
        "html_url": p.get("html_url"),
    });

    Ok(Contribution {
        kind: ContributionType::Release,
        external_id,
        username: str_at(p, &["author", "login"]).unwrap_or_default(),
        repository: raw.repository.clone(),
        summary,
        created_at: str_at(p, &["published_at"])
            .or_else(|| str_at(p, &["created_at"]))
            .and_then(parse_ts)
            .unwrap_or(DateTime::UNIX_EPOCH),
        detail_json: detail.to_string(),
        is_selected: true,
    })
}

/// Walk a path of object keys and return the string at the end.
fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().map(str::to_string)
}

fn parse_ts(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn label_names(p: &Value) -> Value {
    let names: Vec<String> = p
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| str_at(l, &["name"]))
                .collect()
        })
        .unwrap_or_default();
    json!(names)
}

/// Keep filename and patch for each changed file, when the payload has them.
fn commit_files(p: &Value) -> Value {
    let files: Vec<Value> = p
        .get("files")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .map(|f| {
                    json!({
                        "filename": f.get("filename"),
                        "patch": f.get("patch"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(kind: ContributionType, payload: Value) -> RawContribution {
        RawContribution {
            kind,
            repository: "https://github.com/acme/api".to_string(),
            payload,
        }
    }

    #[test]
    fn test_normalize_commit() {
        let item = raw(
            ContributionType::Commit,
            serde_json::json!({
                "sha": "abc123",
                "author": { "login": "alice" },
                "commit": {
                    "message": "Fix pagination off-by-one",
                    "author": { "name": "Alice", "date": "2024-05-22T09:30:00Z" }
                }
            }),
        );

        let c = normalize(&item).unwrap();
        assert_eq!(c.kind, ContributionType::Commit);
        assert_eq!(c.external_id, "abc123");
        assert_eq!(c.username, "alice");
        assert_eq!(c.summary, "Fix pagination off-by-one");
        assert_eq!(
            c.created_at,
            Utc.with_ymd_and_hms(2024, 5, 22, 9, 30, 0).unwrap()
        );
        assert!(c.is_selected);
        assert_eq!(c.week(), "2024-W21");
    }

    #[test]
    fn test_commit_author_fallback_to_git_name() {
        let item = raw(
            ContributionType::Commit,
            serde_json::json!({
                "sha": "def456",
                "author": null,
                "commit": {
                    "message": "wip",
                    "author": { "name": "Bob Smith", "date": "2024-05-22T10:00:00Z" }
                }
            }),
        );
        let c = normalize(&item).unwrap();
        assert_eq!(c.username, "Bob Smith");
    }

    #[test]
    fn test_commit_missing_author_is_empty_not_error() {
        let item = raw(
            ContributionType::Commit,
            serde_json::json!({ "sha": "aaa111", "commit": { "message": "m" } }),
        );
        let c = normalize(&item).unwrap();
        assert_eq!(c.username, "");
        assert_eq!(c.created_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_commit_without_sha_fails() {
        let item = raw(
            ContributionType::Commit,
            serde_json::json!({ "commit": { "message": "m" } }),
        );
        assert!(normalize(&item).is_err());
    }

    #[test]
    fn test_normalize_pull_request_with_labels() {
        let item = raw(
            ContributionType::PullRequest,
            serde_json::json!({
                "number": 42,
                "title": "Add retry to sync",
                "user": { "login": "alice" },
                "created_at": "2024-05-21T08:00:00Z",
                "state": "open",
                "body": "Adds bounded retry.",
                "labels": [{ "name": "urgent" }, { "name": "backend" }]
            }),
        );

        let c = normalize(&item).unwrap();
        assert_eq!(c.external_id, "42");
        assert_eq!(c.summary, "Add retry to sync");

        let detail: Value = serde_json::from_str(&c.detail_json).unwrap();
        assert_eq!(detail["labels"], serde_json::json!(["urgent", "backend"]));
        assert_eq!(detail["body"], "Adds bounded retry.");
    }

    #[test]
    fn test_pull_request_without_number_fails() {
        let item = raw(
            ContributionType::PullRequest,
            serde_json::json!({ "title": "orphan" }),
        );
        assert!(normalize(&item).is_err());
    }

    #[test]
    fn test_normalize_issue() {
        let item = raw(
            ContributionType::Issue,
            serde_json::json!({
                "number": 7,
                "title": "Crash on empty diff",
                "user": { "login": "bob" },
                "created_at": "2024-05-20T12:00:00Z",
                "state": "closed"
            }),
        );
        let c = normalize(&item).unwrap();
        assert_eq!(c.kind, ContributionType::Issue);
        assert_eq!(c.external_id, "7");
        assert_eq!(c.username, "bob");
    }

    #[test]
    fn test_normalize_release_tag_fallbacks() {
        let item = raw(
            ContributionType::Release,
            serde_json::json!({
                "tag_name": "v1.2.0",
                "name": "",
                "published_at": "2024-05-23T16:00:00Z",
                "body": "Bug fixes."
            }),
        );
        let c = normalize(&item).unwrap();
        assert_eq!(c.external_id, "v1.2.0");
        assert_eq!(c.summary, "v1.2.0");
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let item = raw(
            ContributionType::Issue,
            serde_json::json!({
                "number": 9,
                "title": "Flaky test",
                "created_at": "2024-05-20T12:00:00Z"
            }),
        );
        let a = normalize(&item).unwrap();
        let b = normalize(&item).unwrap();
        assert_eq!(a.external_id, b.external_id);
        assert_eq!(a.detail_json, b.detail_json);
        assert_eq!(a.created_at, b.created_at);
    }
}
