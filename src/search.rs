//! Hybrid retrieval over the search document store.
//!
//! Candidates are collected from two channels: FTS5 keyword matching and
//! cosine similarity over stored vectors. Scores are min-max normalized per
//! channel and blended with the configured `retrieval.hybrid_alpha`. When
//! query embedding fails (or embeddings are disabled), search degrades to
//! lexical-only ranking and logs instead of failing the request.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::Config;
use crate::embedding;
use crate::models::{ContributionType, SearchHit};

/// Ordering applied to matched documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Hybrid relevance score, best first.
    #[default]
    Relevance,
    /// Creation time, newest first.
    Newest,
    /// Creation time, oldest first.
    Oldest,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relevance" => Some(SortOrder::Relevance),
            "newest" => Some(SortOrder::Newest),
            "oldest" => Some(SortOrder::Oldest),
            _ => None,
        }
    }
}

/// Structured filter predicates applied to candidates.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub user: Option<String>,
    pub week: Option<String>,
    pub kind: Option<ContributionType>,
    pub repository: Option<String>,
    pub is_selected: Option<bool>,
    /// Inclusive epoch-seconds lower bound on `created_at`.
    pub since: Option<i64>,
    /// Inclusive epoch-seconds upper bound on `created_at`.
    pub until: Option<i64>,
}

impl SearchFilters {
    fn matches(&self, row: &DocRow) -> bool {
        if let Some(ref user) = self.user {
            if &row.user != user {
                return false;
            }
        }
        if let Some(ref week) = self.week {
            if &row.week != week {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if row.kind != kind {
                return false;
            }
        }
        if let Some(ref repository) = self.repository {
            if &row.repository != repository {
                return false;
            }
        }
        if let Some(selected) = self.is_selected {
            if row.is_selected != selected {
                return false;
            }
        }
        if let Some(since) = self.since {
            if row.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if row.created_at > until {
                return false;
            }
        }
        true
    }
}

/// Search the document store and return ranked hits.
pub async fn search_documents(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    filters: &SearchFilters,
    sort: SortOrder,
    limit: Option<i64>,
    offset: i64,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let final_limit = limit.unwrap_or(config.retrieval.final_limit);
    let alpha = config.retrieval.hybrid_alpha;

    let keyword_candidates =
        fetch_keyword_candidates(pool, query, config.retrieval.candidate_k_keyword).await?;

    // Vector channel is best-effort: a failed query embedding degrades to
    // lexical-only ranking.
    let vector_candidates = if config.embedding.is_enabled() {
        match embedding::embed_query(&config.embedding, query).await {
            Ok(query_vec) => {
                fetch_vector_candidates(pool, &query_vec, config.retrieval.candidate_k_vector)
                    .await?
            }
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, lexical-only ranking");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    if keyword_candidates.is_empty() && vector_candidates.is_empty() {
        return Ok(Vec::new());
    }

    // A query with no vector channel is pure keyword ranking regardless of alpha.
    let effective_alpha = if vector_candidates.is_empty() {
        0.0
    } else {
        alpha
    };

    let scored = blend_scores(&keyword_candidates, &vector_candidates, effective_alpha);

    // Enrich with document rows, apply filters, rank deterministically.
    let mut hits = Vec::new();
    for (doc_id, score, snippet) in scored {
        let Some(row) = fetch_doc_row(pool, &doc_id).await? else {
            continue;
        };
        if !filters.matches(&row) {
            continue;
        }
        hits.push(SearchHit {
            id: row.id,
            title: row.title,
            kind: row.kind,
            user: row.user,
            week: row.week,
            repository: row.repository,
            created_at: row.created_at,
            is_selected: row.is_selected,
            score,
            snippet,
        });
    }

    // Tie-break on created_at then id so the ordering is deterministic.
    hits.sort_by(|a, b| match sort {
        SortOrder::Relevance => b
            .score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
            .then(a.id.cmp(&b.id)),
        SortOrder::Newest => b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)),
        SortOrder::Oldest => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
    });

    let start = offset.max(0) as usize;
    let hits = hits
        .into_iter()
        .skip(start)
        .take(final_limit.max(0) as usize)
        .collect();

    Ok(hits)
}

/// Print ranked results for the CLI `gw search` command.
pub async fn run_search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    filters: &SearchFilters,
    sort: SortOrder,
    limit: Option<i64>,
    offset: i64,
) -> Result<()> {
    let hits = search_documents(pool, config, query, filters, sort, limit, offset).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(hit.created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        println!(
            "{}. [{:.2}] {} / {}",
            i + 1 + offset.max(0) as usize,
            hit.score,
            hit.kind,
            hit.title
        );
        println!("    user: {}  week: {}  created: {}", hit.user, hit.week, date);
        println!("    repository: {}", hit.repository);
        println!(
            "    excerpt: \"{}\"",
            hit.snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", hit.id);
        println!();
    }

    Ok(())
}

// ============ Candidate types ============

#[derive(Debug, Clone)]
struct DocCandidate {
    doc_id: String,
    raw_score: f64,
    snippet: String,
}

struct DocRow {
    id: String,
    title: String,
    kind: ContributionType,
    user: String,
    week: String,
    repository: String,
    created_at: i64,
    is_selected: bool,
}

// ============ Keyword search ============

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<DocCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT doc_id, rank,
               snippet(documents_fts, 2, '>>>', '<<<', '...', 48) AS snippet
        FROM documents_fts
        WHERE documents_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(fts_query(query))
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    let candidates: Vec<DocCandidate> = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            DocCandidate {
                doc_id: row.get("doc_id"),
                raw_score: -rank, // negate so higher = better
                snippet: row.get("snippet"),
            }
        })
        .collect();

    Ok(candidates)
}

/// Quote each term so user input (hyphens, colons, question marks) never
/// reaches FTS5 as query syntax, and OR them so a natural-language question
/// matches any of its terms. BM25 still ranks multi-term matches higher.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============ Vector search ============

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    query_vec: &[f32],
    candidate_k: i64,
) -> Result<Vec<DocCandidate>> {
    // Fetch all vectors and compute cosine similarity in Rust
    let rows = sqlx::query(
        r#"
        SELECT dv.doc_id, dv.embedding,
               COALESCE(substr(sd.body, 1, 240), '') AS snippet
        FROM document_vectors dv
        JOIN search_documents sd ON sd.id = dv.doc_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<DocCandidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            let similarity = embedding::cosine_similarity(query_vec, &vec) as f64;
            DocCandidate {
                doc_id: row.get("doc_id"),
                raw_score: similarity,
                snippet: row.get("snippet"),
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(candidate_k as usize);

    Ok(candidates)
}

async fn fetch_doc_row(pool: &SqlitePool, doc_id: &str) -> Result<Option<DocRow>> {
    let row = sqlx::query(
        r#"
        SELECT id, title, kind, user, week, repository, created_at, is_selected
        FROM search_documents WHERE id = ?
        "#,
    )
    .bind(doc_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let kind: String = row.get("kind");
        DocRow {
            id: row.get("id"),
            title: row.get("title"),
            kind: ContributionType::parse(&kind).unwrap_or(ContributionType::Commit),
            user: row.get("user"),
            week: row.get("week"),
            repository: row.get("repository"),
            created_at: row.get("created_at"),
            is_selected: row.get("is_selected"),
        }
    }))
}

// ============ Score blending ============

/// Merge the two candidate channels into `(doc_id, hybrid_score, snippet)`
/// triples. Scores are min-max normalized per channel before blending.
fn blend_scores(
    keyword: &[DocCandidate],
    vector: &[DocCandidate],
    alpha: f64,
) -> Vec<(String, f64, String)> {
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .iter()
        .map(|(c, s)| (c.doc_id.as_str(), *s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .iter()
        .map(|(c, s)| (c.doc_id.as_str(), *s))
        .collect();

    let mut merged: HashMap<&str, &DocCandidate> = HashMap::new();
    for c in keyword {
        merged.entry(c.doc_id.as_str()).or_insert(c);
    }
    for c in vector {
        merged.entry(c.doc_id.as_str()).or_insert(c);
    }

    merged
        .into_iter()
        .map(|(doc_id, cand)| {
            let k = kw_map.get(doc_id).copied().unwrap_or(0.0);
            let v = vec_map.get(doc_id).copied().unwrap_or(0.0);
            let hybrid = (1.0 - alpha) * k + alpha * v;
            (doc_id.to_string(), hybrid, cand.snippet.clone())
        })
        .collect()
}

/// Min-max normalize raw channel scores to [0, 1].
fn normalize_scores(candidates: &[DocCandidate]) -> Vec<(&DocCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(doc_id: &str, score: f64) -> DocCandidate {
        DocCandidate {
            doc_id: doc_id.to_string(),
            raw_score: score,
            snippet: String::new(),
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single_is_one() {
        let candidates = vec![make_candidate("d1", 5.0)];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("d1", 10.0),
            make_candidate("d2", 5.0),
            make_candidate("d3", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_stays_in_unit_interval() {
        let candidates = vec![
            make_candidate("d1", -5.0),
            make_candidate("d2", 100.0),
            make_candidate("d3", 42.0),
        ];
        for (_, score) in normalize_scores(&candidates) {
            assert!((0.0..=1.0).contains(&score), "out of range: {}", score);
        }
    }

    #[test]
    fn test_blend_alpha_zero_is_keyword_order() {
        let kw = vec![
            make_candidate("d1", 10.0),
            make_candidate("d2", 5.0),
            make_candidate("d3", 1.0),
        ];
        let vec_cands = vec![make_candidate("d1", 0.1), make_candidate("d2", 0.9)];

        let mut scored = blend_scores(&kw, &vec_cands, 0.0);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let order: Vec<&str> = scored.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(order, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_blend_alpha_one_is_vector_order() {
        let kw = vec![make_candidate("d1", 10.0), make_candidate("d2", 5.0)];
        let vec_cands = vec![
            make_candidate("d1", 0.1),
            make_candidate("d2", 0.9),
            make_candidate("d3", 0.5),
        ];

        let mut scored = blend_scores(&kw, &vec_cands, 1.0);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let order: Vec<&str> = scored.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(order, vec!["d2", "d3", "d1"]);
    }

    #[test]
    fn test_blend_merges_channel_only_candidates() {
        let kw = vec![make_candidate("d1", 2.0)];
        let vec_cands = vec![make_candidate("d2", 0.8)];
        let scored = blend_scores(&kw, &vec_cands, 0.5);
        assert_eq!(scored.len(), 2);
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!(SortOrder::parse("relevance"), Some(SortOrder::Relevance));
        assert_eq!(SortOrder::parse("newest"), Some(SortOrder::Newest));
        assert_eq!(SortOrder::parse("oldest"), Some(SortOrder::Oldest));
        assert_eq!(SortOrder::parse("score"), None);
    }

    #[test]
    fn test_fts_query_quotes_and_ors_terms() {
        assert_eq!(fts_query("retry loop"), "\"retry\" OR \"loop\"");
        assert_eq!(fts_query("fix-sync"), "\"fix-sync\"");
        assert_eq!(fts_query("say \"hi\""), "\"say\" OR \"\"\"hi\"\"\"");
    }

    #[test]
    fn test_filters_match() {
        let row = DocRow {
            id: "d1".to_string(),
            title: "t".to_string(),
            kind: ContributionType::Commit,
            user: "alice".to_string(),
            week: "2024-W21".to_string(),
            repository: "https://github.com/acme/api".to_string(),
            created_at: 1_716_300_000,
            is_selected: true,
        };

        assert!(SearchFilters::default().matches(&row));
        assert!(SearchFilters {
            user: Some("alice".to_string()),
            week: Some("2024-W21".to_string()),
            kind: Some(ContributionType::Commit),
            ..Default::default()
        }
        .matches(&row));
        assert!(!SearchFilters {
            user: Some("bob".to_string()),
            ..Default::default()
        }
        .matches(&row));
        assert!(!SearchFilters {
            is_selected: Some(false),
            ..Default::default()
        }
        .matches(&row));
        assert!(!SearchFilters {
            since: Some(1_716_400_000),
            ..Default::default()
        }
        .matches(&row));
        assert!(!SearchFilters {
            until: Some(1_716_200_000),
            ..Default::default()
        }
        .matches(&row));
    }
}
