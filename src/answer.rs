//! Question answering over a subject's weekly activity.
//!
//! The orchestrator resolves the conversation thread, retrieves evidence
//! scoped to `(subject, week)`, assembles a bounded prompt from evidence and
//! recent turns, invokes the answer-generation provider, and appends the
//! turn. A provider failure produces a degraded well-formed response with
//! confidence 0 and leaves the thread untouched.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::{AnswerConfig, Config};
use crate::conversation::{ConversationStore, ConversationTurn};
use crate::models::{ContributionType, SearchHit};
use crate::search::{self, SearchFilters, SortOrder};

const SYSTEM_PROMPT: &str = "You are an assistant that answers questions about a developer's \
weekly activity. Use only the provided evidence. Reply with a JSON object: \
{\"answer\": string, \"confidence\": number between 0 and 1, \"evidence_ids\": [string]}.";

/// A cited piece of retrieved activity.
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub id: String,
    pub kind: ContributionType,
    pub title: String,
    pub repository: String,
    pub week: String,
    pub score: f64,
}

impl From<&SearchHit> for Evidence {
    fn from(hit: &SearchHit) -> Self {
        Self {
            id: hit.id.clone(),
            kind: hit.kind,
            title: hit.title.clone(),
            repository: hit.repository.clone(),
            week: hit.week.clone(),
            score: hit.score,
        }
    }
}

/// Response shape of the QA endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionResponse {
    pub answer: String,
    pub confidence: f64,
    pub evidence: Vec<Evidence>,
    pub conversation_id: String,
    pub reasoning_steps: Vec<String>,
}

/// The answer-generation model boundary. Providers are swappable behind the
/// same contract; tests use scripted implementations.
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Generate raw model output for a system prompt and a user prompt.
    async fn generate(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Chat-completions provider for OpenAI-compatible endpoints.
pub struct OpenAIAnswerProvider {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIAnswerProvider {
    pub fn new(config: &AnswerConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("answer.model required for OpenAI provider")?;
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint,
            model,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl AnswerProvider for OpenAIAnswerProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            bail!("answer API error {}: {}", status, message);
        }

        let json: Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("answer response missing message content")
    }
}

/// A provider used when answering is not configured. Always fails, which the
/// orchestrator turns into a degraded response.
pub struct DisabledAnswerProvider;

#[async_trait]
impl AnswerProvider for DisabledAnswerProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _system: &str, _prompt: &str) -> Result<String> {
        bail!("answer provider is disabled")
    }
}

pub fn create_provider(config: &AnswerConfig) -> Result<Box<dyn AnswerProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledAnswerProvider)),
        "openai" => Ok(Box::new(OpenAIAnswerProvider::new(config)?)),
        other => bail!("Unknown answer provider: {}", other),
    }
}

/// Answer a question about a subject's week.
///
/// Conversation mismatch errors propagate to the caller (validation);
/// provider failures do not — they produce a degraded response.
pub async fn answer_question(
    pool: &SqlitePool,
    config: &Config,
    store: &dyn ConversationStore,
    provider: &dyn AnswerProvider,
    subject: &str,
    week: &str,
    question: &str,
    conversation_id: Option<&str>,
) -> Result<QuestionResponse> {
    let mut reasoning_steps = Vec::new();

    let thread = store.get_or_create(subject, week, conversation_id).await?;
    reasoning_steps.push(format!("resolved conversation {}", thread.conversation_id));

    let filters = SearchFilters {
        user: Some(subject.to_string()),
        week: Some(week.to_string()),
        ..Default::default()
    };
    let hits = search::search_documents(
        pool,
        config,
        question,
        &filters,
        SortOrder::Relevance,
        Some(config.answer.top_k_evidence),
        0,
    )
    .await?;
    reasoning_steps.push(format!("retrieved {} evidence documents", hits.len()));

    let recent = store
        .recent_turns(&thread.conversation_id, config.answer.max_history)
        .await?;
    reasoning_steps.push(format!("included {} prior turns", recent.len()));

    let prompt = build_prompt(subject, week, question, &hits, &recent);

    let raw = match provider.generate(SYSTEM_PROMPT, &prompt).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(provider = provider.name(), error = %e, "answer generation failed");
            reasoning_steps.push("answer generation failed, returning degraded response".to_string());
            return Ok(QuestionResponse {
                answer: "Unable to answer right now: the answer-generation service \
                         did not produce a response."
                    .to_string(),
                confidence: 0.0,
                evidence: hits.iter().map(Evidence::from).collect(),
                conversation_id: thread.conversation_id,
                reasoning_steps,
            });
        }
    };

    let (answer, confidence) = parse_answer(&raw);
    reasoning_steps.push(format!("generated answer via {}", provider.name()));

    store
        .append_turn(&thread.conversation_id, question, &answer, confidence)
        .await?;

    Ok(QuestionResponse {
        answer,
        confidence,
        evidence: hits.iter().map(Evidence::from).collect(),
        conversation_id: thread.conversation_id,
        reasoning_steps,
    })
}

/// Assemble the bounded prompt: evidence block, then recent turns, then the
/// question.
fn build_prompt(
    subject: &str,
    week: &str,
    question: &str,
    hits: &[SearchHit],
    recent: &[ConversationTurn],
) -> String {
    let mut prompt = format!("Activity of {} in week {}:\n", subject, week);

    if hits.is_empty() {
        prompt.push_str("(no recorded activity matched the question)\n");
    }
    for hit in hits {
        prompt.push_str(&format!(
            "- [{}] ({}) {} — {}\n  {}\n",
            hit.id,
            hit.kind,
            hit.title,
            hit.repository,
            hit.snippet.replace('\n', " ")
        ));
    }

    if !recent.is_empty() {
        prompt.push_str("\nEarlier in this conversation:\n");
        for turn in recent {
            prompt.push_str(&format!("Q: {}\nA: {}\n", turn.question, turn.answer));
        }
    }

    prompt.push_str(&format!("\nQuestion: {}\n", question));
    prompt
}

/// Parse model output into `(answer, confidence)`.
///
/// JSON output is preferred; prose falls back to the whole text with a
/// default confidence. Confidence is clamped into [0, 1], never trusted
/// verbatim.
fn parse_answer(raw: &str) -> (String, f64) {
    let trimmed = raw.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    if let Ok(json) = serde_json::from_str::<Value>(candidate) {
        if let Some(answer) = json.get("answer").and_then(Value::as_str) {
            let confidence = json
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            return (answer.to_string(), confidence.clamp(0.0, 1.0));
        }
    }

    (trimmed.to_string(), 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::MemoryConversationStore;
    use std::sync::Mutex as StdMutex;

    struct ScriptedProvider {
        replies: StdMutex<Vec<Result<String>>>,
        prompts: StdMutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: StdMutex::new(replies),
                prompts: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnswerProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _system: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                bail!("no scripted reply left");
            }
            replies.remove(0)
        }
    }

    fn hit(id: &str, title: &str) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            title: title.to_string(),
            kind: ContributionType::Commit,
            user: "alice".to_string(),
            week: "2024-W21".to_string(),
            repository: "https://github.com/acme/api".to_string(),
            created_at: 1_716_300_000,
            is_selected: true,
            score: 0.9,
            snippet: "fixed the cursor".to_string(),
        }
    }

    #[test]
    fn test_parse_json_answer() {
        let (answer, confidence) =
            parse_answer(r#"{"answer": "Worked on pagination.", "confidence": 0.83}"#);
        assert_eq!(answer, "Worked on pagination.");
        assert!((confidence - 0.83).abs() < 1e-9);
    }

    #[test]
    fn test_parse_clamps_out_of_range_confidence() {
        let (_, confidence) = parse_answer(r#"{"answer": "a", "confidence": 7.5}"#);
        assert_eq!(confidence, 1.0);
        let (_, confidence) = parse_answer(r#"{"answer": "a", "confidence": -2.0}"#);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_parse_prose_fallback() {
        let (answer, confidence) = parse_answer("Mostly bug fixes this week.");
        assert_eq!(answer, "Mostly bug fixes this week.");
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "```json\n{\"answer\": \"Shipped v1.2.\", \"confidence\": 0.9}\n```";
        let (answer, confidence) = parse_answer(raw);
        assert_eq!(answer, "Shipped v1.2.");
        assert!((confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_prompt_contains_evidence_and_turns() {
        let hits = vec![hit("d1", "Fix pagination")];
        let turns = vec![ConversationTurn {
            question: "What did I work on?".to_string(),
            answer: "Pagination fixes.".to_string(),
            confidence: 0.8,
            asked_at: chrono::Utc::now(),
        }];

        let prompt = build_prompt("alice", "2024-W21", "Which were urgent?", &hits, &turns);
        assert!(prompt.contains("Fix pagination"));
        assert!(prompt.contains("What did I work on?"));
        assert!(prompt.contains("Question: Which were urgent?"));
    }

    #[test]
    fn test_prompt_notes_empty_evidence() {
        let prompt = build_prompt("alice", "2024-W21", "Anything?", &[], &[]);
        assert!(prompt.contains("no recorded activity"));
    }

    async fn test_setup() -> (sqlx::SqlitePool, Config) {
        // One connection: every in-memory SQLite connection is its own
        // database, so a larger pool would lose the migrated schema.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/unused.sqlite"

            [server]
            bind = "127.0.0.1:7400"
            "#,
        )
        .unwrap();
        (pool, config)
    }

    #[tokio::test]
    async fn test_degraded_response_does_not_mutate_thread() {
        let (pool, config) = test_setup().await;
        let store = MemoryConversationStore::new();
        let provider = ScriptedProvider::new(vec![Err(anyhow::anyhow!("model down"))]);

        let response = answer_question(
            &pool, &config, &store, &provider, "alice", "2024-W21", "What happened?", None,
        )
        .await
        .unwrap();

        assert_eq!(response.confidence, 0.0);
        assert!(response.answer.contains("Unable to answer"));

        let turns = store
            .recent_turns(&response.conversation_id, 10)
            .await
            .unwrap();
        assert!(turns.is_empty());
    }

    #[tokio::test]
    async fn test_follow_up_sees_prior_turn_and_same_conversation() {
        let (pool, config) = test_setup().await;
        let store = MemoryConversationStore::new();
        let provider = ScriptedProvider::new(vec![
            Ok(r#"{"answer": "You fixed pagination.", "confidence": 0.9}"#.to_string()),
            Ok(r#"{"answer": "The cursor fix was urgent.", "confidence": 0.8}"#.to_string()),
        ]);

        let first = answer_question(
            &pool, &config, &store, &provider, "alice", "2024-W21",
            "What did I work on?", None,
        )
        .await
        .unwrap();

        let second = answer_question(
            &pool, &config, &store, &provider, "alice", "2024-W21",
            "Which of those were urgent?", None,
        )
        .await
        .unwrap();

        assert_eq!(first.conversation_id, second.conversation_id);

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[1].contains("What did I work on?"));
        assert!(prompts[1].contains("You fixed pagination."));
    }

    #[tokio::test]
    async fn test_mismatched_conversation_id_is_an_error() {
        let (pool, config) = test_setup().await;
        let store = MemoryConversationStore::new();
        let provider = ScriptedProvider::new(vec![Ok(
            r#"{"answer": "ok", "confidence": 0.9}"#.to_string()
        )]);

        let first = answer_question(
            &pool, &config, &store, &provider, "alice", "2024-W21", "q", None,
        )
        .await
        .unwrap();

        let err = answer_question(
            &pool,
            &config,
            &store,
            &provider,
            "bob",
            "2024-W21",
            "q",
            Some(&first.conversation_id),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }
}
