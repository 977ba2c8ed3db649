//! Bounded per-(subject, week) conversation threads.
//!
//! Dialogue state lives behind the [`ConversationStore`] trait so the
//! in-process [`MemoryConversationStore`] can be swapped for a shared or
//! persistent backing store without touching callers. Appends to one thread
//! are serialized by a per-thread mutex; reads return snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One question/answer exchange in a thread.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
    pub confidence: f64,
    pub asked_at: DateTime<Utc>,
}

/// Dialogue state for one `(subject, week)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationThread {
    pub conversation_id: String,
    pub subject: String,
    pub week: String,
    pub turns: Vec<ConversationTurn>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ConversationError {
    /// The supplied conversation id exists but belongs to a different
    /// subject/week. Rejected before any state mutation so one subject's
    /// thread can never leak into another's.
    #[error("conversation {conversation_id} does not belong to {subject}/{week}")]
    Mismatch {
        conversation_id: String,
        subject: String,
        week: String,
    },
    #[error("unknown conversation: {0}")]
    Unknown(String),
}

/// Storage seam for conversation threads, keyed by `(subject, week)`.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch the active thread for a subject/week, creating it lazily.
    ///
    /// With an explicit `conversation_id`, the id must already belong to
    /// that subject/week; anything else is a validation error, not a silent
    /// new thread.
    async fn get_or_create(
        &self,
        subject: &str,
        week: &str,
        conversation_id: Option<&str>,
    ) -> Result<ConversationThread, ConversationError>;

    /// Append a completed turn. Appends to the same thread are serialized.
    async fn append_turn(
        &self,
        conversation_id: &str,
        question: &str,
        answer: &str,
        confidence: f64,
    ) -> Result<(), ConversationError>;

    /// The most recent `max_n` turns, oldest first.
    async fn recent_turns(
        &self,
        conversation_id: &str,
        max_n: usize,
    ) -> Result<Vec<ConversationTurn>, ConversationError>;

    /// Snapshot of the thread for a subject/week, if one exists.
    async fn history(
        &self,
        subject: &str,
        week: &str,
    ) -> Result<Option<ConversationThread>, ConversationError>;

    /// Drop the thread for a subject/week. Clearing a missing thread is a
    /// no-op.
    async fn clear(&self, subject: &str, week: &str) -> Result<(), ConversationError>;
}

type ThreadKey = (String, String);

/// In-process conversation store.
///
/// The outer map lock is held only to resolve or insert the thread handle;
/// the per-thread mutex serializes mutation of one thread's turns.
#[derive(Default)]
pub struct MemoryConversationStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    threads: HashMap<ThreadKey, Arc<Mutex<ConversationThread>>>,
    by_id: HashMap<String, ThreadKey>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolve(
        &self,
        conversation_id: &str,
    ) -> Result<Arc<Mutex<ConversationThread>>, ConversationError> {
        let inner = self.inner.lock().await;
        let key = inner
            .by_id
            .get(conversation_id)
            .ok_or_else(|| ConversationError::Unknown(conversation_id.to_string()))?;
        Ok(inner.threads[key].clone())
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get_or_create(
        &self,
        subject: &str,
        week: &str,
        conversation_id: Option<&str>,
    ) -> Result<ConversationThread, ConversationError> {
        let key = (subject.to_string(), week.to_string());

        let handle = {
            let mut inner = self.inner.lock().await;

            if let Some(id) = conversation_id {
                let owner = inner
                    .by_id
                    .get(id)
                    .ok_or_else(|| ConversationError::Unknown(id.to_string()))?;
                if owner != &key {
                    return Err(ConversationError::Mismatch {
                        conversation_id: id.to_string(),
                        subject: subject.to_string(),
                        week: week.to_string(),
                    });
                }
                inner.threads[owner].clone()
            } else if let Some(existing) = inner.threads.get(&key) {
                existing.clone()
            } else {
                let thread = ConversationThread {
                    conversation_id: Uuid::new_v4().to_string(),
                    subject: subject.to_string(),
                    week: week.to_string(),
                    turns: Vec::new(),
                    last_activity_at: Utc::now(),
                };
                let handle = Arc::new(Mutex::new(thread.clone()));
                inner.by_id.insert(thread.conversation_id.clone(), key.clone());
                inner.threads.insert(key, handle.clone());
                handle
            }
        };

        let thread = handle.lock().await;
        Ok(thread.clone())
    }

    async fn append_turn(
        &self,
        conversation_id: &str,
        question: &str,
        answer: &str,
        confidence: f64,
    ) -> Result<(), ConversationError> {
        let handle = self.resolve(conversation_id).await?;
        let mut thread = handle.lock().await;
        let now = Utc::now();
        thread.turns.push(ConversationTurn {
            question: question.to_string(),
            answer: answer.to_string(),
            confidence,
            asked_at: now,
        });
        thread.last_activity_at = now;
        Ok(())
    }

    async fn recent_turns(
        &self,
        conversation_id: &str,
        max_n: usize,
    ) -> Result<Vec<ConversationTurn>, ConversationError> {
        let handle = self.resolve(conversation_id).await?;
        let thread = handle.lock().await;
        let skip = thread.turns.len().saturating_sub(max_n);
        Ok(thread.turns[skip..].to_vec())
    }

    async fn history(
        &self,
        subject: &str,
        week: &str,
    ) -> Result<Option<ConversationThread>, ConversationError> {
        let key = (subject.to_string(), week.to_string());
        let handle = {
            let inner = self.inner.lock().await;
            inner.threads.get(&key).cloned()
        };
        match handle {
            Some(handle) => {
                let thread = handle.lock().await;
                Ok(Some(thread.clone()))
            }
            None => Ok(None),
        }
    }

    async fn clear(&self, subject: &str, week: &str) -> Result<(), ConversationError> {
        let key = (subject.to_string(), week.to_string());
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.threads.remove(&key) {
            let id = handle.lock().await.conversation_id.clone();
            inner.by_id.remove(&id);
        }
        Ok(())
    }
}
