//! In-memory conversational state shared by all tools.
//!
//! Sessions live only for the process lifetime. The map supports concurrent
//! lookup; mutations of a single session serialize on its shard entry, so
//! appends never interleave mid-record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("creating a session requires a repository path")]
    MissingRepoPath,
    #[error("session '{0}' has no suggestion to attach feedback to")]
    NoSuggestion(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    /// Compact result summaries (one line per hit).
    pub results: Vec<String>,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub timestamp: DateTime<Utc>,
    pub score: f32,
    pub comments: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRecord {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStepRecord {
    pub tool: String,
    pub input: String,
    pub output: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub repo_path: String,
    pub last_files: Vec<String>,
    pub last_diff: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context: SessionContext,
    pub queries: Vec<QueryRecord>,
    pub suggestions: Vec<SuggestionRecord>,
    pub agent_steps: Vec<AgentStepRecord>,
}

impl Session {
    fn new(id: String, repo_path: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_updated: now,
            context: SessionContext {
                repo_path,
                ..Default::default()
            },
            queries: Vec::new(),
            suggestions: Vec::new(),
            agent_steps: Vec::new(),
        }
    }
}

/// Collision odds are negligible: millisecond timestamp plus a random
/// 24-bit suffix.
pub fn generate_session_id() -> String {
    format!(
        "session_{}_{:06x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>() & 0xff_ffff
    )
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `id`, creating the session on first reference. Creation
    /// requires a repository path for the session context.
    pub fn get_or_create(
        &self,
        id: Option<&str>,
        repo_path: Option<&str>,
    ) -> Result<Session, SessionError> {
        let id = match id {
            Some(existing) if self.sessions.contains_key(existing) => existing.to_string(),
            Some(fresh) => {
                let repo = repo_path.ok_or(SessionError::MissingRepoPath)?;
                self.sessions
                    .insert(fresh.to_string(), Session::new(fresh.to_string(), repo.to_string()));
                fresh.to_string()
            }
            None => {
                let repo = repo_path.ok_or(SessionError::MissingRepoPath)?;
                let fresh = generate_session_id();
                self.sessions
                    .insert(fresh.clone(), Session::new(fresh.clone(), repo.to_string()));
                fresh
            }
        };

        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        entry.last_updated = Utc::now();
        Ok(entry.value().clone())
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError>,
    {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        f(&mut entry)?;
        entry.last_updated = Utc::now();
        Ok(())
    }

    pub fn add_query(
        &self,
        id: &str,
        query: &str,
        results: Vec<String>,
        relevance_score: f32,
    ) -> Result<(), SessionError> {
        self.mutate(id, |s| {
            s.queries.push(QueryRecord {
                timestamp: Utc::now(),
                query: query.to_string(),
                results,
                relevance_score,
            });
            Ok(())
        })
    }

    pub fn add_suggestion(&self, id: &str, prompt: &str, suggestion: &str) -> Result<(), SessionError> {
        self.mutate(id, |s| {
            s.suggestions.push(SuggestionRecord {
                timestamp: Utc::now(),
                prompt: prompt.to_string(),
                suggestion: suggestion.to_string(),
                feedback: None,
            });
            Ok(())
        })
    }

    /// Attach feedback to the most recent suggestion; errors if none exists.
    pub fn add_feedback(&self, id: &str, score: f32, comments: &str) -> Result<(), SessionError> {
        self.mutate(id, |s| {
            let last = s
                .suggestions
                .last_mut()
                .ok_or_else(|| SessionError::NoSuggestion(id.to_string()))?;
            last.feedback = Some(FeedbackRecord {
                timestamp: Utc::now(),
                score,
                comments: comments.to_string(),
            });
            Ok(())
        })
    }

    pub fn add_agent_step(&self, id: &str, step: AgentStepRecord) -> Result<(), SessionError> {
        self.mutate(id, |s| {
            s.agent_steps.push(step);
            Ok(())
        })
    }

    pub fn update_context(
        &self,
        id: &str,
        last_files: Vec<String>,
        last_diff: Option<String>,
    ) -> Result<(), SessionError> {
        self.mutate(id, |s| {
            s.context.last_files = last_files;
            if let Some(diff) = last_diff {
                s.context.last_diff = diff;
            }
            Ok(())
        })
    }

    /// The `n` most recent queries, newest first.
    pub fn recent_queries(&self, id: &str, n: usize) -> Result<Vec<QueryRecord>, SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(entry.queries.iter().rev().take(n).cloned().collect())
    }

    /// Result lines from the highest-relevance queries, flattened, capped at `n`.
    pub fn relevant_results(&self, id: &str, n: usize) -> Result<Vec<String>, SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut queries: Vec<&QueryRecord> = entry.queries.iter().collect();
        queries.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(queries
            .iter()
            .flat_map(|q| q.results.iter().cloned())
            .take(n)
            .collect())
    }

    pub fn average_relevance(&self, id: &str) -> Result<f32, SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if entry.queries.is_empty() {
            return Ok(0.0);
        }
        let sum: f32 = entry.queries.iter().map(|q| q.relevance_score).sum();
        Ok(sum / entry.queries.len() as f32)
    }

    pub fn snapshot(&self, id: &str) -> Result<Session, SessionError> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_requires_repo_path() {
        let store = SessionStore::new();
        assert!(matches!(
            store.get_or_create(None, None),
            Err(SessionError::MissingRepoPath)
        ));

        let created = store.get_or_create(None, Some("/repo")).unwrap();
        assert!(created.id.starts_with("session_"));
        assert_eq!(created.context.repo_path, "/repo");

        // Second reference by id needs no repo path.
        let again = store.get_or_create(Some(&created.id), None).unwrap();
        assert_eq!(again.id, created.id);
    }

    #[test]
    fn feedback_without_suggestion_errors() {
        let store = SessionStore::new();
        let s = store.get_or_create(None, Some("/repo")).unwrap();
        assert!(matches!(
            store.add_feedback(&s.id, 7.0, "nice"),
            Err(SessionError::NoSuggestion(_))
        ));

        store.add_suggestion(&s.id, "prompt", "try this").unwrap();
        store.add_feedback(&s.id, 7.0, "nice").unwrap();
        let snap = store.snapshot(&s.id).unwrap();
        assert_eq!(snap.suggestions[0].feedback.as_ref().unwrap().score, 7.0);
    }

    #[test]
    fn relevant_results_order_by_relevance() {
        let store = SessionStore::new();
        let s = store.get_or_create(None, Some("/repo")).unwrap();
        store
            .add_query(&s.id, "weak", vec!["w1".into(), "w2".into()], 0.2)
            .unwrap();
        store
            .add_query(&s.id, "strong", vec!["s1".into(), "s2".into()], 0.9)
            .unwrap();

        let results = store.relevant_results(&s.id, 3).unwrap();
        assert_eq!(results, vec!["s1", "s2", "w1"]);

        let avg = store.average_relevance(&s.id).unwrap();
        assert!((avg - 0.55).abs() < 1e-6);
    }

    #[test]
    fn recent_queries_are_newest_first() {
        let store = SessionStore::new();
        let s = store.get_or_create(None, Some("/repo")).unwrap();
        for q in ["one", "two", "three"] {
            store.add_query(&s.id, q, vec![], 0.5).unwrap();
        }
        let recent = store.recent_queries(&s.id, 2).unwrap();
        assert_eq!(recent[0].query, "three");
        assert_eq!(recent[1].query, "two");
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }
}
