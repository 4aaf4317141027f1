//! Qdrant-backed vector store.
//!
//! A thin REST client over the collection that holds every indexed point.
//! Three payload families live in one collection, discriminated by the
//! `dataType` tag:
//!
//!   file_chunk   — windowed file contents, id `file:<path>:chunk:<i>`
//!   commit_info  — one point per commit,  id `commit:<oid>`
//!   diff_chunk   — windowed per-file diffs, id `diff:<oid>:<path>:chunk:<i>`
//!
//! Logical ids are deterministic functions of the payload identifiers;
//! Qdrant wants UUID point ids, so the logical id is hashed through UUID v5.
//! Re-indexing the same source therefore upserts the same point, which is
//! what makes the pipeline idempotent.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::text::preprocess;

/// Attempts per upsert batch before the last error is surfaced.
const MAX_BATCH_ATTEMPTS: u32 = 3;

/// Base backoff between attempts; doubled per retry, plus jitter.
const BACKOFF_BASE_MS: u64 = 500;

/// Ceiling on the random jitter added to each backoff sleep.
const BACKOFF_JITTER_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("collection '{collection}' exists with vector size {actual_size} / distance {actual_distance}, but config requires size {expected_size} / Cosine")]
    ConfigMismatch {
        collection: String,
        expected_size: usize,
        actual_size: usize,
        actual_distance: String,
    },
    #[error("qdrant returned {status} for {operation}: {body}")]
    Http {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("qdrant unreachable during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("upsert batch {batch_index} failed after {attempts} attempts: {last_error}")]
    BatchFailed {
        batch_index: usize,
        attempts: u32,
        last_error: String,
    },
    #[error("unexpected qdrant response shape for {operation}")]
    Malformed { operation: &'static str },
}

/// How a file changed within a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Typechange,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Typechange => "typechange",
        }
    }
}

/// Tagged payload stored with every point. Unknown `dataType` values fail
/// deserialization and are skipped (with a warning) by the read paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dataType")]
pub enum PointPayload {
    #[serde(rename = "file_chunk")]
    FileChunk {
        filepath: String,
        file_content_chunk: String,
        /// RFC 3339 mtime of the file at index time.
        last_modified: String,
        chunk_index: usize,
        total_chunks: usize,
        #[serde(rename = "repositoryPath", skip_serializing_if = "Option::is_none")]
        repository_path: Option<String>,
    },
    #[serde(rename = "commit_info")]
    CommitInfo {
        commit_oid: String,
        commit_message: String,
        commit_author_name: String,
        commit_author_email: String,
        commit_date: String,
        changed_files_summary: Vec<String>,
        parent_oids: Vec<String>,
        #[serde(rename = "repositoryPath", skip_serializing_if = "Option::is_none")]
        repository_path: Option<String>,
    },
    #[serde(rename = "diff_chunk")]
    DiffChunk {
        commit_oid: String,
        filepath: String,
        diff_content_chunk: String,
        chunk_index: usize,
        total_chunks: usize,
        change_type: ChangeType,
        #[serde(rename = "repositoryPath", skip_serializing_if = "Option::is_none")]
        repository_path: Option<String>,
    },
}

impl PointPayload {
    /// Logical id — the pure function of payload identifiers that makes
    /// upserts idempotent.
    pub fn point_key(&self) -> String {
        match self {
            Self::FileChunk {
                filepath, chunk_index, ..
            } => format!("file:{}:chunk:{}", preprocess(filepath), chunk_index),
            Self::CommitInfo { commit_oid, .. } => format!("commit:{commit_oid}"),
            Self::DiffChunk {
                commit_oid,
                filepath,
                chunk_index,
                ..
            } => format!(
                "diff:{}:{}:chunk:{}",
                commit_oid,
                preprocess(filepath),
                chunk_index
            ),
        }
    }

    pub fn data_type(&self) -> &'static str {
        match self {
            Self::FileChunk { .. } => "file_chunk",
            Self::CommitInfo { .. } => "commit_info",
            Self::DiffChunk { .. } => "diff_chunk",
        }
    }

    pub fn filepath(&self) -> Option<&str> {
        match self {
            Self::FileChunk { filepath, .. } | Self::DiffChunk { filepath, .. } => Some(filepath),
            Self::CommitInfo { .. } => None,
        }
    }

    /// The text a human (or the refinement loop) would read for this point.
    pub fn content_text(&self) -> &str {
        match self {
            Self::FileChunk {
                file_content_chunk, ..
            } => file_content_chunk,
            Self::CommitInfo { commit_message, .. } => commit_message,
            Self::DiffChunk {
                diff_content_chunk, ..
            } => diff_content_chunk,
        }
    }
}

/// Map a logical id onto the UUID Qdrant stores.
pub fn point_id(point_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, point_key.as_bytes())
}

/// The unit shipped to the collection.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

impl VectorPoint {
    pub fn new(vector: Vec<f32>, payload: PointPayload) -> Self {
        Self {
            id: point_id(&payload.point_key()),
            vector,
            payload,
        }
    }

    fn to_qdrant_json(&self) -> Value {
        let mut payload = serde_json::to_value(&self.payload).unwrap_or_else(|_| json!({}));
        // Ride the logical id along for debuggability; readers ignore it.
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("point_key".to_string(), json!(self.payload.point_key()));
        }
        json!({
            "id": self.id.to_string(),
            "vector": self.vector,
            "payload": payload,
        })
    }
}

/// A search hit, score descending from the store.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Option<PointPayload>,
}

/// A point surfaced by `scroll`.
#[derive(Debug, Clone)]
pub struct ScrolledPoint {
    pub id: String,
    pub payload: Option<PointPayload>,
}

// ── Filter builders ──────────────────────────────────────────────────────

pub fn filter_data_type(data_type: &str) -> Value {
    json!({ "must": [ { "key": "dataType", "match": { "value": data_type } } ] })
}

/// Restrict results to a set of file paths.
pub fn filter_files(files: &[String]) -> Value {
    json!({ "must": [ { "key": "filepath", "match": { "any": files } } ] })
}

/// Neighboring file chunks of `filepath` at the given chunk indices.
pub fn filter_adjacent_chunks(filepath: &str, indices: &[usize]) -> Value {
    json!({
        "must": [
            { "key": "dataType", "match": { "value": "file_chunk" } },
            { "key": "filepath", "match": { "value": filepath } },
            { "key": "chunk_index", "match": { "any": indices } },
        ]
    })
}

// ── Client ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct CollectionParams {
    size: usize,
    distance: String,
}

pub struct VectorStore {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    dimension: usize,
}

impl VectorStore {
    pub fn new(qdrant_host: &str, collection: &str, dimension: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: qdrant_host.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dimension,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    /// Create the collection if absent; verify vector size and distance if
    /// it already exists. A mismatch is fatal — the caller must not index
    /// into a collection built for a different embedding space.
    pub async fn initialize(&self) -> Result<(), VectorStoreError> {
        let resp = self
            .http
            .get(self.url(""))
            .send()
            .await
            .map_err(|source| VectorStoreError::Transport {
                operation: "get collection",
                source,
            })?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return self.create_collection().await;
        }
        if !resp.status().is_success() {
            return Err(VectorStoreError::Http {
                operation: "get collection",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: Value = resp.json().await.map_err(|source| VectorStoreError::Transport {
            operation: "get collection",
            source,
        })?;
        let params = body
            .pointer("/result/config/params/vectors")
            .cloned()
            .and_then(|v| serde_json::from_value::<CollectionParams>(v).ok())
            .ok_or(VectorStoreError::Malformed {
                operation: "get collection",
            })?;

        if params.size != self.dimension || !params.distance.eq_ignore_ascii_case("cosine") {
            return Err(VectorStoreError::ConfigMismatch {
                collection: self.collection.clone(),
                expected_size: self.dimension,
                actual_size: params.size,
                actual_distance: params.distance,
            });
        }

        tracing::debug!(collection = %self.collection, size = self.dimension, "collection verified");
        Ok(())
    }

    async fn create_collection(&self) -> Result<(), VectorStoreError> {
        let body = json!({
            "vectors": { "size": self.dimension, "distance": "Cosine" }
        });
        let resp = self
            .http
            .put(self.url(""))
            .json(&body)
            .send()
            .await
            .map_err(|source| VectorStoreError::Transport {
                operation: "create collection",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(VectorStoreError::Http {
                operation: "create collection",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        tracing::info!(collection = %self.collection, size = self.dimension, "collection created");
        Ok(())
    }

    /// Upsert `points` in batches of `batch_size`, retrying each batch with
    /// exponential backoff. The first batch that exhausts its retries aborts
    /// the whole call with the last error observed.
    pub async fn batch_upsert(
        &self,
        points: &[VectorPoint],
        batch_size: usize,
    ) -> Result<(), VectorStoreError> {
        let batch_size = batch_size.max(1);
        for (batch_index, batch) in points.chunks(batch_size).enumerate() {
            let body = json!({
                "points": batch.iter().map(VectorPoint::to_qdrant_json).collect::<Vec<_>>()
            });

            let mut last_error = String::new();
            let mut done = false;
            for attempt in 0..MAX_BATCH_ATTEMPTS {
                if attempt > 0 {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                match self
                    .http
                    .put(self.url("/points?wait=true"))
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {
                        done = true;
                        break;
                    }
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        let text = resp.text().await.unwrap_or_default();
                        last_error = format!("status {status}: {text}");
                        tracing::warn!(batch_index, attempt, %last_error, "upsert batch rejected");
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        tracing::warn!(batch_index, attempt, %last_error, "upsert batch transport error");
                    }
                }
            }
            if !done {
                return Err(VectorStoreError::BatchFailed {
                    batch_index,
                    attempts: MAX_BATCH_ATTEMPTS,
                    last_error,
                });
            }
        }
        Ok(())
    }

    /// Nearest-neighbor search, score descending.
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<Value>,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(f) = filter {
            body["filter"] = f;
        }
        let resp = self
            .http
            .post(self.url("/points/search"))
            .json(&body)
            .send()
            .await
            .map_err(|source| VectorStoreError::Transport {
                operation: "search",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(VectorStoreError::Http {
                operation: "search",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body: Value = resp.json().await.map_err(|source| VectorStoreError::Transport {
            operation: "search",
            source,
        })?;
        let hits = body
            .get("result")
            .and_then(|r| r.as_array())
            .ok_or(VectorStoreError::Malformed { operation: "search" })?;

        Ok(hits
            .iter()
            .map(|hit| ScoredPoint {
                id: id_to_string(hit.get("id")),
                score: hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
                payload: parse_payload(hit.get("payload")),
            })
            .collect())
    }

    /// Paginated enumeration, optionally filtered. Returns the page and the
    /// offset token for the next page, if any.
    pub async fn scroll(
        &self,
        filter: Option<Value>,
        limit: usize,
        offset: Option<Value>,
    ) -> Result<(Vec<ScrolledPoint>, Option<Value>), VectorStoreError> {
        let mut body = json!({ "limit": limit, "with_payload": true });
        if let Some(f) = filter {
            body["filter"] = f;
        }
        if let Some(off) = offset {
            body["offset"] = off;
        }
        let resp = self
            .http
            .post(self.url("/points/scroll"))
            .json(&body)
            .send()
            .await
            .map_err(|source| VectorStoreError::Transport {
                operation: "scroll",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(VectorStoreError::Http {
                operation: "scroll",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body: Value = resp.json().await.map_err(|source| VectorStoreError::Transport {
            operation: "scroll",
            source,
        })?;
        let points = body
            .pointer("/result/points")
            .and_then(|p| p.as_array())
            .ok_or(VectorStoreError::Malformed { operation: "scroll" })?;
        let next = body
            .pointer("/result/next_page_offset")
            .filter(|v| !v.is_null())
            .cloned();

        Ok((
            points
                .iter()
                .map(|p| ScrolledPoint {
                    id: id_to_string(p.get("id")),
                    payload: parse_payload(p.get("payload")),
                })
                .collect(),
            next,
        ))
    }

    /// Delete points by id.
    pub async fn delete(&self, ids: &[String]) -> Result<(), VectorStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let resp = self
            .http
            .post(self.url("/points/delete?wait=true"))
            .json(&json!({ "points": ids }))
            .send()
            .await
            .map_err(|source| VectorStoreError::Transport {
                operation: "delete",
                source,
            })?;
        if !resp.status().is_success() {
            return Err(VectorStoreError::Http {
                operation: "delete",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn id_to_string(id: Option<&Value>) -> String {
    match id {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Payloads with an unrecognized `dataType` are logged and dropped rather
/// than failing the whole page.
fn parse_payload(raw: Option<&Value>) -> Option<PointPayload> {
    let raw = raw?;
    match serde_json::from_value::<PointPayload>(raw.clone()) {
        Ok(p) => Some(p),
        Err(_) => {
            let tag = raw.get("dataType").and_then(Value::as_str).unwrap_or("<missing>");
            tracing::warn!(data_type = tag, "skipping point with unknown payload shape");
            None
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(6));
    Duration::from_millis(base + rand::random_range(0..=BACKOFF_JITTER_MS))
}
