//! Background indexing pipeline.
//!
//! Transforms the repository into a consistent set of vector points:
//! file-content chunks, one commit-info point per commit, and diff chunks
//! per changed file. Progress is published into a process-global
//! `IndexingStatus` mailbox written only by the active run; everything else
//! just reads snapshots.
//!
//! Exactly one run may be active at a time. Triggers while busy are
//! rejected with `IndexBusy`, which the HTTP surface maps to 409.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, RwLock};
use tracing::Instrument;

use crate::config;
use crate::git::{GitInspector, HistoryOptions};
use crate::llm;
use crate::text::{chunk_text, preprocess};
use crate::vector_store::{filter_data_type, PointPayload, VectorPoint, VectorStore};

/// Extensions eligible for file-content indexing.
const ALLOWED_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "rs", "go", "java", "kt", "c", "h", "cpp",
    "hpp", "cc", "cs", "rb", "php", "swift", "scala", "md", "json", "yaml", "yml", "toml",
    "html", "css", "sql", "sh",
];

/// Directory components that disqualify a path outright.
const EXCLUDED_DIRS: &[&str] = &["node_modules", "dist"];

/// Page size used when scrolling for stale entries.
const SCROLL_PAGE: usize = 256;

#[derive(Debug, thiserror::Error)]
#[error("an indexing run is already in progress")]
pub struct IndexBusy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingState {
    Idle,
    Initializing,
    ValidatingRepo,
    ListingFiles,
    CleaningStaleEntries,
    IndexingFileContent,
    IndexingCommitsDiffs,
    Completed,
    Failed,
}

impl IndexingState {
    /// A run is in flight; re-index triggers must be rejected.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing
                | Self::ValidatingRepo
                | Self::ListingFiles
                | Self::CleaningStaleEntries
                | Self::IndexingFileContent
                | Self::IndexingCommitsDiffs
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingStatus {
    pub status: IndexingState,
    /// 0..=100.
    pub overall_progress: u8,
    pub message: String,
    pub last_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files_to_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_indexed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_commits_to_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commits_indexed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

impl IndexingStatus {
    fn idle() -> Self {
        Self {
            status: IndexingState::Idle,
            overall_progress: 0,
            message: "Indexing has not run yet".to_string(),
            last_updated_at: Utc::now(),
            current_file: None,
            current_commit: None,
            total_files_to_index: None,
            files_indexed: None,
            total_commits_to_index: None,
            commits_indexed: None,
            error_details: None,
        }
    }
}

static STATUS: LazyLock<RwLock<IndexingStatus>> = LazyLock::new(|| RwLock::new(IndexingStatus::idle()));

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Read-only snapshot for tools, HTTP, and peers.
pub fn status_snapshot() -> IndexingStatus {
    STATUS.read().expect("status lock poisoned").clone()
}

fn publish<F>(mutate: F)
where
    F: FnOnce(&mut IndexingStatus),
{
    let mut guard = STATUS.write().expect("status lock poisoned");
    mutate(&mut guard);
    guard.last_updated_at = Utc::now();
}

fn publish_state(state: IndexingState, progress: u8, message: impl Into<String>) {
    let message = message.into();
    tracing::info!(state = ?state, progress, %message, "indexing status");
    publish(|s| {
        s.status = state;
        s.overall_progress = progress;
        s.message = message;
    });
}

/// Releases the single-run guard even when the run panics or errors.
pub(crate) struct RunGuard;

impl RunGuard {
    pub(crate) fn acquire() -> Option<Self> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(Self)
    }
}

/// Serializes tests (across modules) that touch the process-global run
/// guard, so busy/free assertions don't race each other.
#[cfg(test)]
pub(crate) mod test_sync {
    pub(crate) static GUARD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

/// Start a background run, rejecting if one is active.
pub fn try_spawn(store: Arc<VectorStore>, inspector: GitInspector) -> Result<(), IndexBusy> {
    let guard = RunGuard::acquire().ok_or(IndexBusy)?;
    tokio::spawn(async move {
        let _guard = guard;
        run(&store, &inspector).await;
    });
    Ok(())
}

/// Run the pipeline to completion, folding any error into the `failed`
/// terminal status. Callers that need the single-run guarantee go through
/// `try_spawn`; this entry point is for tests and startup paths that
/// already hold the guard.
pub async fn run(store: &VectorStore, inspector: &GitInspector) {
    let span = tracing::info_span!("index_run", repo = %inspector.repo_path().display());
    let outcome = run_inner(store, inspector).instrument(span).await;
    match outcome {
        Ok(summary) => {
            publish_state(IndexingState::Completed, 100, summary);
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "indexing run failed");
            publish(|s| {
                s.status = IndexingState::Failed;
                s.message = "Indexing failed".to_string();
                s.error_details = Some(format!("{e:#}"));
            });
        }
    }
}

async fn run_inner(store: &VectorStore, inspector: &GitInspector) -> Result<String> {
    let cfg = config::get();
    publish(|s| {
        *s = IndexingStatus::idle();
        s.status = IndexingState::Initializing;
        s.message = "Starting indexing run".to_string();
    });

    publish_state(IndexingState::ValidatingRepo, 2, "Validating repository");
    if !crate::git::validate_repository(inspector.repo_path()) {
        anyhow::bail!(
            "'{}' is not a git repository",
            inspector.repo_path().display()
        );
    }
    store
        .initialize()
        .await
        .context("vector collection initialization failed")?;

    publish_state(IndexingState::ListingFiles, 5, "Listing files at HEAD");
    let head_files = inspector.list_head_files()?;
    let allowed: Vec<String> = head_files.into_iter().filter(|p| is_indexable(p)).collect();

    publish_state(
        IndexingState::CleaningStaleEntries,
        8,
        format!("Pruning stale entries against {} current files", allowed.len()),
    );
    let removed = prune_stale(store, &allowed).await?;
    if removed > 0 {
        tracing::info!(removed, "pruned stale file-chunk points");
    }

    let embedder = llm::embedding_provider().map_err(|e| anyhow::anyhow!(e))?;

    // ── File-content chunks ──────────────────────────────────────────────
    publish(|s| {
        s.status = IndexingState::IndexingFileContent;
        s.overall_progress = 10;
        s.message = "Indexing file contents".to_string();
        s.total_files_to_index = Some(allowed.len());
        s.files_indexed = Some(0);
    });

    let repo_path_str = inspector.repo_path().to_string_lossy().to_string();
    let mut buffer: Vec<VectorPoint> = Vec::new();
    let total_files = allowed.len().max(1);

    for (i, rel_path) in allowed.iter().enumerate() {
        publish(|s| {
            s.current_file = Some(rel_path.clone());
            s.files_indexed = Some(i);
            s.overall_progress = 10 + (45 * i / total_files) as u8;
        });

        let abs = inspector.repo_path().join(rel_path);
        let raw = match std::fs::read(&abs) {
            Ok(bytes) if !bytes.contains(&0u8) => bytes,
            Ok(_) => continue, // binary
            Err(e) => {
                tracing::warn!(file = %rel_path, error = %e, "skipping unreadable file");
                continue;
            }
        };
        let content = preprocess(&String::from_utf8_lossy(&raw));
        if content.is_empty() {
            continue;
        }
        let last_modified = file_mtime(&abs);

        let chunks = chunk_text(
            &content,
            cfg.indexing.file_chunk_size_chars,
            cfg.indexing.file_chunk_overlap_chars,
        );
        let total_chunks = chunks.len();
        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            if chunk.trim().is_empty() {
                continue;
            }
            let vector = embedder
                .generate_embedding(&chunk)
                .await
                .with_context(|| format!("embedding failed for {rel_path}"))?;
            buffer.push(VectorPoint::new(
                vector,
                PointPayload::FileChunk {
                    filepath: rel_path.clone(),
                    file_content_chunk: chunk,
                    last_modified: last_modified.clone(),
                    chunk_index,
                    total_chunks,
                    repository_path: Some(repo_path_str.clone()),
                },
            ));
            if buffer.len() >= cfg.indexing.batch_upsert_size {
                store
                    .batch_upsert(&buffer, cfg.indexing.batch_upsert_size)
                    .await?;
                buffer.clear();
            }
        }
    }
    if !buffer.is_empty() {
        store
            .batch_upsert(&buffer, cfg.indexing.batch_upsert_size)
            .await?;
        buffer.clear();
    }

    // ── Commits and diffs ────────────────────────────────────────────────
    let commits = inspector.commit_history(&HistoryOptions {
        count: Some(cfg.indexing.commit_history_max_count),
        ..Default::default()
    })?;

    publish(|s| {
        s.status = IndexingState::IndexingCommitsDiffs;
        s.overall_progress = 55;
        s.message = "Indexing commit metadata and diffs".to_string();
        s.current_file = None;
        s.files_indexed = Some(allowed.len());
        s.total_commits_to_index = Some(commits.len());
        s.commits_indexed = Some(0);
    });

    let total_commits = commits.len().max(1);
    for (i, commit) in commits.iter().enumerate() {
        publish(|s| {
            s.current_commit = Some(commit.oid.clone());
            s.commits_indexed = Some(i);
            s.overall_progress = 55 + (40 * i / total_commits) as u8;
        });

        let vector = embedder
            .generate_embedding(&render_commit_text(commit))
            .await
            .with_context(|| format!("embedding failed for commit {}", commit.oid))?;
        buffer.push(VectorPoint::new(
            vector,
            PointPayload::CommitInfo {
                commit_oid: commit.oid.clone(),
                commit_message: commit.message.clone(),
                commit_author_name: commit.author_name.clone(),
                commit_author_email: commit.author_email.clone(),
                commit_date: commit.date.clone(),
                changed_files_summary: commit
                    .changed_files
                    .iter()
                    .map(|c| format!("{} ({})", c.path, c.change_type.as_str()))
                    .collect(),
                parent_oids: commit.parents.clone(),
                repository_path: Some(repo_path_str.clone()),
            },
        ));

        for change in &commit.changed_files {
            let Some(diff_text) = change.diff_text.as_deref() else {
                continue;
            };
            let normalized = preprocess(diff_text);
            if normalized.is_empty() {
                continue;
            }
            let chunks = chunk_text(
                &normalized,
                cfg.indexing.diff_chunk_size_chars,
                cfg.indexing.diff_chunk_overlap_chars,
            );
            let total_chunks = chunks.len();
            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                if chunk.trim().is_empty() {
                    continue;
                }
                let vector = embedder
                    .generate_embedding(&chunk)
                    .await
                    .with_context(|| format!("embedding failed for diff {}:{}", commit.oid, change.path))?;
                buffer.push(VectorPoint::new(
                    vector,
                    PointPayload::DiffChunk {
                        commit_oid: commit.oid.clone(),
                        filepath: change.path.clone(),
                        diff_content_chunk: chunk,
                        chunk_index,
                        total_chunks,
                        change_type: change.change_type,
                        repository_path: Some(repo_path_str.clone()),
                    },
                ));
            }
        }

        // Cap memory: ship what we have between commits.
        if buffer.len() >= cfg.indexing.batch_upsert_size {
            store
                .batch_upsert(&buffer, cfg.indexing.batch_upsert_size)
                .await?;
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        store
            .batch_upsert(&buffer, cfg.indexing.batch_upsert_size)
            .await?;
    }

    publish(|s| {
        s.current_file = None;
        s.current_commit = None;
        s.commits_indexed = Some(commits.len());
    });
    Ok(format!(
        "Indexed {} files and {} commits",
        allowed.len(),
        commits.len()
    ))
}

/// Scroll every `file_chunk` point and delete those whose `filepath` is no
/// longer in the working tree. Commit/diff points are historical and stay.
async fn prune_stale(store: &VectorStore, current_files: &[String]) -> Result<usize> {
    let current: HashSet<&str> = current_files.iter().map(String::as_str).collect();
    let mut stale: Vec<String> = Vec::new();
    let mut offset = None;

    loop {
        let (points, next) = store
            .scroll(Some(filter_data_type("file_chunk")), SCROLL_PAGE, offset)
            .await?;
        for point in points {
            match point.payload {
                Some(PointPayload::FileChunk { ref filepath, .. })
                    if !current.contains(filepath.as_str()) =>
                {
                    stale.push(point.id);
                }
                _ => {}
            }
        }
        match next {
            Some(n) => offset = Some(n),
            None => break,
        }
    }

    let removed = stale.len();
    store.delete(&stale).await?;
    Ok(removed)
}

/// Canonical text embedded for a commit-info point.
fn render_commit_text(commit: &crate::git::CommitDetail) -> String {
    let files: Vec<String> = commit
        .changed_files
        .iter()
        .map(|c| format!("{} ({})", c.path, c.change_type.as_str()))
        .collect();
    preprocess(&format!(
        "Commit {} by {} <{}> on {}: {} Changed files: {}",
        commit.oid,
        commit.author_name,
        commit.author_email,
        commit.date,
        commit.message,
        files.join(", ")
    ))
}

/// Extension allowlist plus hard directory exclusions.
fn is_indexable(rel_path: &str) -> bool {
    let path = Path::new(rel_path);
    for comp in path.components() {
        if let Some(name) = comp.as_os_str().to_str() {
            if EXCLUDED_DIRS.contains(&name) {
                return false;
            }
        }
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_mtime(abs: &Path) -> String {
    std::fs::metadata(abs)
        .and_then(|m| m.modified())
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_filters_extensions_and_dirs() {
        assert!(is_indexable("src/main.rs"));
        assert!(is_indexable("web/app.TSX"));
        assert!(is_indexable("README.md"));
        assert!(!is_indexable("assets/logo.png"));
        assert!(!is_indexable("Makefile"));
        assert!(!is_indexable("node_modules/lodash/index.js"));
        assert!(!is_indexable("packages/app/dist/bundle.js"));
    }

    #[test]
    fn active_states_cover_the_pipeline_interior() {
        use IndexingState::*;
        for s in [
            Initializing,
            ValidatingRepo,
            ListingFiles,
            CleaningStaleEntries,
            IndexingFileContent,
            IndexingCommitsDiffs,
        ] {
            assert!(s.is_active(), "{s:?} should be active");
        }
        for s in [Idle, Completed, Failed] {
            assert!(!s.is_active(), "{s:?} should be terminal/idle");
        }
    }

    #[test]
    fn pipeline_states_are_monotone() {
        use IndexingState::*;
        let order = [
            Idle,
            Initializing,
            ValidatingRepo,
            ListingFiles,
            CleaningStaleEntries,
            IndexingFileContent,
            IndexingCommitsDiffs,
            Completed,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1], "{:?} must precede {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn run_guard_is_exclusive_and_releases() {
        let _serial = test_sync::GUARD_LOCK.lock().unwrap();
        let first = RunGuard::acquire().expect("guard should be free");
        assert!(RunGuard::acquire().is_none(), "second acquire must fail");
        drop(first);
        assert!(RunGuard::acquire().is_some(), "guard must release on drop");
    }

    #[test]
    fn commit_text_is_preprocessed_and_complete() {
        let commit = crate::git::CommitDetail {
            oid: "abc".to_string(),
            message: "fix:\n  retry logic".to_string(),
            author_name: "Ada".to_string(),
            author_email: "ada@example.com".to_string(),
            committer_name: "Ada".to_string(),
            date: "2025-01-01T00:00:00+00:00".to_string(),
            parents: vec![],
            changed_files: vec![crate::git::ChangedFile {
                path: "src/retry.rs".to_string(),
                change_type: crate::vector_store::ChangeType::Modify,
                old_oid: "0".to_string(),
                new_oid: "1".to_string(),
                diff_text: None,
            }],
        };
        let text = render_commit_text(&commit);
        assert!(text.contains("Commit abc by Ada <ada@example.com>"));
        assert!(text.contains("fix: retry logic"));
        assert!(text.contains("src/retry.rs (modify)"));
        assert_eq!(text, preprocess(&text), "must already be normalized");
    }

    #[test]
    fn status_snapshot_serializes_camel_case() {
        let snap = IndexingStatus::idle();
        let value = serde_json::to_value(&snap).unwrap();
        assert!(value.get("overallProgress").is_some());
        assert!(value.get("lastUpdatedAt").is_some());
        assert!(value.get("errorDetails").is_none());
    }
}
