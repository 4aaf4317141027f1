//! Git inspection: HEAD file listing, commit history with per-commit
//! change enumeration, and textual diffs.
//!
//! Everything here is read-only plumbing over the repository's `.git`
//! directory — the server never writes into the working tree.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use git2::{Delta, DiffFormat, DiffOptions, ObjectType, Repository, Sort, TreeWalkMode};
use std::path::{Path, PathBuf};

use crate::vector_store::ChangeType;

/// Marker appended when `repository_diff` output is cut at the cap.
const DIFF_TRUNCATION_MARKER: &str = "\n... [diff truncated]";

pub const NO_REPOSITORY: &str = "No Git repository found";
pub const NO_PREVIOUS_COMMITS: &str = "No previous commits to compare";
pub const NO_TEXTUAL_CHANGES: &str = "No textual changes found";

/// One file touched by a commit.
#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: String,
    pub change_type: ChangeType,
    pub old_oid: String,
    pub new_oid: String,
    /// Unified diff text; absent for typechange entries and binary blobs.
    pub diff_text: Option<String>,
}

/// A commit as seen by the indexing pipeline.
#[derive(Debug, Clone)]
pub struct CommitDetail {
    pub oid: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    /// RFC 3339 commit timestamp.
    pub date: String,
    pub parents: Vec<String>,
    pub changed_files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// Newest-first cap; `None` walks the whole history.
    pub count: Option<usize>,
    /// Stop once commits get older than this.
    pub since: Option<DateTime<Utc>>,
    /// Rev to start from instead of HEAD.
    pub reference: Option<String>,
}

/// Absolute path to a Git working tree, resolved once at startup and
/// immutable for the server's lifetime.
#[derive(Debug, Clone)]
pub struct GitInspector {
    repo_path: PathBuf,
    /// Context lines rendered into unified diffs.
    context_lines: u32,
}

/// True when `path/.git` resolves to an openable repository.
pub fn validate_repository(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

impl GitInspector {
    pub fn new(repo_path: &Path, context_lines: u32) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            context_lines,
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.repo_path)
            .with_context(|| format!("not a git repository: {}", self.repo_path.display()))
    }

    /// Paths of every blob reachable from the HEAD tree, sorted.
    /// An unborn HEAD (fresh `git init`) yields an empty list, not an error.
    pub fn list_head_files(&self) -> Result<Vec<String>> {
        let repo = self.open()?;
        let mut files = Vec::new();

        let tree = match repo.head().ok().and_then(|h| h.peel_to_tree().ok()) {
            Some(t) => t,
            None => return Ok(files),
        };

        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    files.push(format!("{dir}{name}"));
                }
            }
            0
        })?;

        files.sort();
        Ok(files)
    }

    /// Commit history newest-first with per-commit change enumeration.
    ///
    /// Changes are derived from the commit tree against its first parent;
    /// an initial commit reports every file as `add` against empty content.
    pub fn commit_history(&self, opts: &HistoryOptions) -> Result<Vec<CommitDetail>> {
        let repo = self.open()?;
        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TIME)?;

        match &opts.reference {
            Some(reference) => {
                let obj = repo
                    .revparse_single(reference)
                    .with_context(|| format!("unknown ref '{reference}'"))?;
                walk.push(obj.id())?;
            }
            None => {
                // Unborn HEAD: no commits at all.
                if walk.push_head().is_err() {
                    return Ok(Vec::new());
                }
            }
        }

        let mut out = Vec::new();
        for oid in walk {
            if let Some(cap) = opts.count {
                if out.len() >= cap {
                    break;
                }
            }
            let commit = repo.find_commit(oid?)?;
            let date = commit_date(&commit);
            if let (Some(since), Some(parsed)) = (
                opts.since,
                DateTime::parse_from_rfc3339(&date).ok().map(|d| d.with_timezone(&Utc)),
            ) {
                if parsed < since {
                    break;
                }
            }

            out.push(CommitDetail {
                oid: commit.id().to_string(),
                message: commit.message().unwrap_or("").to_string(),
                author_name: commit.author().name().unwrap_or("").to_string(),
                author_email: commit.author().email().unwrap_or("").to_string(),
                committer_name: commit.committer().name().unwrap_or("").to_string(),
                date,
                parents: commit.parent_ids().map(|p| p.to_string()).collect(),
                changed_files: self.changed_files(&repo, &commit)?,
            });
        }
        Ok(out)
    }

    fn changed_files(&self, repo: &Repository, commit: &git2::Commit<'_>) -> Result<Vec<ChangedFile>> {
        let tree = commit.tree()?;
        let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());

        let mut diff_opts = DiffOptions::new();
        diff_opts.context_lines(self.context_lines);
        let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut diff_opts))?;

        let mut changed = Vec::new();
        for (idx, delta) in diff.deltas().enumerate() {
            let change_type = match delta.status() {
                Delta::Added => ChangeType::Add,
                Delta::Deleted => ChangeType::Delete,
                Delta::Modified => ChangeType::Modify,
                Delta::Typechange => ChangeType::Typechange,
                _ => continue,
            };
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();

            let diff_text = if change_type == ChangeType::Typechange {
                None
            } else {
                patch_text(&diff, idx)
            };

            changed.push(ChangedFile {
                path,
                change_type,
                old_oid: delta.old_file().id().to_string(),
                new_oid: delta.new_file().id().to_string(),
                diff_text,
            });
        }
        Ok(changed)
    }

    /// Textual diff between the two most recent commits, capped at
    /// `max_length` characters with a marker appended.
    pub fn repository_diff(&self, max_length: usize) -> String {
        let repo = match Repository::open(&self.repo_path) {
            Ok(r) => r,
            Err(_) => return NO_REPOSITORY.to_string(),
        };

        let mut walk = match repo.revwalk() {
            Ok(w) => w,
            Err(_) => return NO_REPOSITORY.to_string(),
        };
        if walk.set_sorting(Sort::TIME).is_err() || walk.push_head().is_err() {
            return NO_PREVIOUS_COMMITS.to_string();
        }

        let newest: Vec<git2::Oid> = walk.filter_map(|o| o.ok()).take(2).collect();
        if newest.len() < 2 {
            return NO_PREVIOUS_COMMITS.to_string();
        }

        let text = (|| -> Result<String> {
            let head = repo.find_commit(newest[0])?;
            let prev = repo.find_commit(newest[1])?;
            let mut diff_opts = DiffOptions::new();
            diff_opts.context_lines(self.context_lines);
            let diff = repo.diff_tree_to_tree(
                Some(&prev.tree()?),
                Some(&head.tree()?),
                Some(&mut diff_opts),
            )?;

            let mut out = String::new();
            diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
                match line.origin() {
                    '+' | '-' | ' ' => out.push(line.origin()),
                    _ => {}
                }
                out.push_str(&String::from_utf8_lossy(line.content()));
                true
            })?;
            Ok(out)
        })();

        match text {
            Ok(t) if t.trim().is_empty() => NO_TEXTUAL_CHANGES.to_string(),
            Ok(t) => truncate_with_marker(t, max_length),
            Err(e) => {
                tracing::warn!(error = %e, "repository diff failed");
                NO_TEXTUAL_CHANGES.to_string()
            }
        }
    }
}

fn commit_date(commit: &git2::Commit<'_>) -> String {
    DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0)
        .map(|d| d.to_rfc3339())
        .unwrap_or_default()
}

fn patch_text(diff: &git2::Diff<'_>, idx: usize) -> Option<String> {
    let mut patch = git2::Patch::from_diff(diff, idx).ok()??;
    let buf = patch.to_buf().ok()?;
    buf.as_str().map(str::to_string)
}

fn truncate_with_marker(mut text: String, max_length: usize) -> String {
    if text.len() <= max_length {
        return text;
    }
    let mut cut = max_length;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(DIFF_TRUNCATION_MARKER);
    text
}

#[cfg(test)]
pub(crate) mod test_repo {
    use super::*;
    use git2::Signature;

    /// Write `content` at `rel_path`, stage it, and commit. Returns the oid.
    pub fn commit_file(repo: &Repository, rel_path: &str, content: &str, message: &str) -> git2::Oid {
        let workdir = repo.workdir().expect("bare repos not used in tests");
        let abs = workdir.join(rel_path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&abs, content).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel_path)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();

        let sig = Signature::now("Test Author", "test@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    /// Remove `rel_path` from the working tree and index, then commit.
    pub fn commit_removal(repo: &Repository, rel_path: &str, message: &str) -> git2::Oid {
        let workdir = repo.workdir().unwrap();
        std::fs::remove_file(workdir.join(rel_path)).unwrap();

        let mut index = repo.index().unwrap();
        index.remove_path(Path::new(rel_path)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();

        let sig = Signature::now("Test Author", "test@example.com").unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_repo::*;
    use super::*;

    fn temp_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn validation_distinguishes_repos_from_plain_dirs() {
        let plain = tempfile::tempdir().unwrap();
        assert!(!validate_repository(plain.path()));

        let (dir, _repo) = temp_repo();
        assert!(validate_repository(dir.path()));
    }

    #[test]
    fn unborn_head_lists_no_files() {
        let (dir, _repo) = temp_repo();
        let inspector = GitInspector::new(dir.path(), 3);
        assert!(inspector.list_head_files().unwrap().is_empty());
        assert!(inspector
            .commit_history(&HistoryOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn head_files_cover_nested_paths() {
        let (dir, repo) = temp_repo();
        commit_file(&repo, "a.ts", "export const x = 1;\n", "add a");
        commit_file(&repo, "src/lib/b.ts", "export const y = 2;\n", "add b");

        let inspector = GitInspector::new(dir.path(), 3);
        assert_eq!(inspector.list_head_files().unwrap(), vec!["a.ts", "src/lib/b.ts"]);
    }

    #[test]
    fn initial_commit_reports_adds_against_empty() {
        let (dir, repo) = temp_repo();
        commit_file(&repo, "a.ts", "export const x = 1;\n", "initial");

        let inspector = GitInspector::new(dir.path(), 3);
        let history = inspector.commit_history(&HistoryOptions::default()).unwrap();
        assert_eq!(history.len(), 1);
        let initial = &history[0];
        assert!(initial.parents.is_empty());
        assert_eq!(initial.changed_files.len(), 1);
        let change = &initial.changed_files[0];
        assert_eq!(change.change_type, ChangeType::Add);
        assert_eq!(change.path, "a.ts");
        let diff = change.diff_text.as_deref().unwrap();
        assert!(diff.contains("+export const x = 1;"), "diff was: {diff}");
    }

    #[test]
    fn history_is_newest_first_with_change_types() {
        let (dir, repo) = temp_repo();
        commit_file(&repo, "a.ts", "v1\n", "add a");
        commit_file(&repo, "a.ts", "v2\n", "modify a");
        commit_file(&repo, "b.ts", "b\n", "add b");
        commit_removal(&repo, "a.ts", "remove a");

        let inspector = GitInspector::new(dir.path(), 3);
        let history = inspector
            .commit_history(&HistoryOptions {
                count: Some(3),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "remove a");
        assert_eq!(history[0].changed_files[0].change_type, ChangeType::Delete);
        assert_eq!(history[1].message, "add b");
        assert_eq!(history[1].changed_files[0].change_type, ChangeType::Add);
        assert_eq!(history[2].message, "modify a");
        assert_eq!(history[2].changed_files[0].change_type, ChangeType::Modify);

        let modify_diff = history[2].changed_files[0].diff_text.as_deref().unwrap();
        assert!(modify_diff.contains("-v1"));
        assert!(modify_diff.contains("+v2"));
    }

    #[test]
    fn repository_diff_boundary_messages() {
        let plain = tempfile::tempdir().unwrap();
        let inspector = GitInspector::new(plain.path(), 3);
        assert_eq!(inspector.repository_diff(4_000), NO_REPOSITORY);

        let (dir, repo) = temp_repo();
        let inspector = GitInspector::new(dir.path(), 3);
        commit_file(&repo, "a.ts", "one\n", "first");
        assert_eq!(inspector.repository_diff(4_000), NO_PREVIOUS_COMMITS);

        commit_file(&repo, "a.ts", "two\n", "second");
        let diff = inspector.repository_diff(4_000);
        assert!(diff.contains("-one"));
        assert!(diff.contains("+two"));
    }

    #[test]
    fn repository_diff_is_truncated_with_marker() {
        let (dir, repo) = temp_repo();
        commit_file(&repo, "a.ts", "start\n", "first");
        let big: String = (0..400).map(|i| format!("line number {i}\n")).collect();
        commit_file(&repo, "a.ts", &big, "second");

        let inspector = GitInspector::new(dir.path(), 3);
        let diff = inspector.repository_diff(500);
        assert!(diff.ends_with(DIFF_TRUNCATION_MARKER));
        assert!(diff.len() <= 500 + DIFF_TRUNCATION_MARKER.len());
    }
}
