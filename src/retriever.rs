//! Iterative retrieval with query refinement.
//!
//! A bounded loop: embed the current query, search, score the result set by
//! mean relevance, and — when below the threshold — rewrite the query and
//! try again. The rewrite strategy depends on how bad the results were:
//!
//!   avg < 0.3 or empty   → broaden  (strip specificity, extensions, quoting)
//!   0.3 ≤ avg < 0.7      → focus    (borrow keywords from the top hits)
//!   avg ≥ 0.7            → tweak    (anchor on the best hit's file type/dir)
//!
//! The best result set seen across iterations is what gets returned.

use anyhow::Result;
use std::path::Path;

use crate::config;
use crate::llm;
use crate::text::{extract_keywords, preprocess};
use crate::vector_store::{filter_files, ScoredPoint, VectorStore};

/// Results below this mean score trigger broadening.
const BROADEN_BELOW: f32 = 0.3;

/// Results below this mean score (but above `BROADEN_BELOW`) trigger focusing.
const FOCUS_BELOW: f32 = 0.7;

/// Terms that over-constrain a query.
const SPECIFICITY_TERMS: &[&str] = &["only", "exactly", "specifically", "just", "precise", "exact"];

/// Source-file extensions stripped from query tokens when broadening.
const SOURCE_EXTENSIONS: &[&str] = &[
    ".ts", ".tsx", ".js", ".jsx", ".rs", ".py", ".go", ".java", ".c", ".cpp", ".h", ".rb", ".php",
];

/// Queries shorter than this after broadening get generic filler terms.
const MIN_BROADENED_LEN: usize = 10;

#[derive(Debug, Clone)]
pub struct RefinedSearch {
    pub results: Vec<ScoredPoint>,
    pub refined_query: String,
    pub relevance_score: f32,
    pub refinement_count: usize,
}

/// Search with bounded refinement.
///
/// `files` restricts hits to the given paths; `limit` and `max_refinements`
/// default from Config. Returns the best results seen, the final query
/// wording, and the best mean score.
pub async fn search_with_refinement(
    store: &VectorStore,
    query: &str,
    files: Option<&[String]>,
    custom_limit: Option<usize>,
    max_refinements: Option<usize>,
    relevance_threshold: f32,
) -> Result<RefinedSearch> {
    let cfg = config::get();
    let limit = custom_limit.unwrap_or(cfg.query.search_limit_default);
    let max_refinements = max_refinements.unwrap_or(cfg.query.max_refinement_iterations);
    let embedder = llm::embedding_provider().map_err(|e| anyhow::anyhow!(e))?;

    let mut current = query.to_string();
    let mut best: Vec<ScoredPoint> = Vec::new();
    let mut best_score = 0.0f32;
    let mut refinement_count = 0usize;

    for i in 0..=max_refinements {
        refinement_count = i;
        let embedding = embedder
            .generate_embedding(&preprocess(&current))
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let filter = files.filter(|f| !f.is_empty()).map(filter_files);
        let results = store.search(&embedding, limit, filter).await?;
        let avg = mean_score(&results);
        tracing::debug!(iteration = i, avg, hits = results.len(), query = %current, "refinement step");

        if avg > best_score {
            best = results.clone();
            best_score = avg;
        }

        if avg >= relevance_threshold || i == max_refinements {
            break;
        }

        let next = refine(&current, &results, avg);
        if next == current && !results.is_empty() {
            break; // fixpoint: rewriting is not changing anything
        }
        current = next;
    }

    Ok(RefinedSearch {
        results: best,
        refined_query: current,
        relevance_score: best_score,
        refinement_count,
    })
}

pub fn mean_score(results: &[ScoredPoint]) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|p| p.score).sum::<f32>() / results.len() as f32
}

/// Rewrite `query` based on how the current results scored.
pub fn refine(query: &str, results: &[ScoredPoint], avg: f32) -> String {
    if avg < BROADEN_BELOW || results.is_empty() {
        broaden(query)
    } else if avg < FOCUS_BELOW {
        focus(query, results)
    } else {
        tweak(query, results)
    }
}

/// Drop everything that narrows the query: quoting, brackets, specificity
/// adverbs, and source-file extensions. Pad with generic terms when the
/// remainder is too short to embed meaningfully.
fn broaden(query: &str) -> String {
    let stripped: String = query
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '`' | '(' | ')' | '[' | ']' | '{' | '}'))
        .collect();

    let mut kept: Vec<String> = Vec::new();
    for token in stripped.split_whitespace() {
        let lower = token.to_lowercase();
        if SPECIFICITY_TERMS.contains(&lower.as_str()) {
            continue;
        }
        let mut token = token.to_string();
        for ext in SOURCE_EXTENSIONS {
            if lower.ends_with(ext) {
                token.truncate(token.len() - ext.len());
                break;
            }
        }
        if !token.is_empty() {
            kept.push(token);
        }
    }

    let mut out = kept.join(" ");
    if out.len() < MIN_BROADENED_LEN {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str("code implementation");
    }
    out
}

/// Append the top unused keywords from the best results' content.
fn focus(query: &str, results: &[ScoredPoint]) -> String {
    let texts: Vec<&str> = results
        .iter()
        .take(3)
        .filter_map(|r| r.payload.as_ref())
        .map(|p| p.content_text())
        .collect();
    let query_words: Vec<String> = query.split_whitespace().map(str::to_string).collect();
    let keywords = extract_keywords(&texts, &query_words);

    let mut out = query.to_string();
    for kw in keywords.into_iter().take(2) {
        out.push(' ');
        out.push_str(&kw);
    }
    out
}

/// Nudge an already-close query by anchoring it to the best hit's file
/// type, or failing that, its top-level directory.
fn tweak(query: &str, results: &[ScoredPoint]) -> String {
    let Some(filepath) = results
        .first()
        .and_then(|r| r.payload.as_ref())
        .and_then(|p| p.filepath())
    else {
        return query.to_string();
    };
    let tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    if let Some(ext) = Path::new(filepath).extension().and_then(|e| e.to_str()) {
        if !tokens.contains(&ext.to_lowercase()) {
            return format!("{query} {ext}");
        }
    }
    if let Some(dir) = filepath.split('/').next().filter(|d| *d != filepath) {
        if !tokens.contains(&dir.to_lowercase()) {
            return format!("{query} {dir}");
        }
    }
    query.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::PointPayload;

    fn hit(score: f32, filepath: &str, content: &str) -> ScoredPoint {
        ScoredPoint {
            id: "id".to_string(),
            score,
            payload: Some(PointPayload::FileChunk {
                filepath: filepath.to_string(),
                file_content_chunk: content.to_string(),
                last_modified: String::new(),
                chunk_index: 0,
                total_chunks: 1,
                repository_path: None,
            }),
        }
    }

    #[test]
    fn low_score_broadens_away_specificity() {
        let refined = refine("only \"foo.ts\" bar", &[hit(0.1, "a.rs", "x")], 0.1);
        assert!(!refined.contains(".ts"), "got: {refined}");
        assert!(!refined.to_lowercase().contains("only"), "got: {refined}");
        assert!(!refined.contains('"'), "got: {refined}");
        assert!(refined.contains("foo"));
        assert!(refined.contains("bar"));
    }

    #[test]
    fn broaden_pads_short_queries_with_generic_terms() {
        let refined = refine("only x.ts", &[], 0.0);
        assert!(refined.contains("code implementation"), "got: {refined}");
    }

    #[test]
    fn mid_score_focuses_with_result_keywords() {
        let results = vec![
            hit(0.5, "src/auth.rs", "session token validation middleware"),
            hit(0.4, "src/login.rs", "token refresh handler"),
        ];
        let refined = refine("auth flow", &results, 0.5);
        assert!(refined.starts_with("auth flow"));
        // Two new keywords appended from the payload contents.
        let appended: Vec<&str> = refined["auth flow".len()..].split_whitespace().collect();
        assert_eq!(appended.len(), 2, "got: {refined}");
        assert!(appended.contains(&"session"), "got: {refined}");
    }

    #[test]
    fn high_score_tweaks_with_file_type() {
        let results = vec![hit(0.72, "engine/parser.rs", "fn parse()")];
        let refined = refine("parser internals", &results, 0.72);
        assert_eq!(refined, "parser internals rs");

        // Extension already present → fall through to top-level directory.
        let refined = refine("parser internals rs", &results, 0.72);
        assert_eq!(refined, "parser internals rs engine");
    }

    #[test]
    fn empty_results_always_broaden() {
        let refined = refine("exactly THIS thing", &[], 0.9);
        assert!(!refined.to_lowercase().contains("exactly"));
    }

    #[test]
    fn mean_score_of_empty_is_zero() {
        assert_eq!(mean_score(&[]), 0.0);
        let results = vec![hit(0.2, "a", ""), hit(0.4, "b", "")];
        assert!((mean_score(&results) - 0.3).abs() < 1e-6);
    }
}
