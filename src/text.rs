//! Text preprocessing and fixed-size chunking.
//!
//! `preprocess` is used both before embedding and when deriving point ids,
//! so it must be deterministic and idempotent. `chunk_text` windows a text
//! into overlapping character chunks; the chunk list covers the whole input.

/// Stopwords dropped by keyword extraction. Deliberately tiny — the goal is
/// to filter glue words out of refinement terms, not full NLP.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "have", "what", "when", "where", "which",
    "will", "would", "could", "should", "into", "onto", "does", "then", "than", "them", "they",
    "there", "here", "some", "such", "been", "were", "your", "about", "function", "class", "file",
    "code",
];

/// Normalize a text for embedding and id derivation.
///
/// Collapses all Unicode whitespace runs to single spaces and trims the
/// ends. Idempotent: `preprocess(preprocess(x)) == preprocess(x)`.
pub fn preprocess(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_gap = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            in_gap = true;
        } else {
            if in_gap && !out.is_empty() {
                out.push(' ');
            }
            in_gap = false;
            out.push(ch);
        }
    }
    out
}

/// Split `text` into chunks of at most `size` characters where consecutive
/// chunks share `overlap` characters.
///
/// Contract: `size > overlap`; empty input produces no chunks; the chunks
/// concatenated with the overlap removed reconstruct the input.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    assert!(size > overlap, "chunk size must exceed overlap");
    if text.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let step = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Pull candidate refinement keywords out of result texts.
///
/// Preprocesses, splits on whitespace, lowercases, strips punctuation from
/// the ends, drops short words and stopwords, and dedupes preserving first
/// occurrence. Words already present in `exclude` are skipped.
pub fn extract_keywords(texts: &[&str], exclude: &[String]) -> Vec<String> {
    let excluded: Vec<String> = exclude.iter().map(|w| w.to_lowercase()).collect();
    let mut seen = Vec::new();
    for text in texts {
        for raw in preprocess(text).split_whitespace() {
            let word = raw
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                .to_lowercase();
            if word.len() < 4 {
                continue;
            }
            if STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            if excluded.contains(&word) || seen.contains(&word) {
                continue;
            }
            seen.push(word);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_is_idempotent() {
        let raw = "  fn   main()\n{\n\tprintln!(\"hi\");\n}\r\n";
        let once = preprocess(raw);
        assert_eq!(preprocess(&once), once);
        assert_eq!(once, "fn main() { println!(\"hi\"); }");
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", 10, 2).is_empty());
    }

    #[test]
    fn short_input_yields_exactly_one_chunk() {
        let chunks = chunk_text("tiny", 100, 10);
        assert_eq!(chunks, vec!["tiny".to_string()]);
    }

    #[test]
    fn overlap_removed_reconstructs_input() {
        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        let size = 10;
        let overlap = 3;
        let chunks = chunk_text(text, size, overlap);

        assert!(chunks.iter().all(|c| c.chars().count() <= size));
        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let next: Vec<char> = pair[1].chars().collect();
            assert_eq!(&prev[prev.len() - overlap..], &next[..overlap]);
        }

        let mut rebuilt: String = chunks[0].clone();
        for c in &chunks[1..] {
            rebuilt.extend(c.chars().skip(overlap));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn chunking_is_char_not_byte_based() {
        let text = "héllo wörld — ünïcode text that is lönger than öne chunk";
        let chunks = chunk_text(text, 16, 4);
        let mut rebuilt: String = chunks[0].clone();
        for c in &chunks[1..] {
            rebuilt.extend(c.chars().skip(4));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    #[should_panic(expected = "chunk size must exceed overlap")]
    fn size_must_exceed_overlap() {
        chunk_text("abc", 4, 4);
    }

    #[test]
    fn keywords_dedupe_and_skip_stopwords() {
        let kws = extract_keywords(
            &["the parser rebuilds the token stream", "parser internals and token caches"],
            &["internals".to_string()],
        );
        assert_eq!(kws, vec!["parser", "rebuilds", "token", "stream", "caches"]);
    }
}
