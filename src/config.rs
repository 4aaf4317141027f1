use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

/// Which backend serves a given capability. Embedding and suggestion
/// providers are selected independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    OpenAI,
    DeepSeek,
    Gemini,
    Claude,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openai" => Some(Self::OpenAI),
            "deepseek" => Some(Self::DeepSeek),
            "gemini" => Some(Self::Gemini),
            "claude" | "anthropic" => Some(Self::Claude),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAI => "openai",
            Self::DeepSeek => "deepseek",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        }
    }

    /// Env var holding the API key for this provider, if it needs one.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self {
            Self::Ollama => None,
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Claude => Some("ANTHROPIC_API_KEY"),
        }
    }
}

/// Connection endpoints and credentials per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderHosts {
    pub ollama_host: String,
    pub openai_base_url: String,
    pub deepseek_base_url: String,
    pub gemini_base_url: String,
    pub claude_base_url: String,
    pub openai_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub claude_api_key: Option<String>,
}

impl Default for ProviderHosts {
    fn default() -> Self {
        Self {
            ollama_host: "http://127.0.0.1:11434".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            deepseek_base_url: "https://api.deepseek.com/v1".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            claude_base_url: "https://api.anthropic.com/v1".to_string(),
            openai_api_key: None,
            deepseek_api_key: None,
            gemini_api_key: None,
            claude_api_key: None,
        }
    }
}

/// Knobs that govern the indexing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Character window for file-content chunks.
    pub file_chunk_size_chars: usize,
    /// Characters shared by consecutive file-content chunks.
    pub file_chunk_overlap_chars: usize,
    /// Character window for diff chunks.
    pub diff_chunk_size_chars: usize,
    pub diff_chunk_overlap_chars: usize,
    /// Newest-first cap on commits pulled into the index.
    pub commit_history_max_count: usize,
    /// Points per upsert request.
    pub batch_upsert_size: usize,
    /// Context lines rendered into per-file unified diffs.
    pub diff_lines_of_context: u32,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            file_chunk_size_chars: 1_000,
            file_chunk_overlap_chars: 200,
            diff_chunk_size_chars: 1_000,
            diff_chunk_overlap_chars: 100,
            commit_history_max_count: 50,
            batch_upsert_size: 64,
            diff_lines_of_context: 3,
        }
    }
}

/// Knobs that govern retrieval and the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_refinement_iterations: usize,
    pub search_limit_default: usize,
    pub agent_default_max_steps: usize,
    pub agent_absolute_max_steps: usize,
    /// Seconds allowed per agent reasoning / final-response generation call.
    pub agent_query_timeout_secs: u64,
    /// Seconds allowed per dispatched tool call inside the agent loop.
    pub agent_tool_timeout_secs: u64,
    /// Above this many chars a snippet is summarized (model) or truncated (no model).
    pub max_snippet_length_no_summary: usize,
    /// Max files folded into suggestion context when no summarizer is available.
    pub max_files_for_suggestion_context: usize,
    /// Hard cap on the repository diff text handed to context tools.
    pub max_diff_length_for_context: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_refinement_iterations: 3,
            search_limit_default: 10,
            agent_default_max_steps: 5,
            agent_absolute_max_steps: 10,
            agent_query_timeout_secs: 60,
            agent_tool_timeout_secs: 90,
            max_snippet_length_no_summary: 1_500,
            max_files_for_suggestion_context: 5,
            max_diff_length_for_context: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Utility HTTP port. 0 binds an OS-assigned port.
    pub http_port: u16,
    /// Qdrant base URL, e.g. `http://127.0.0.1:6333`.
    pub qdrant_host: String,
    pub collection_name: String,
    /// Vector size the collection is created with and verified against.
    pub embedding_dimension: usize,
    pub embedding_provider: Provider,
    pub embedding_model: String,
    pub suggestion_provider: Provider,
    pub suggestion_model: String,
    pub hosts: ProviderHosts,
    pub indexing: IndexingConfig,
    pub query: QueryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3_122,
            qdrant_host: "http://127.0.0.1:6333".to_string(),
            collection_name: "codecompass".to_string(),
            embedding_dimension: 768,
            embedding_provider: Provider::Ollama,
            embedding_model: "nomic-embed-text:v1.5".to_string(),
            suggestion_provider: Provider::Ollama,
            suggestion_model: "llama3.1:8b".to_string(),
            hosts: ProviderHosts::default(),
            indexing: IndexingConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl Config {
    /// Overlay environment variables onto `self`. Unparseable numeric values
    /// are reported as errors rather than silently ignored — a bad
    /// `HTTP_PORT` must abort startup, not fall back.
    pub fn apply_env(&mut self) -> Result<(), String> {
        fn set_usize(slot: &mut usize, var: &str) -> Result<(), String> {
            if let Ok(raw) = std::env::var(var) {
                *slot = raw
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("{var} must be a non-negative integer, got '{raw}'"))?;
            }
            Ok(())
        }
        fn set_u64(slot: &mut u64, var: &str) -> Result<(), String> {
            if let Ok(raw) = std::env::var(var) {
                *slot = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("{var} must be a non-negative integer, got '{raw}'"))?;
            }
            Ok(())
        }
        fn set_string(slot: &mut String, var: &str) {
            if let Ok(raw) = std::env::var(var) {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    *slot = trimmed.to_string();
                }
            }
        }
        fn set_opt_string(slot: &mut Option<String>, var: &str) {
            if let Ok(raw) = std::env::var(var) {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    *slot = Some(trimmed.to_string());
                }
            }
        }

        if let Ok(raw) = std::env::var("HTTP_PORT") {
            self.http_port = raw
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("HTTP_PORT must be 0..=65535, got '{raw}'"))?;
        }
        set_string(&mut self.qdrant_host, "QDRANT_HOST");
        set_string(&mut self.collection_name, "COLLECTION_NAME");
        set_usize(&mut self.embedding_dimension, "EMBEDDING_DIMENSION")?;
        set_string(&mut self.embedding_model, "EMBEDDING_MODEL");
        set_string(&mut self.suggestion_model, "SUGGESTION_MODEL");

        if let Ok(raw) = std::env::var("EMBEDDING_PROVIDER") {
            self.embedding_provider = Provider::parse(&raw)
                .ok_or_else(|| format!("EMBEDDING_PROVIDER '{raw}' is not a known provider"))?;
        }
        if let Ok(raw) = std::env::var("SUGGESTION_PROVIDER") {
            self.suggestion_provider = Provider::parse(&raw)
                .ok_or_else(|| format!("SUGGESTION_PROVIDER '{raw}' is not a known provider"))?;
        }

        set_string(&mut self.hosts.ollama_host, "OLLAMA_HOST");
        set_string(&mut self.hosts.openai_base_url, "OPENAI_BASE_URL");
        set_string(&mut self.hosts.deepseek_base_url, "DEEPSEEK_BASE_URL");
        set_string(&mut self.hosts.gemini_base_url, "GEMINI_BASE_URL");
        set_string(&mut self.hosts.claude_base_url, "CLAUDE_BASE_URL");
        set_opt_string(&mut self.hosts.openai_api_key, "OPENAI_API_KEY");
        set_opt_string(&mut self.hosts.deepseek_api_key, "DEEPSEEK_API_KEY");
        set_opt_string(&mut self.hosts.gemini_api_key, "GEMINI_API_KEY");
        set_opt_string(&mut self.hosts.claude_api_key, "ANTHROPIC_API_KEY");

        set_usize(
            &mut self.indexing.file_chunk_size_chars,
            "FILE_INDEXING_CHUNK_SIZE_CHARS",
        )?;
        set_usize(
            &mut self.indexing.file_chunk_overlap_chars,
            "FILE_INDEXING_CHUNK_OVERLAP_CHARS",
        )?;
        set_usize(&mut self.indexing.diff_chunk_size_chars, "DIFF_CHUNK_SIZE_CHARS")?;
        set_usize(
            &mut self.indexing.diff_chunk_overlap_chars,
            "DIFF_CHUNK_OVERLAP_CHARS",
        )?;
        set_usize(
            &mut self.indexing.commit_history_max_count,
            "COMMIT_HISTORY_MAX_COUNT_FOR_INDEXING",
        )?;
        set_usize(&mut self.indexing.batch_upsert_size, "QDRANT_BATCH_UPSERT_SIZE")?;
        if let Ok(raw) = std::env::var("DIFF_LINES_OF_CONTEXT") {
            self.indexing.diff_lines_of_context = raw
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("DIFF_LINES_OF_CONTEXT must be an integer, got '{raw}'"))?;
        }

        set_usize(
            &mut self.query.max_refinement_iterations,
            "MAX_REFINEMENT_ITERATIONS",
        )?;
        set_usize(&mut self.query.search_limit_default, "QDRANT_SEARCH_LIMIT_DEFAULT")?;
        set_usize(&mut self.query.agent_default_max_steps, "AGENT_DEFAULT_MAX_STEPS")?;
        set_usize(
            &mut self.query.agent_absolute_max_steps,
            "AGENT_ABSOLUTE_MAX_STEPS",
        )?;
        set_u64(&mut self.query.agent_query_timeout_secs, "AGENT_QUERY_TIMEOUT")?;
        set_usize(
            &mut self.query.max_snippet_length_no_summary,
            "MAX_SNIPPET_LENGTH_FOR_CONTEXT_NO_SUMMARY",
        )?;
        set_usize(
            &mut self.query.max_files_for_suggestion_context,
            "MAX_FILES_FOR_SUGGESTION_CONTEXT_NO_SUMMARY",
        )?;
        set_usize(
            &mut self.query.max_diff_length_for_context,
            "MAX_DIFF_LENGTH_FOR_CONTEXT_TOOL",
        )?;

        Ok(())
    }

    /// Semantic checks that must hold before the server starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding_dimension == 0 {
            return Err("EMBEDDING_DIMENSION must be > 0".to_string());
        }
        if self.indexing.file_chunk_size_chars <= self.indexing.file_chunk_overlap_chars {
            return Err(format!(
                "FILE_INDEXING_CHUNK_SIZE_CHARS ({}) must exceed FILE_INDEXING_CHUNK_OVERLAP_CHARS ({})",
                self.indexing.file_chunk_size_chars, self.indexing.file_chunk_overlap_chars
            ));
        }
        if self.indexing.diff_chunk_size_chars <= self.indexing.diff_chunk_overlap_chars {
            return Err(format!(
                "DIFF_CHUNK_SIZE_CHARS ({}) must exceed DIFF_CHUNK_OVERLAP_CHARS ({})",
                self.indexing.diff_chunk_size_chars, self.indexing.diff_chunk_overlap_chars
            ));
        }
        if self.query.agent_absolute_max_steps < self.query.agent_default_max_steps {
            return Err(format!(
                "AGENT_ABSOLUTE_MAX_STEPS ({}) must be >= AGENT_DEFAULT_MAX_STEPS ({})",
                self.query.agent_absolute_max_steps, self.query.agent_default_max_steps
            ));
        }
        if self.indexing.batch_upsert_size == 0 {
            return Err("QDRANT_BATCH_UPSERT_SIZE must be > 0".to_string());
        }
        if let Some(var) = self.suggestion_provider.api_key_var() {
            if self.api_key_for(self.suggestion_provider).is_none() {
                return Err(format!(
                    "suggestion provider '{}' requires {var} to be set",
                    self.suggestion_provider.as_str()
                ));
            }
        }
        if let Some(var) = self.embedding_provider.api_key_var() {
            if self.api_key_for(self.embedding_provider).is_none() {
                return Err(format!(
                    "embedding provider '{}' requires {var} to be set",
                    self.embedding_provider.as_str()
                ));
            }
        }
        Ok(())
    }

    pub fn api_key_for(&self, provider: Provider) -> Option<String> {
        match provider {
            Provider::Ollama => None,
            Provider::OpenAI => self.hosts.openai_api_key.clone(),
            Provider::DeepSeek => self.hosts.deepseek_api_key.clone(),
            Provider::Gemini => self.hosts.gemini_api_key.clone(),
            Provider::Claude => self.hosts.claude_api_key.clone(),
        }
    }
}

/// Directory holding the optional `codecompass.json` override file.
/// `CODECOMPASS_CONFIG_DIR` wins over the platform config dir.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CODECOMPASS_CONFIG_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("codecompass")
}

/// Build the effective config: defaults, then the JSON override file,
/// then environment variables (highest priority).
pub fn load() -> Result<Config, String> {
    let mut cfg = Config::default();

    let override_path = config_dir().join("codecompass.json");
    if let Ok(text) = std::fs::read_to_string(&override_path) {
        match serde_json::from_str::<Config>(&text) {
            Ok(file_cfg) => cfg = file_cfg,
            Err(e) => {
                return Err(format!(
                    "config override {} is not valid JSON: {e}",
                    override_path.display()
                ))
            }
        }
    }

    cfg.apply_env()?;
    cfg.validate()?;
    Ok(cfg)
}

// ── Global config singleton ──────────────────────────────────────────────
//
// Read-mostly: every accessor clones a snapshot, so readers never hold the
// lock across I/O. The only writer is `switch_suggestion_model`.

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

fn cell() -> &'static RwLock<Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default()))
}

pub fn init(cfg: Config) {
    *cell().write().expect("config lock poisoned") = cfg;
}

/// Snapshot of the current config.
pub fn get() -> Config {
    cell().read().expect("config lock poisoned").clone()
}

/// Point the suggestion capability at a different provider/model.
/// Returns the updated snapshot; the caller is responsible for clearing
/// the provider cache afterwards.
pub fn switch_suggestion(provider: Option<Provider>, model: &str) -> Config {
    let mut guard = cell().write().expect("config lock poisoned");
    if let Some(p) = provider {
        guard.suggestion_provider = p;
    }
    guard.suggestion_model = model.trim().to_string();
    guard.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn chunk_overlap_must_be_smaller_than_size() {
        let mut cfg = Config::default();
        cfg.indexing.file_chunk_size_chars = 100;
        cfg.indexing.file_chunk_overlap_chars = 100;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("FILE_INDEXING_CHUNK_SIZE_CHARS"));
    }

    #[test]
    fn cloud_provider_without_key_is_rejected() {
        let mut cfg = Config::default();
        cfg.suggestion_provider = Provider::OpenAI;
        cfg.hosts.openai_api_key = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("OPENAI_API_KEY"), "got: {err}");
    }

    #[test]
    fn provider_parse_accepts_aliases() {
        assert_eq!(Provider::parse("Anthropic"), Some(Provider::Claude));
        assert_eq!(Provider::parse("OLLAMA"), Some(Provider::Ollama));
        assert_eq!(Provider::parse("mystery"), None);
    }

    #[test]
    fn switch_suggestion_updates_snapshot() {
        // Assert on the returned snapshot only — the global cell is shared
        // with other tests in this binary.
        let updated = switch_suggestion(Some(Provider::DeepSeek), "  deepseek-chat ");
        assert_eq!(updated.suggestion_provider, Provider::DeepSeek);
        assert_eq!(updated.suggestion_model, "deepseek-chat");
    }
}
