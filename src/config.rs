use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Upload path: contiguous non-overlapping slices of this many chars.
    #[serde(default = "default_upload_max_chars")]
    pub upload_max_chars: usize,
    /// Offline knowledge-base path: smaller chunks with overlap.
    #[serde(default = "default_kb_max_chars")]
    pub kb_max_chars: usize,
    #[serde(default = "default_kb_overlap_chars")]
    pub kb_overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            upload_max_chars: default_upload_max_chars(),
            kb_max_chars: default_kb_max_chars(),
            kb_overlap_chars: default_kb_overlap_chars(),
        }
    }
}

fn default_upload_max_chars() -> usize {
    8000
}
fn default_kb_max_chars() -> usize {
    2000
}
fn default_kb_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_general_top_k")]
    pub general_top_k: usize,
    #[serde(default = "default_conversation_top_k")]
    pub conversation_top_k: usize,
    /// Default K for the standalone document-search endpoint.
    #[serde(default = "default_search_top_k")]
    pub search_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            general_top_k: default_general_top_k(),
            conversation_top_k: default_conversation_top_k(),
            search_top_k: default_search_top_k(),
        }
    }
}

fn default_general_top_k() -> usize {
    3
}
fn default_conversation_top_k() -> usize {
    3
}
fn default_search_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent in-flight embedding batches during ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            base_url: default_base_url(),
            batch_size: 64,
            concurrency: 2,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    2
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Prior turns included in the completion request.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Max idle time between streamed fragments before the turn fails.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: default_completion_model(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            history_limit: default_history_limit(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer from the provided context when it is \
     relevant, and say so when it is not."
        .to_string()
}
fn default_history_limit() -> usize {
    20
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_read_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Include upstream error detail in responses and stream events.
    #[serde(default)]
    pub verbose_errors: bool,
    /// Persist partially streamed assistant text when a mid-stream error occurs.
    #[serde(default)]
    pub persist_partial_on_error: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_bytes() -> usize {
    20 * 1024 * 1024
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.upload_max_chars == 0 {
        anyhow::bail!("chunking.upload_max_chars must be > 0");
    }
    if config.chunking.kb_max_chars == 0 {
        anyhow::bail!("chunking.kb_max_chars must be > 0");
    }
    if config.chunking.kb_overlap_chars >= config.chunking.kb_max_chars {
        anyhow::bail!("chunking.kb_overlap_chars must be < chunking.kb_max_chars");
    }

    // Validate retrieval
    if config.retrieval.general_top_k == 0 || config.retrieval.conversation_top_k == 0 {
        anyhow::bail!("retrieval top-K values must be >= 1");
    }
    if config.retrieval.search_top_k == 0 {
        anyhow::bail!("retrieval.search_top_k must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.concurrency == 0 {
            anyhow::bail!("embedding.concurrency must be >= 1");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.upload.max_bytes == 0 {
        anyhow::bail!("upload.max_bytes must be > 0");
    }

    Ok(config)
}
