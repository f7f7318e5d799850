use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_NUM_WORKERS: usize = 3;
pub const DEFAULT_MAX_EMBED_CHARS: usize = 2000;

pub struct RagConfig {
    pub ollama_url: String,
    pub model: String,
    pub embed_model: String,
    pub store_path: PathBuf,
    pub top_k: usize,
    pub num_workers: usize,
    /// Upper bound, in characters, on the text sent for a single embedding.
    pub max_embed_chars: usize,
    pub request_timeout: Duration,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "llama3:latest".to_string(),
            embed_model: "llama3:latest".to_string(),
            store_path: default_store_path(),
            top_k: DEFAULT_TOP_K,
            num_workers: DEFAULT_NUM_WORKERS,
            max_embed_chars: DEFAULT_MAX_EMBED_CHARS,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl RagConfig {
    /// Defaults overlaid with any `DOCRAG_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = env::var("DOCRAG_OLLAMA_URL") {
            config.ollama_url = url;
        }
        if let Ok(model) = env::var("DOCRAG_MODEL") {
            config.model = model;
        }
        if let Ok(model) = env::var("DOCRAG_EMBED_MODEL") {
            config.embed_model = model;
        }
        if let Ok(path) = env::var("DOCRAG_STORE") {
            config.store_path = PathBuf::from(path);
        }
        if let Some(top_k) = parse_var("DOCRAG_TOP_K")? {
            config.top_k = top_k;
        }
        if let Some(workers) = parse_var("DOCRAG_WORKERS")? {
            config.num_workers = workers;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be at least 1".into()));
        }
        if self.max_embed_chars == 0 {
            return Err(Error::Config("max_embed_chars must be at least 1".into()));
        }
        if self.ollama_url.trim().is_empty() {
            return Err(Error::Config("ollama url is empty".into()));
        }
        Ok(())
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("docrag").join("documents.json"))
        .unwrap_or_else(|| PathBuf::from("data/documents.json"))
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}
