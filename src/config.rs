//! runtime configuration, read from an optional json file plus env overrides
use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::cache::{CacheKind, CacheRegistry};

pub const CACHE_ROOT_ENV: &str = "MEMO_CACHE_ROOT";
pub const LOG_LEVEL_ENV: &str = "MEMO_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_root: PathBuf,
    pub chat_cache_name: String,
    pub chat_cache_kind: CacheKind,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_root: PathBuf::from(".memo/cache"),
            chat_cache_name: crate::cache::chat::DEFAULT_CHAT_CACHE_NAME.to_string(),
            chat_cache_kind: crate::cache::chat::DEFAULT_CHAT_CACHE_KIND,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// read the file when given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Config::parse(&text)?
            }
            None => Config::default(),
        };

        Ok(config.with_overrides(
            std::env::var(CACHE_ROOT_ENV).ok(),
            std::env::var(LOG_LEVEL_ENV).ok(),
        ))
    }

    pub fn parse(text: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(text).context("parsing config json")?;
        config.level_filter()?;
        Ok(config)
    }

    fn with_overrides(mut self, cache_root: Option<String>, log_level: Option<String>) -> Config {
        if let Some(root) = cache_root.filter(|s| !s.is_empty()) {
            self.cache_root = PathBuf::from(root);
        }
        if let Some(level) = log_level.filter(|s| LevelFilter::from_str(s).is_ok()) {
            self.log_level = level;
        }

        self
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| anyhow!("unknown log level: {}", self.log_level))
    }

    pub fn registry(&self) -> CacheRegistry {
        CacheRegistry::new(&self.cache_root)
    }
}
