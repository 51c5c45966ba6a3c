//! Configuration Management
//!
//! Persistent settings for gcpfind, stored as JSON under the user config dir.

use crate::gcp::auth::{get_default_project, validate_project_id};
use crate::iplookup::IpLookupMode;
use crate::resolve::DEFAULT_PROBE_CONCURRENCY;
use crate::search::DEFAULT_SEARCH_CONCURRENCY;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_probe_concurrency() -> usize {
    DEFAULT_PROBE_CONCURRENCY
}

fn default_search_concurrency() -> usize {
    DEFAULT_SEARCH_CONCURRENCY
}

/// User configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Project used when `--project` is not given
    #[serde(default)]
    pub project_id: Option<String>,
    /// Projects searched when `search` gets no `--projects`
    #[serde(default)]
    pub search_projects: Vec<String>,
    /// Regions probed at once when looking for a regional MIG
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    /// Projects searched at once
    #[serde(default = "default_search_concurrency")]
    pub search_concurrency: usize,
    #[serde(default)]
    pub ip_mode: IpLookupMode,
    /// Location cache file; defaults to the user cache dir
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// Never read or write the location cache
    #[serde(default)]
    pub no_cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: None,
            search_projects: Vec::new(),
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
            search_concurrency: DEFAULT_SEARCH_CONCURRENCY,
            ip_mode: IpLookupMode::default(),
            cache_path: None,
            no_cache: false,
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gcpfind").join("config.json"))
    }

    /// Load configuration from disk; any problem yields the defaults
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid config {:?}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::config_path() else {
            return Ok(());
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

        Ok(())
    }

    /// Get effective project (CLI > config > gcloud default)
    pub fn effective_project(&self, cli: Option<&str>) -> Option<String> {
        cli.map(str::to_string)
            .or_else(|| self.project_id.clone())
            .or_else(get_default_project)
            .map(|p| p.trim().to_string())
            .filter(|p| validate_project_id(p))
    }

    /// Projects to search: explicit list, else the configured list, else `fallback`
    pub fn effective_search_projects(&self, cli: &[String], fallback: Option<&str>) -> Vec<String> {
        if !cli.is_empty() {
            return cli.to_vec();
        }
        if !self.search_projects.is_empty() {
            return self.search_projects.clone();
        }
        fallback.map(|p| vec![p.to_string()]).unwrap_or_default()
    }

    /// Cache file to use, or `None` when caching is off
    pub fn effective_cache_path(&self, no_cache_flag: bool) -> Option<PathBuf> {
        if no_cache_flag || self.no_cache {
            return None;
        }
        self.cache_path
            .clone()
            .or_else(crate::cache::FileCache::default_path)
    }
}
