//! GCP Authentication
//!
//! Access tokens come from Application Default Credentials (ADC). A fixed
//! token can be supplied instead, which is what the HTTP integration tests use.

use anyhow::{Context, Result};
use gcp_auth::TokenProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Read-only scope is enough for every listing this tool performs
pub const DEFAULT_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform.read-only"];

/// Refresh tokens this much before they actually expire
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Conservative TTL when the provider does not tell us
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Environment variables consulted for the default project, in order
const PROJECT_ENV_VARS: &[&str] = &["CLOUDSDK_CORE_PROJECT", "GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"];

#[derive(Clone)]
enum TokenSource {
    Adc {
        provider: Arc<dyn TokenProvider>,
        cache: Arc<RwLock<Option<CachedToken>>>,
    },
    Static(String),
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// GCP credentials holder with token caching
#[derive(Clone)]
pub struct GcpCredentials {
    source: TokenSource,
}

impl GcpCredentials {
    /// Create credentials from Application Default Credentials
    pub async fn new() -> Result<Self> {
        let provider = gcp_auth::provider().await.context(
            "Failed to initialize GCP authentication. Run 'gcloud auth application-default login'",
        )?;

        Ok(Self {
            source: TokenSource::Adc {
                provider,
                cache: Arc::new(RwLock::new(None)),
            },
        })
    }

    /// Credentials that always hand out the same bearer token
    pub fn with_static_token(token: &str) -> Self {
        Self {
            source: TokenSource::Static(token.to_string()),
        }
    }

    /// Get an access token for API calls, reusing a cached one while it is valid
    pub async fn get_token(&self) -> Result<String> {
        let (provider, cache) = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Adc { provider, cache } => (provider, cache),
        };

        if let Some(cached) = cache.read().await.as_ref() {
            if cached.is_valid() {
                return Ok(cached.token.clone());
            }
            tracing::debug!("Cached token expired, fetching new token");
        }

        let token = provider
            .token(DEFAULT_SCOPES)
            .await
            .context("Failed to get access token")?;
        let token_str = token.as_str().to_string();

        *cache.write().await = Some(CachedToken {
            token: token_str.clone(),
            expires_at: Instant::now() + DEFAULT_TOKEN_TTL - TOKEN_EXPIRY_BUFFER,
        });

        Ok(token_str)
    }
}

/// Get the gcloud configuration directory
pub fn get_gcloud_config_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CLOUDSDK_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|p| p.join("gcloud"))
}

/// Validate a GCP project ID format
/// Project IDs are 6-30 characters of lowercase letters, digits and hyphens,
/// start with a letter and do not end with a hyphen
pub fn validate_project_id(project: &str) -> bool {
    if project.len() < 6 || project.len() > 30 {
        return false;
    }
    if !project.starts_with(|c: char| c.is_ascii_lowercase()) || project.ends_with('-') {
        return false;
    }
    project
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Read `key` from `[section]` of a gcloud ini file.
/// `section = None` accepts the key anywhere in the file.
fn read_ini_value(content: &str, section: Option<&str>, key: &str) -> Option<String> {
    let mut in_section = section.is_none();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_section = section.map_or(true, |s| line == format!("[{}]", s));
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

fn project_from_file(path: &Path, section: Option<&str>) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    read_ini_value(&content, section, "project").filter(|p| validate_project_id(p))
}

/// Resolve the default project from the environment or gcloud configuration
pub fn get_default_project() -> Option<String> {
    for var in PROJECT_ENV_VARS {
        if let Ok(project) = std::env::var(var) {
            if validate_project_id(&project) {
                return Some(project);
            }
            tracing::warn!("Invalid project ID format in {}", var);
        }
    }

    let config_dir = get_gcloud_config_dir()?;

    if let Some(project) = project_from_file(&config_dir.join("properties"), None) {
        return Some(project);
    }

    let active = std::fs::read_to_string(config_dir.join("active_config")).ok()?;
    let config_name = active.trim();

    // Config names end up in a path
    if !config_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        tracing::warn!("Invalid characters in active_config name");
        return None;
    }

    let config_path = config_dir
        .join("configurations")
        .join(format!("config_{}", config_name));
    project_from_file(&config_path, Some("core"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_project_id() {
        assert!(validate_project_id("my-project-123"));
        assert!(!validate_project_id("short"));
        assert!(!validate_project_id("1-starts-with-digit"));
        assert!(!validate_project_id("ends-with-hyphen-"));
        assert!(!validate_project_id("Upper-Case-Project"));
    }

    #[test]
    fn test_read_ini_value_respects_section() {
        let content = "[compute]\nproject = wrong-project\n\n[core]\n# comment\nproject = right-project\n";
        assert_eq!(
            read_ini_value(content, Some("core"), "project").as_deref(),
            Some("right-project")
        );
        assert_eq!(read_ini_value(content, Some("auth"), "project"), None);
    }

    #[tokio::test]
    async fn test_static_token() {
        let creds = GcpCredentials::with_static_token("abc");
        assert_eq!(creds.get_token().await.unwrap(), "abc");
    }
}
