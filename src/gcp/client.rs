//! GCP Client
//!
//! Project-scoped client combining credentials, HTTP and endpoint URLs.

use super::auth::GcpCredentials;
use super::http::{ApiError, GcpHttpClient};
use anyhow::{Context, Result};
use serde_json::Value;

/// Base URLs of the REST services we talk to
#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    pub compute: String,
    pub storage: String,
    pub container: String,
    pub secretmanager: String,
    pub resourcemanager: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            compute: "https://compute.googleapis.com/compute/v1".to_string(),
            storage: "https://storage.googleapis.com/storage/v1".to_string(),
            container: "https://container.googleapis.com/v1".to_string(),
            secretmanager: "https://secretmanager.googleapis.com/v1".to_string(),
            resourcemanager: "https://cloudresourcemanager.googleapis.com/v1".to_string(),
        }
    }
}

impl ApiEndpoints {
    /// Route every service to one host, keeping the real path prefixes
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            compute: format!("{}/compute/v1", base),
            storage: format!("{}/storage/v1", base),
            container: format!("{}/container/v1", base),
            secretmanager: format!("{}/secretmanager/v1", base),
            resourcemanager: format!("{}/resourcemanager/v1", base),
        }
    }
}

/// Main GCP client, bound to one project
#[derive(Clone)]
pub struct GcpClient {
    pub credentials: GcpCredentials,
    pub http: GcpHttpClient,
    pub endpoints: ApiEndpoints,
    pub project_id: String,
}

impl GcpClient {
    /// Create a client using Application Default Credentials
    pub async fn new(project_id: &str) -> Result<Self> {
        let credentials = GcpCredentials::new()
            .await
            .context("Failed to initialize GCP credentials")?;
        Self::with_credentials(project_id, credentials, ApiEndpoints::default())
    }

    pub fn with_credentials(
        project_id: &str,
        credentials: GcpCredentials,
        endpoints: ApiEndpoints,
    ) -> Result<Self> {
        Ok(Self {
            credentials,
            http: GcpHttpClient::new()?,
            endpoints,
            project_id: project_id.to_string(),
        })
    }

    /// Same credentials and connection pool, different project
    pub fn for_project(&self, project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..self.clone()
        }
    }

    /// Make a GET request to a GCP API
    pub async fn get(&self, url: &str) -> Result<Value, ApiError> {
        let token = self.credentials.get_token().await?;
        self.http.get(url, &token).await
    }

    /// Make a POST request to a GCP API
    pub async fn post(&self, url: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let token = self.credentials.get_token().await?;
        self.http.post(url, &token, body).await
    }

    // =========================================================================
    // Compute Engine API helpers
    // =========================================================================

    /// Build Compute Engine API URL
    pub fn compute_url(&self, path: &str) -> String {
        format!(
            "{}/projects/{}/{}",
            self.endpoints.compute, self.project_id, path
        )
    }

    /// Build zonal Compute Engine API URL
    pub fn compute_zonal_url(&self, zone: &str, resource: &str) -> String {
        self.compute_url(&format!("zones/{}/{}", zone, resource))
    }

    /// Build regional Compute Engine API URL
    pub fn compute_regional_url(&self, region: &str, resource: &str) -> String {
        self.compute_url(&format!("regions/{}/{}", region, resource))
    }

    /// Build global Compute Engine API URL
    pub fn compute_global_url(&self, resource: &str) -> String {
        self.compute_url(&format!("global/{}", resource))
    }

    /// Build aggregated Compute Engine API URL (all zones and regions)
    pub fn compute_aggregated_url(&self, resource: &str) -> String {
        self.compute_url(&format!("aggregated/{}", resource))
    }

    // =========================================================================
    // Other services
    // =========================================================================

    /// Bucket listing for the current project
    pub fn storage_buckets_url(&self) -> String {
        format!(
            "{}/b?project={}",
            self.endpoints.storage,
            urlencoding::encode(&self.project_id)
        )
    }

    /// GKE location URL; `-` means all locations
    pub fn container_location_url(&self, location: &str, resource: &str) -> String {
        format!(
            "{}/projects/{}/locations/{}/{}",
            self.endpoints.container, self.project_id, location, resource
        )
    }

    pub fn secrets_url(&self) -> String {
        format!(
            "{}/projects/{}/secrets",
            self.endpoints.secretmanager, self.project_id
        )
    }

    pub fn resourcemanager_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoints.resourcemanager, path)
    }
}

/// Append `pageToken` to a URL that may already carry a query string
pub fn with_page_token(url: &str, page_token: Option<&str>) -> String {
    match page_token {
        Some(token) => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{}{}pageToken={}", url, sep, urlencoding::encode(token))
        }
        None => url.to_string(),
    }
}

/// Region of a zone name: `us-central1-a` -> `us-central1`
pub fn region_of_zone(zone: &str) -> &str {
    match zone.rsplit_once('-') {
        Some((region, _)) => region,
        None => zone,
    }
}

/// Last path segment of a resource URL
/// e.g. ".../projects/p/zones/us-central1-a" -> "us-central1-a"
pub fn short_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
