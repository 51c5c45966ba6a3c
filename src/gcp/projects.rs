//! GCP Projects
//!
//! Listing of the projects the caller can see, used to fan a search out over
//! every accessible project.

use super::client::{with_page_token, GcpClient};
use super::compute::parse_list;
use super::pager::{collect_pages, ScanLabel};
use crate::error::Result;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Project information
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "lifecycleState")]
    pub lifecycle_state: String,
}

impl Project {
    pub fn is_active(&self) -> bool {
        self.lifecycle_state == "ACTIVE"
    }
}

/// List the IDs of all active projects visible to the credentials
pub async fn list_project_ids(client: &GcpClient, cancel: &CancellationToken) -> Result<Vec<String>> {
    let base = client.resourcemanager_url("projects");
    let projects: Vec<Project> = collect_pages(
        ScanLabel {
            op: "list projects",
            scope: "organization",
        },
        cancel,
        |token| {
            let url = with_page_token(&base, token.as_deref());
            async move { parse_list(client.get(&url).await?, "projects") }
        },
    )
    .await?;

    Ok(projects
        .into_iter()
        .filter(Project::is_active)
        .map(|p| p.project_id)
        .collect())
}
