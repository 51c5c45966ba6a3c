//! Compute Engine directory access.
//!
//! [`ComputeApi`] is the narrow, project-scoped view of the directory that the
//! resolver and the IP lookup need: paginated aggregated listings plus a few
//! point lookups. [`GcpClient`] implements it over REST; tests use an in-memory
//! fake.

use super::client::{short_name, with_page_token, GcpClient};
use super::http::ApiError;
use super::pager::Page;
use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Placement of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum Scope {
    Zone(String),
    Region(String),
    Global,
}

impl Scope {
    /// Parse the key of an aggregated listing: `zones/x`, `regions/x` or `global`
    pub fn from_aggregated_key(key: &str) -> Option<Self> {
        if key == "global" {
            return Some(Self::Global);
        }
        match key.split_once('/') {
            Some(("zones", zone)) => Some(Self::Zone(zone.to_string())),
            Some(("regions", region)) => Some(Self::Region(region.to_string())),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Zone(name) | Self::Region(name) => name,
            Self::Global => "global",
        }
    }

    /// Region containing this scope; `None` for global resources
    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Zone(zone) => Some(super::client::region_of_zone(zone)),
            Self::Region(region) => Some(region),
            Self::Global => None,
        }
    }

    pub fn is_regional(&self) -> bool {
        matches!(self, Self::Region(_))
    }

    /// URL path segment: `zones/x`, `regions/x` or `global`
    fn path(&self) -> String {
        match self {
            Self::Zone(zone) => format!("zones/{}", zone),
            Self::Region(region) => format!("regions/{}", region),
            Self::Global => "global".to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An item of an aggregated listing together with the partition it came from
#[derive(Debug, Clone)]
pub struct Scoped<T> {
    pub scope: Scope,
    pub item: T,
}

// ── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "selfLink")]
    pub self_link: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "networkInterfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub subnetwork: String,
    #[serde(default, rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(default, rename = "ipv6Address")]
    pub ipv6_address: Option<String>,
    #[serde(default, rename = "accessConfigs")]
    pub access_configs: Vec<AccessConfig>,
    #[serde(default, rename = "ipv6AccessConfigs")]
    pub ipv6_access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "natIP")]
    pub nat_ip: Option<String>,
    #[serde(default, rename = "externalIpv6")]
    pub external_ipv6: Option<String>,
    #[serde(default, rename = "networkTier")]
    pub network_tier: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceGroupManager {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default, rename = "targetSize")]
    pub target_size: Option<i64>,
    #[serde(default, rename = "selfLink")]
    pub self_link: String,
}

/// One member instance of a managed instance group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedInstanceRef {
    pub name: String,
    pub zone: String,
    pub status: String,
}

impl ManagedInstanceRef {
    pub fn is_running(&self) -> bool {
        self.status == "RUNNING"
    }
}

#[derive(Debug, Deserialize)]
struct RawManagedInstance {
    #[serde(default)]
    instance: String,
    #[serde(default, rename = "instanceStatus")]
    instance_status: Option<String>,
}

impl From<RawManagedInstance> for ManagedInstanceRef {
    fn from(raw: RawManagedInstance) -> Self {
        // instance is a URL: .../projects/p/zones/<zone>/instances/<name>
        let zone = raw
            .instance
            .split('/')
            .skip_while(|s| *s != "zones")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        Self {
            name: short_name(&raw.instance).to_string(),
            zone,
            status: raw.instance_status.unwrap_or_else(|| "UNKNOWN".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardingRule {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "IPAddress")]
    pub ip_address: Option<String>,
    #[serde(default, rename = "IPProtocol")]
    pub ip_protocol: Option<String>,
    #[serde(default, rename = "loadBalancingScheme")]
    pub load_balancing_scheme: Option<String>,
    #[serde(default, rename = "portRange")]
    pub port_range: Option<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default, rename = "backendService")]
    pub backend_service: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default, rename = "selfLink")]
    pub self_link: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "addressType")]
    pub address_type: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub subnetwork: Option<String>,
    #[serde(default, rename = "selfLink")]
    pub self_link: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecondaryRange {
    #[serde(default, rename = "rangeName")]
    pub range_name: String,
    #[serde(default, rename = "ipCidrRange")]
    pub ip_cidr_range: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subnetwork {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, rename = "ipCidrRange")]
    pub ip_cidr_range: String,
    #[serde(default, rename = "secondaryIpRanges")]
    pub secondary_ip_ranges: Vec<SecondaryRange>,
    #[serde(default, rename = "ipv6CidrRange")]
    pub ipv6_cidr_range: Option<String>,
    #[serde(default, rename = "gatewayAddress")]
    pub gateway_address: Option<String>,
    #[serde(default, rename = "selfLink")]
    pub self_link: String,
}

// ── Directory interface ─────────────────────────────────────────────────

/// Project-scoped Compute Engine directory
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Project every call is issued against
    fn project(&self) -> &str;

    async fn aggregated_instances(&self, page_token: Option<String>)
        -> ApiResult<Page<Scoped<Instance>>>;

    async fn get_instance(&self, zone: &str, name: &str) -> ApiResult<Instance>;

    async fn aggregated_instance_group_managers(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<InstanceGroupManager>>>;

    async fn get_instance_group_manager(
        &self,
        scope: &Scope,
        name: &str,
    ) -> ApiResult<InstanceGroupManager>;

    async fn list_managed_instances(
        &self,
        scope: &Scope,
        name: &str,
        page_token: Option<String>,
    ) -> ApiResult<Page<ManagedInstanceRef>>;

    /// Zone names of the project
    async fn list_zones(&self, page_token: Option<String>) -> ApiResult<Page<String>>;

    async fn aggregated_forwarding_rules(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<ForwardingRule>>>;

    async fn aggregated_addresses(&self, page_token: Option<String>)
        -> ApiResult<Page<Scoped<Address>>>;

    async fn aggregated_subnetworks(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<Subnetwork>>>;
}

fn next_token(response: &Value) -> Option<String> {
    response
        .get("nextPageToken")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Parse a plain list response whose items live under `field`
pub fn parse_list<T: DeserializeOwned>(response: Value, field: &str) -> ApiResult<Page<T>> {
    let next_page_token = next_token(&response);
    let items = match response.get(field) {
        Some(items) => serde_json::from_value(items.clone())
            .with_context(|| format!("Failed to decode '{}' list", field))?,
        None => Vec::new(),
    };
    Ok(Page {
        items,
        next_page_token,
    })
}

/// Flatten an aggregated response: `items` maps `zones/x` / `regions/x` / `global`
/// to an object holding the list under `field` (or only a warning when empty)
pub fn parse_aggregated<T: DeserializeOwned>(
    response: Value,
    field: &str,
) -> ApiResult<Page<Scoped<T>>> {
    let next_page_token = next_token(&response);
    let mut items = Vec::new();

    if let Some(partitions) = response.get("items").and_then(|v| v.as_object()) {
        for (key, partition) in partitions {
            let Some(list) = partition.get(field) else {
                continue;
            };
            let Some(scope) = Scope::from_aggregated_key(key) else {
                tracing::debug!("Skipping unknown aggregated key {}", key);
                continue;
            };
            let decoded: Vec<T> = serde_json::from_value(list.clone())
                .with_context(|| format!("Failed to decode '{}' in {}", field, key))?;
            items.extend(decoded.into_iter().map(|item| Scoped {
                scope: scope.clone(),
                item,
            }));
        }
    }

    Ok(Page {
        items,
        next_page_token,
    })
}

fn decode<T: DeserializeOwned>(response: Value) -> ApiResult<T> {
    Ok(serde_json::from_value(response).context("Failed to decode resource")?)
}

#[async_trait]
impl ComputeApi for GcpClient {
    fn project(&self) -> &str {
        &self.project_id
    }

    async fn aggregated_instances(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<Instance>>> {
        let url = with_page_token(
            &self.compute_aggregated_url("instances"),
            page_token.as_deref(),
        );
        parse_aggregated(self.get(&url).await?, "instances")
    }

    async fn get_instance(&self, zone: &str, name: &str) -> ApiResult<Instance> {
        let url = self.compute_zonal_url(zone, &format!("instances/{}", name));
        decode(self.get(&url).await?)
    }

    async fn aggregated_instance_group_managers(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<InstanceGroupManager>>> {
        let url = with_page_token(
            &self.compute_aggregated_url("instanceGroupManagers"),
            page_token.as_deref(),
        );
        parse_aggregated(self.get(&url).await?, "instanceGroupManagers")
    }

    async fn get_instance_group_manager(
        &self,
        scope: &Scope,
        name: &str,
    ) -> ApiResult<InstanceGroupManager> {
        let url = self.compute_url(&format!("{}/instanceGroupManagers/{}", scope.path(), name));
        decode(self.get(&url).await?)
    }

    async fn list_managed_instances(
        &self,
        scope: &Scope,
        name: &str,
        page_token: Option<String>,
    ) -> ApiResult<Page<ManagedInstanceRef>> {
        let url = self.compute_url(&format!(
            "{}/instanceGroupManagers/{}/listManagedInstances",
            scope.path(),
            name
        ));
        let url = with_page_token(&url, page_token.as_deref());
        let page: Page<RawManagedInstance> = parse_list(self.post(&url, None).await?, "managedInstances")?;
        Ok(Page {
            items: page.items.into_iter().map(ManagedInstanceRef::from).collect(),
            next_page_token: page.next_page_token,
        })
    }

    async fn list_zones(&self, page_token: Option<String>) -> ApiResult<Page<String>> {
        #[derive(Deserialize)]
        struct Zone {
            name: String,
        }

        let url = with_page_token(&self.compute_url("zones"), page_token.as_deref());
        let page: Page<Zone> = parse_list(self.get(&url).await?, "items")?;
        Ok(Page {
            items: page.items.into_iter().map(|z| z.name).collect(),
            next_page_token: page.next_page_token,
        })
    }

    async fn aggregated_forwarding_rules(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<ForwardingRule>>> {
        let url = with_page_token(
            &self.compute_aggregated_url("forwardingRules"),
            page_token.as_deref(),
        );
        parse_aggregated(self.get(&url).await?, "forwardingRules")
    }

    async fn aggregated_addresses(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<Address>>> {
        let url = with_page_token(
            &self.compute_aggregated_url("addresses"),
            page_token.as_deref(),
        );
        parse_aggregated(self.get(&url).await?, "addresses")
    }

    async fn aggregated_subnetworks(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<Subnetwork>>> {
        let url = with_page_token(
            &self.compute_aggregated_url("subnetworks"),
            page_token.as_deref(),
        );
        parse_aggregated(self.get(&url).await?, "subnetworks")
    }
}
