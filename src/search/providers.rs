//! REST-backed search providers.
//!
//! Every provider is one row of [`PROVIDERS`]: where the listing lives, which
//! JSON fields the term is matched against, and which fields end up in the
//! result's detail map. Field paths are dotted and fan out over arrays, so
//! `networkInterfaces.accessConfigs.natIP` yields every NAT IP of an instance.

use super::{Provider, SearchQuery, SearchResult};
use crate::gcp::client::{short_name, with_page_token, GcpClient};
use crate::gcp::compute::{parse_aggregated, parse_list, Scope};
use crate::gcp::pager::{collect_pages, ScanLabel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where a kind is listed
#[derive(Debug, Clone, Copy)]
pub enum Listing {
    /// `compute/aggregated/{resource}`, items under `field` per zone/region
    Aggregated {
        resource: &'static str,
        field: &'static str,
    },
    /// `compute/global/{resource}`
    Global(&'static str),
    Buckets,
    Clusters,
    Secrets,
}

#[derive(Debug)]
pub struct ProviderDef {
    pub kind: &'static str,
    pub listing: Listing,
    /// Field paths the search term is matched against
    pub match_fields: &'static [&'static str],
    /// (detail key, field path)
    pub detail_fields: &'static [(&'static str, &'static str)],
}

pub static PROVIDERS: &[ProviderDef] = &[
    ProviderDef {
        kind: "instances",
        listing: Listing::Aggregated {
            resource: "instances",
            field: "instances",
        },
        match_fields: &[
            "name",
            "description",
            "networkInterfaces.networkIP",
            "networkInterfaces.accessConfigs.natIP",
        ],
        detail_fields: &[
            ("status", "status"),
            ("machine_type", "machineType"),
            ("internal_ip", "networkInterfaces.networkIP"),
            ("external_ip", "networkInterfaces.accessConfigs.natIP"),
        ],
    },
    ProviderDef {
        kind: "disks",
        listing: Listing::Aggregated {
            resource: "disks",
            field: "disks",
        },
        match_fields: &["name", "description"],
        detail_fields: &[
            ("size_gb", "sizeGb"),
            ("type", "type"),
            ("status", "status"),
            ("users", "users"),
        ],
    },
    ProviderDef {
        kind: "networks",
        listing: Listing::Global("networks"),
        match_fields: &["name", "description"],
        detail_fields: &[
            ("auto_subnets", "autoCreateSubnetworks"),
            ("routing_mode", "routingConfig.routingMode"),
        ],
    },
    ProviderDef {
        kind: "subnets",
        listing: Listing::Aggregated {
            resource: "subnetworks",
            field: "subnetworks",
        },
        match_fields: &["name", "ipCidrRange", "secondaryIpRanges.ipCidrRange", "network"],
        detail_fields: &[
            ("network", "network"),
            ("cidr", "ipCidrRange"),
            ("gateway", "gatewayAddress"),
        ],
    },
    ProviderDef {
        kind: "firewalls",
        listing: Listing::Global("firewalls"),
        match_fields: &["name", "description", "network", "sourceRanges"],
        detail_fields: &[
            ("network", "network"),
            ("direction", "direction"),
            ("priority", "priority"),
            ("source_ranges", "sourceRanges"),
        ],
    },
    ProviderDef {
        kind: "forwarding-rules",
        listing: Listing::Aggregated {
            resource: "forwardingRules",
            field: "forwardingRules",
        },
        match_fields: &["name", "description", "IPAddress"],
        detail_fields: &[
            ("ip", "IPAddress"),
            ("protocol", "IPProtocol"),
            ("scheme", "loadBalancingScheme"),
            ("target", "target"),
        ],
    },
    ProviderDef {
        kind: "addresses",
        listing: Listing::Aggregated {
            resource: "addresses",
            field: "addresses",
        },
        match_fields: &["name", "description", "address"],
        detail_fields: &[
            ("address", "address"),
            ("type", "addressType"),
            ("status", "status"),
        ],
    },
    ProviderDef {
        kind: "instance-groups",
        listing: Listing::Aggregated {
            resource: "instanceGroups",
            field: "instanceGroups",
        },
        match_fields: &["name", "description"],
        detail_fields: &[("size", "size"), ("network", "network")],
    },
    ProviderDef {
        kind: "buckets",
        listing: Listing::Buckets,
        match_fields: &["name"],
        detail_fields: &[
            ("storage_class", "storageClass"),
            ("location_type", "locationType"),
        ],
    },
    ProviderDef {
        kind: "clusters",
        listing: Listing::Clusters,
        match_fields: &["name", "description", "endpoint"],
        detail_fields: &[
            ("status", "status"),
            ("version", "currentMasterVersion"),
            ("endpoint", "endpoint"),
        ],
    },
    ProviderDef {
        kind: "secrets",
        listing: Listing::Secrets,
        match_fields: &["name"],
        detail_fields: &[("created", "createTime")],
    },
];

/// Every value reachable through a dotted path, fanning out over arrays
pub fn field_values(item: &Value, path: &str) -> Vec<String> {
    let mut current = vec![item];
    for part in path.split('.') {
        current = current
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items.iter().filter_map(|i| i.get(part)).collect::<Vec<_>>(),
                other => other.get(part).into_iter().collect(),
            })
            .collect();
    }

    let mut values = Vec::new();
    for value in current {
        match value {
            Value::Array(items) => values.extend(items.iter().filter_map(scalar)),
            other => values.extend(scalar(other)),
        }
    }
    values
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resource URLs and `projects/...` names are shown by their last segment
fn display_value(value: &str) -> &str {
    if value.starts_with("https://") || value.starts_with("projects/") {
        short_name(value)
    } else {
        value
    }
}

/// Search provider for one row of [`PROVIDERS`]
pub struct RestProvider {
    def: &'static ProviderDef,
    client: GcpClient,
}

impl RestProvider {
    pub fn new(def: &'static ProviderDef, client: GcpClient) -> Self {
        Self { def, client }
    }

    /// Build a result when the item matches `query`
    pub fn to_result(
        &self,
        project: &str,
        location: &str,
        item: &Value,
        query: &SearchQuery,
    ) -> Option<SearchResult> {
        let candidates: Vec<String> = self
            .def
            .match_fields
            .iter()
            .flat_map(|path| field_values(item, path))
            .collect();
        if !query.matches_any(candidates.iter().map(String::as_str)) {
            return None;
        }

        let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let detail: BTreeMap<String, String> = self
            .def
            .detail_fields
            .iter()
            .filter_map(|(key, path)| {
                let values = field_values(item, path);
                (!values.is_empty()).then(|| {
                    let shown: Vec<&str> = values.iter().map(|v| display_value(v)).collect();
                    (key.to_string(), shown.join(","))
                })
            })
            .collect();

        Some(SearchResult {
            kind: self.def.kind.to_string(),
            name: display_value(name).to_string(),
            project: project.to_string(),
            location: location.to_string(),
            detail,
        })
    }

    /// Every item of the listing with its location
    async fn list(&self, client: &GcpClient, cancel: &CancellationToken) -> Result<Vec<(String, Value)>> {
        let scope = format!("project {}", client.project_id);
        let label = ScanLabel {
            op: "search listing",
            scope: &scope,
        };

        let located: Vec<(String, Value)> = match self.def.listing {
            Listing::Aggregated { resource, field } => {
                let url = client.compute_aggregated_url(resource);
                collect_pages(label, cancel, |token: Option<String>| {
                    let page_url = with_page_token(&url, token.as_deref());
                    async move { parse_aggregated::<Value>(client.get(&page_url).await?, field) }
                })
                .await?
                .into_iter()
                .map(|s| (s.scope.name().to_string(), s.item))
                .collect()
            }
            Listing::Global(resource) => {
                let url = client.compute_global_url(resource);
                let items = self.list_plain(label, cancel, client, &url, "items").await?;
                located_at(items, |_| Scope::Global.name().to_string())
            }
            Listing::Buckets => {
                let url = client.storage_buckets_url();
                let items = self.list_plain(label, cancel, client, &url, "items").await?;
                located_at(items, |item| location_field(item).to_lowercase())
            }
            Listing::Clusters => {
                let url = client.container_location_url("-", "clusters");
                let items = self.list_plain(label, cancel, client, &url, "clusters").await?;
                located_at(items, |item| location_field(item).to_string())
            }
            Listing::Secrets => {
                let url = client.secrets_url();
                let items = self.list_plain(label, cancel, client, &url, "secrets").await?;
                located_at(items, |_| Scope::Global.name().to_string())
            }
        };
        Ok(located)
    }

    async fn list_plain(
        &self,
        label: ScanLabel<'_>,
        cancel: &CancellationToken,
        client: &GcpClient,
        url: &str,
        field: &'static str,
    ) -> Result<Vec<Value>> {
        let items = collect_pages(label, cancel, |token: Option<String>| {
            let page_url = with_page_token(url, token.as_deref());
            async move { parse_list::<Value>(client.get(&page_url).await?, field) }
        })
        .await?;
        Ok(items)
    }
}

fn location_field(item: &Value) -> &str {
    item.get("location").and_then(|v| v.as_str()).unwrap_or("global")
}

fn located_at(items: Vec<Value>, location: impl Fn(&Value) -> String) -> Vec<(String, Value)> {
    items.into_iter().map(|item| (location(&item), item)).collect()
}

#[async_trait]
impl Provider for RestProvider {
    fn kind(&self) -> &str {
        self.def.kind
    }

    async fn search(
        &self,
        project: &str,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        let client = self.client.for_project(project);
        let items = self.list(&client, cancel).await?;
        let results: Vec<SearchResult> = items
            .iter()
            .filter_map(|(location, item)| self.to_result(project, location, item, query))
            .collect();
        tracing::debug!(
            "{} in {}: {} of {} item(s) match",
            self.def.kind,
            project,
            results.len(),
            items.len()
        );
        Ok(results)
    }
}

/// One provider per known kind, sharing `client`'s credentials
pub fn default_providers(client: &GcpClient) -> Vec<Arc<dyn Provider>> {
    PROVIDERS
        .iter()
        .map(|def| Arc::new(RestProvider::new(def, client.clone())) as Arc<dyn Provider>)
        .collect()
}

pub fn provider_kinds() -> Vec<&'static str> {
    PROVIDERS.iter().map(|d| d.kind).collect()
}
