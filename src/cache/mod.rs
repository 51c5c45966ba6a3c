//! Location cache
//!
//! Remembers where named instances and MIGs were last seen, which zones a
//! project has, and the CIDR ranges of known subnets. Everything here is an
//! accelerator: entries may be stale or belong to another project, and callers
//! verify before trusting them. Writes are best-effort.

mod file;

pub use file::FileCache;

use crate::gcp::compute::{Scope, Subnetwork};
use crate::gcp::client::short_name;
use anyhow::Result;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Kind of resource a location hint describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Instance,
    Mig,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Mig => "mig",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known placement of a named resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationHint {
    pub project: String,
    /// Zone, or region when `regional` is set
    pub location: String,
    #[serde(default)]
    pub regional: bool,
    pub kind: ResourceKind,
    /// User preference: connect through IAP rather than directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_iap: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl LocationHint {
    pub fn new(project: &str, kind: ResourceKind, scope: &Scope) -> Self {
        Self {
            project: project.to_string(),
            location: scope.name().to_string(),
            regional: scope.is_regional(),
            kind,
            use_iap: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_iap(mut self, use_iap: Option<bool>) -> Self {
        self.use_iap = use_iap;
        self
    }

    pub fn scope(&self) -> Scope {
        if self.regional {
            Scope::Region(self.location.clone())
        } else {
            Scope::Zone(self.location.clone())
        }
    }
}

/// Named or unnamed secondary range of a subnet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cidr: String,
}

/// Cached subnet, used to narrow IP lookups without a network call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetEntry {
    pub project: String,
    pub region: String,
    pub network: String,
    pub name: String,
    #[serde(default)]
    pub self_link: String,
    pub primary_cidr: String,
    #[serde(default)]
    pub secondary_ranges: Vec<SubnetRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// `true` when `cidr` parses and contains `ip`
pub fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    cidr.parse::<IpNetwork>()
        .map(|net| net.contains(ip))
        .unwrap_or(false)
}

impl SubnetEntry {
    pub fn from_subnetwork(project: &str, subnet: &Subnetwork) -> Self {
        Self {
            project: project.to_string(),
            region: short_name(&subnet.region).to_string(),
            network: short_name(&subnet.network).to_string(),
            name: subnet.name.clone(),
            self_link: subnet.self_link.clone(),
            primary_cidr: subnet.ip_cidr_range.clone(),
            secondary_ranges: subnet
                .secondary_ip_ranges
                .iter()
                .map(|r| SubnetRange {
                    name: Some(r.range_name.clone()).filter(|n| !n.is_empty()),
                    cidr: r.ip_cidr_range.clone(),
                })
                .collect(),
            ipv6_cidr: subnet.ipv6_cidr_range.clone(),
            gateway: subnet.gateway_address.clone(),
        }
    }

    /// Whether any of the subnet's ranges could hold `ip`
    pub fn contains(&self, ip: IpAddr) -> bool {
        cidr_contains(&self.primary_cidr, ip)
            || self.secondary_ranges.iter().any(|r| cidr_contains(&r.cidr, ip))
            || self.ipv6_cidr.as_deref().is_some_and(|c| cidr_contains(c, ip))
    }

    fn key(&self) -> (&str, &str, &str) {
        (&self.project, &self.region, &self.name)
    }
}

/// Best-effort location store
pub trait LocationCache: Send + Sync {
    /// Most recent hint for `name` in any project
    fn get(&self, name: &str) -> Option<LocationHint>;

    /// Hint for `name` recorded for `project`
    fn get_scoped(&self, name: &str, project: &str) -> Option<LocationHint>;

    /// Upsert the hint for (`name`, `hint.project`)
    fn set(&self, name: &str, hint: LocationHint) -> Result<()>;

    fn set_batch(&self, hints: HashMap<String, LocationHint>) -> Result<()>;

    fn zones(&self, project: &str) -> Option<Vec<String>>;

    fn set_zones(&self, project: &str, zones: Vec<String>) -> Result<()>;

    /// Subnets (of any project) with a range containing `ip`
    fn find_subnets_for_ip(&self, ip: IpAddr) -> Vec<SubnetEntry>;

    fn remember_subnet_batch(&self, entries: Vec<SubnetEntry>) -> Result<()>;
}
