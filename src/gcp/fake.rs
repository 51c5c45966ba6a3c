//! In-memory [`ComputeApi`] used by unit tests.

use super::compute::*;
use super::http::ApiError;
use super::pager::Page;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct FakeCompute {
    pub project: String,
    pub page_size: usize,
    pub instances: Vec<Scoped<Instance>>,
    pub igms: Vec<Scoped<InstanceGroupManager>>,
    /// MIGs answered by point lookups but missing from the aggregated listing
    pub unlisted_igms: Vec<Scoped<InstanceGroupManager>>,
    pub members: HashMap<String, Vec<ManagedInstanceRef>>,
    pub zones: Vec<String>,
    pub forwarding_rules: Vec<Scoped<ForwardingRule>>,
    pub addresses: Vec<Scoped<Address>>,
    pub subnetworks: Vec<Scoped<Subnetwork>>,
    /// op name -> HTTP status returned instead of data
    pub failures: HashMap<&'static str, u16>,
    /// region -> (delay, status) for regional MIG lookups
    pub region_faults: HashMap<String, (Duration, Option<u16>)>,
    pub probe_delay: Duration,
    calls: Mutex<HashMap<&'static str, usize>>,
    completed_probes: Mutex<Vec<String>>,
    found_probes: Mutex<HashSet<String>>,
}

impl FakeCompute {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            page_size: 2,
            ..Default::default()
        }
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn completed_probes(&self) -> Vec<String> {
        self.completed_probes.lock().unwrap().clone()
    }

    pub fn found_probes(&self) -> usize {
        self.found_probes.lock().unwrap().len()
    }

    fn record(&self, op: &'static str) -> Result<(), ApiError> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        match self.failures.get(op) {
            Some(status) => Err(ApiError::Status {
                status: *status,
                message: format!("injected failure for {}", op),
            }),
            None => Ok(()),
        }
    }

    fn paginate<T: Clone>(&self, items: &[T], token: Option<String>) -> Page<T> {
        let start: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size.max(1)).min(items.len());
        Page {
            items: items[start.min(end)..end].to_vec(),
            next_page_token: (end < items.len()).then(|| end.to_string()),
        }
    }
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: 404,
        message: "not found".to_string(),
    }
}

pub fn instance(name: &str, zone: &str, network: &str, ip: &str, nat: Option<&str>) -> Scoped<Instance> {
    Scoped {
        scope: Scope::Zone(zone.to_string()),
        item: Instance {
            name: name.to_string(),
            zone: zone.to_string(),
            status: "RUNNING".to_string(),
            self_link: format!("projects/p/zones/{}/instances/{}", zone, name),
            description: None,
            network_interfaces: vec![NetworkInterface {
                name: "nic0".to_string(),
                network: format!("projects/p/global/networks/{}", network),
                subnetwork: format!("projects/p/regions/r/subnetworks/{}-sub", network),
                network_ip: Some(ip.to_string()),
                access_configs: nat
                    .map(|n| AccessConfig {
                        name: "External NAT".to_string(),
                        nat_ip: Some(n.to_string()),
                        ..Default::default()
                    })
                    .into_iter()
                    .collect(),
                ..Default::default()
            }],
        },
    }
}

pub fn igm(name: &str, scope: Scope) -> Scoped<InstanceGroupManager> {
    Scoped {
        item: InstanceGroupManager {
            name: name.to_string(),
            zone: match &scope {
                Scope::Zone(z) => Some(z.clone()),
                _ => None,
            },
            region: match &scope {
                Scope::Region(r) => Some(r.clone()),
                _ => None,
            },
            ..Default::default()
        },
        scope,
    }
}

pub fn member(name: &str, zone: &str, status: &str) -> ManagedInstanceRef {
    ManagedInstanceRef {
        name: name.to_string(),
        zone: zone.to_string(),
        status: status.to_string(),
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    fn project(&self) -> &str {
        &self.project
    }

    async fn aggregated_instances(&self, page_token: Option<String>) -> ApiResult<Page<Scoped<Instance>>> {
        self.record("aggregated_instances")?;
        Ok(self.paginate(&self.instances, page_token))
    }

    async fn get_instance(&self, zone: &str, name: &str) -> ApiResult<Instance> {
        self.record("get_instance")?;
        self.instances
            .iter()
            .find(|s| s.scope.name() == zone && s.item.name == name)
            .map(|s| s.item.clone())
            .ok_or_else(not_found)
    }

    async fn aggregated_instance_group_managers(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<InstanceGroupManager>>> {
        self.record("aggregated_igms")?;
        Ok(self.paginate(&self.igms, page_token))
    }

    async fn get_instance_group_manager(&self, scope: &Scope, name: &str) -> ApiResult<InstanceGroupManager> {
        self.record("get_igm")?;
        let mut fault = None;
        if let Scope::Region(region) = scope {
            let (delay, status) = self
                .region_faults
                .get(region)
                .cloned()
                .unwrap_or((self.probe_delay, None));
            tokio::time::sleep(delay).await;
            self.completed_probes.lock().unwrap().push(region.clone());
            fault = status;
        }
        if let Some(status) = fault {
            return Err(ApiError::Status {
                status,
                message: "injected probe failure".to_string(),
            });
        }
        let found = self
            .igms
            .iter()
            .chain(self.unlisted_igms.iter())
            .find(|s| &s.scope == scope && s.item.name == name)
            .map(|s| s.item.clone())
            .ok_or_else(not_found)?;
        if scope.is_regional() {
            self.found_probes.lock().unwrap().insert(scope.name().to_string());
        }
        Ok(found)
    }

    async fn list_managed_instances(
        &self,
        _scope: &Scope,
        name: &str,
        page_token: Option<String>,
    ) -> ApiResult<Page<ManagedInstanceRef>> {
        self.record("list_managed_instances")?;
        let members = self.members.get(name).cloned().unwrap_or_default();
        Ok(self.paginate(&members, page_token))
    }

    async fn list_zones(&self, page_token: Option<String>) -> ApiResult<Page<String>> {
        self.record("list_zones")?;
        Ok(self.paginate(&self.zones, page_token))
    }

    async fn aggregated_forwarding_rules(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<ForwardingRule>>> {
        self.record("aggregated_forwarding_rules")?;
        Ok(self.paginate(&self.forwarding_rules, page_token))
    }

    async fn aggregated_addresses(&self, page_token: Option<String>) -> ApiResult<Page<Scoped<Address>>> {
        self.record("aggregated_addresses")?;
        Ok(self.paginate(&self.addresses, page_token))
    }

    async fn aggregated_subnetworks(
        &self,
        page_token: Option<String>,
    ) -> ApiResult<Page<Scoped<Subnetwork>>> {
        self.record("aggregated_subnetworks")?;
        Ok(self.paginate(&self.subnetworks, page_token))
    }
}
