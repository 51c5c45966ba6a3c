//! Inventory scans for one target IP.
//!
//! Each scan pages one aggregated listing and keeps only the resources that
//! reference the target. With [`Narrowing`] the pages are pre-filtered to the
//! hinted regions (and, for VM interfaces, the hinted networks) before any IP
//! comparison happens.

use super::{equal_ip, AssociationKind, IpAssociation, Target};
use crate::error::Result;
use crate::gcp::client::short_name;
use crate::gcp::compute::{Address, ComputeApi, ForwardingRule, Instance, NetworkInterface, Scope, Scoped};
use crate::gcp::pager::{scan_pages, ScanLabel};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;

/// Regions and networks a targeted scan is restricted to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Narrowing {
    pub regions: BTreeSet<String>,
    pub networks: BTreeSet<String>,
}

impl Narrowing {
    fn keeps_scope(&self, scope: &Scope) -> bool {
        scope.region().is_some_and(|r| self.regions.contains(r))
    }

    fn keeps_network(&self, network_url: &str) -> bool {
        self.networks.contains(short_name(network_url))
    }
}

/// Join the present `key=value` pairs
pub(crate) fn summarize(parts: &[(&str, Option<String>)]) -> String {
    parts
        .iter()
        .filter_map(|(k, v)| {
            v.as_deref()
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}={}", k, v))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// IP fields on forwarding rules and addresses may carry a prefix length
fn address_matches(field: Option<&str>, target: &Target) -> bool {
    field
        .map(|f| f.split('/').next().unwrap_or(f))
        .is_some_and(|f| equal_ip(f, &target.ip))
}

fn nonempty(s: &str) -> Option<String> {
    Some(s.to_string()).filter(|s| !s.is_empty())
}

fn interface_matches(
    project: &str,
    instance: &Instance,
    zone: &str,
    nic: &NetworkInterface,
    target: &Target,
    out: &mut Vec<IpAssociation>,
) {
    let network = Some(short_name(&nic.network).to_string()).filter(|s| !s.is_empty());
    let subnet = Some(short_name(&nic.subnetwork).to_string()).filter(|s| !s.is_empty());
    let mut push = |kind, details: String| {
        out.push(IpAssociation {
            project: project.to_string(),
            kind,
            resource: instance.name.clone(),
            location: zone.to_string(),
            ip: target.canonical.clone(),
            details,
            resource_link: nonempty(&instance.self_link),
        });
    };

    let internal = [nic.network_ip.as_deref(), nic.ipv6_address.as_deref()];
    if internal.iter().flatten().any(|ip| equal_ip(ip, &target.ip)) {
        push(
            AssociationKind::InternalInterface,
            summarize(&[
                ("interface", nonempty(&nic.name)),
                ("network", network.clone()),
                ("subnet", subnet.clone()),
                ("status", nonempty(&instance.status)),
            ]),
        );
    }

    for config in nic.access_configs.iter().chain(nic.ipv6_access_configs.iter()) {
        let external = [config.nat_ip.as_deref(), config.external_ipv6.as_deref()];
        if external.iter().flatten().any(|ip| equal_ip(ip, &target.ip)) {
            push(
                AssociationKind::ExternalInterface,
                summarize(&[
                    ("interface", nonempty(&nic.name)),
                    ("access-config", nonempty(&config.name)),
                    ("tier", config.network_tier.clone()),
                    ("network", network.clone()),
                ]),
            );
        }
    }
}

fn forwarding_rule_association(project: &str, scope: &Scope, rule: &ForwardingRule, target: &Target) -> IpAssociation {
    let ports = if rule.ports.is_empty() {
        rule.port_range.clone()
    } else {
        Some(rule.ports.join(","))
    };
    let target_name = rule
        .target
        .as_deref()
        .map(|t| format!("target={}", short_name(t)))
        .or_else(|| {
            rule.backend_service
                .as_deref()
                .map(|b| format!("backend={}", short_name(b)))
        });

    let mut details = summarize(&[
        ("scheme", rule.load_balancing_scheme.clone()),
        ("protocol", rule.ip_protocol.clone()),
        ("ports", ports),
    ]);
    if let Some(t) = target_name {
        if !details.is_empty() {
            details.push_str(", ");
        }
        details.push_str(&t);
    }

    IpAssociation {
        project: project.to_string(),
        kind: AssociationKind::ForwardingRule,
        resource: rule.name.clone(),
        location: scope.name().to_string(),
        ip: target.canonical.clone(),
        details,
        resource_link: nonempty(&rule.self_link),
    }
}

fn address_association(project: &str, scope: &Scope, address: &Address, target: &Target) -> IpAssociation {
    let users = (!address.users.is_empty()).then(|| {
        address
            .users
            .iter()
            .map(|u| short_name(u))
            .collect::<Vec<_>>()
            .join(",")
    });

    IpAssociation {
        project: project.to_string(),
        kind: AssociationKind::Address,
        resource: address.name.clone(),
        location: scope.name().to_string(),
        ip: target.canonical.clone(),
        details: summarize(&[
            ("type", address.address_type.clone()),
            ("purpose", address.purpose.clone()),
            ("status", address.status.clone()),
            ("users", users),
            ("subnet", address.subnetwork.as_deref().map(|s| short_name(s).to_string())),
        ]),
        resource_link: nonempty(&address.self_link),
    }
}

/// VM interfaces: internal addresses and per-access-config external addresses
pub(crate) async fn scan_instances(
    api: &dyn ComputeApi,
    target: &Target,
    narrowing: Option<&Narrowing>,
    cancel: &CancellationToken,
) -> Result<Vec<IpAssociation>> {
    let project = api.project().to_string();
    let scope = format!("project {}", project);
    let mut found = Vec::new();

    scan_pages::<_, (), _, _, _>(
        ScanLabel {
            op: "list instances",
            scope: &scope,
        },
        cancel,
        |token| api.aggregated_instances(token),
        |items: Vec<Scoped<Instance>>| {
            for Scoped { scope, item } in items {
                if narrowing.is_some_and(|n| !n.keeps_scope(&scope)) {
                    continue;
                }
                for nic in &item.network_interfaces {
                    if narrowing.is_some_and(|n| !n.keeps_network(&nic.network)) {
                        continue;
                    }
                    interface_matches(&project, &item, scope.name(), nic, target, &mut found);
                }
            }
            ControlFlow::Continue(())
        },
    )
    .await?;

    Ok(found)
}

/// Load-balancer frontends
pub(crate) async fn scan_forwarding_rules(
    api: &dyn ComputeApi,
    target: &Target,
    narrowing: Option<&Narrowing>,
    cancel: &CancellationToken,
) -> Result<Vec<IpAssociation>> {
    let project = api.project().to_string();
    let scope = format!("project {}", project);
    let mut found = Vec::new();

    scan_pages::<_, (), _, _, _>(
        ScanLabel {
            op: "list forwarding rules",
            scope: &scope,
        },
        cancel,
        |token| api.aggregated_forwarding_rules(token),
        |items: Vec<Scoped<ForwardingRule>>| {
            found.extend(
                items
                    .iter()
                    .filter(|s| narrowing.map_or(true, |n| n.keeps_scope(&s.scope)))
                    .filter(|s| address_matches(s.item.ip_address.as_deref(), target))
                    .map(|s| forwarding_rule_association(&project, &s.scope, &s.item, target)),
            );
            ControlFlow::Continue(())
        },
    )
    .await?;

    Ok(found)
}

/// Reserved static addresses
pub(crate) async fn scan_addresses(
    api: &dyn ComputeApi,
    target: &Target,
    narrowing: Option<&Narrowing>,
    cancel: &CancellationToken,
) -> Result<Vec<IpAssociation>> {
    let project = api.project().to_string();
    let scope = format!("project {}", project);
    let mut found = Vec::new();

    scan_pages::<_, (), _, _, _>(
        ScanLabel {
            op: "list addresses",
            scope: &scope,
        },
        cancel,
        |token| api.aggregated_addresses(token),
        |items: Vec<Scoped<Address>>| {
            found.extend(
                items
                    .iter()
                    .filter(|s| narrowing.map_or(true, |n| n.keeps_scope(&s.scope)))
                    .filter(|s| address_matches(s.item.address.as_deref(), target))
                    .map(|s| address_association(&project, &s.scope, &s.item, target)),
            );
            ControlFlow::Continue(())
        },
    )
    .await?;

    Ok(found)
}
