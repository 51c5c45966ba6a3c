//! Cache-only subnet matching.
//!
//! A cached subnet entry is checked range by range: primary, then secondary
//! ranges in their listed order, then the IPv6 range. The first containing
//! range produces the association.

use super::{AssociationKind, IpAssociation, Target};
use crate::cache::SubnetEntry;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr};

/// Gateway of an IPv4 range: the first host address
fn first_host(net: &IpNetwork) -> Option<IpAddr> {
    match net {
        IpNetwork::V4(v4) if v4.prefix() < 31 => {
            Some(IpAddr::V4(Ipv4Addr::from(u32::from(v4.network()).wrapping_add(1))))
        }
        _ => None,
    }
}

fn parse_range(cidr: &str) -> Option<IpNetwork> {
    cidr.parse().ok()
}

/// Describe how `target` sits inside `entry`, if it does at all
pub(crate) fn match_subnet(entry: &SubnetEntry, target: &Target) -> Option<IpAssociation> {
    let details = describe(entry, target)?;
    Some(IpAssociation {
        project: entry.project.clone(),
        kind: AssociationKind::Subnet,
        resource: entry.name.clone(),
        location: entry.region.clone(),
        ip: target.canonical.clone(),
        details: format!("{}, network={}", details, entry.network),
        resource_link: Some(entry.self_link.clone()).filter(|l| !l.is_empty()),
    })
}

fn describe(entry: &SubnetEntry, target: &Target) -> Option<String> {
    if let Some(primary) = parse_range(&entry.primary_cidr).filter(|n| n.contains(target.ip)) {
        let gateway = entry
            .gateway
            .as_deref()
            .and_then(|g| g.parse::<IpAddr>().ok())
            .or_else(|| first_host(&primary));
        return Some(if gateway == Some(target.ip) {
            format!("gateway of primary range {}", entry.primary_cidr)
        } else {
            format!("primary range {}", entry.primary_cidr)
        });
    }

    for range in &entry.secondary_ranges {
        let Some(net) = parse_range(&range.cidr).filter(|n| n.contains(target.ip)) else {
            continue;
        };
        let label = match &range.name {
            Some(name) => format!("secondary range {} ({})", name, range.cidr),
            None => format!("secondary range {}", range.cidr),
        };
        return Some(if first_host(&net) == Some(target.ip) {
            format!("gateway of {}", label)
        } else {
            label
        });
    }

    entry
        .ipv6_cidr
        .as_deref()
        .filter(|c| parse_range(c).is_some_and(|n| n.contains(target.ip)))
        .map(|c| format!("ipv6 range {}", c))
}
