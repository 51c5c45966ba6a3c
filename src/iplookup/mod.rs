//! Reverse IP lookup: which resources in the project use an address.
//!
//! Three strategies, chosen by [`IpLookupMode`]:
//!
//! - a full scan of VM interfaces, forwarding rules and reserved addresses,
//!   run concurrently;
//! - a targeted scan narrowed to the regions and networks of cached subnets
//!   containing the address, plus a cache-only subnet pass;
//! - targeted first, then a full scan when the targeted pass found no
//!   resource holding the address.
//!
//! Public addresses carry no subnet signal, so they always take the full scan.

mod scan;
mod subnet;

pub use scan::Narrowing;

use crate::cache::{LocationCache, SubnetEntry};
use crate::error::{Error, Result};
use crate::gcp::compute::ComputeApi;
use crate::gcp::pager::{collect_pages, ScanLabel};
use crate::progress::Progress;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How hard to look for an address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpLookupMode {
    /// Targeted scan only when cached subnets match, full scan otherwise
    #[serde(rename = "fast")]
    FastOnly,
    /// Targeted scan, falling back to a full scan when it finds no holder
    #[default]
    #[serde(rename = "smart")]
    SmartFallback,
    /// Ignore the cache and always scan everything
    #[serde(rename = "complete")]
    AlwaysComplete,
}

impl fmt::Display for IpLookupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FastOnly => "fast",
            Self::SmartFallback => "smart",
            Self::AlwaysComplete => "complete",
        })
    }
}

/// What kind of resource references the address.
/// Variants are declared in the order of their names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssociationKind {
    Address,
    ExternalInterface,
    ForwardingRule,
    InternalInterface,
    Subnet,
}

impl AssociationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InternalInterface => "internal-interface",
            Self::ExternalInterface => "external-interface",
            Self::ForwardingRule => "forwarding-rule",
            Self::Address => "address",
            Self::Subnet => "subnet",
        }
    }

    /// Subnet matches say where an address could live, not who holds it
    pub fn is_holder(&self) -> bool {
        !matches!(self, Self::Subnet)
    }
}

impl fmt::Display for AssociationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource referencing the queried address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAssociation {
    pub project: String,
    pub kind: AssociationKind,
    pub resource: String,
    pub location: String,
    pub ip: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_link: Option<String>,
}

impl IpAssociation {
    fn sort_key(&self) -> (&str, &str, &str, &str) {
        (&self.project, self.kind.as_str(), &self.resource, &self.location)
    }
}

/// Parsed address plus its canonical text form
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub ip: IpAddr,
    pub canonical: String,
}

impl Target {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            canonical: ip.to_string(),
        }
    }
}

/// Parse an IPv4 or IPv6 literal
pub fn parse_ip(literal: &str) -> Result<IpAddr> {
    let trimmed = literal.trim();
    trimmed
        .parse()
        .map_err(|_| Error::InvalidInput(format!("'{}' is not an IP address", trimmed)))
}

/// `true` when `text` is an address equal to `ip`; non-addresses never match
pub fn equal_ip(text: &str, ip: &IpAddr) -> bool {
    text.trim().parse::<IpAddr>().is_ok_and(|parsed| parsed == *ip)
}

/// RFC 1918 and unique-local IPv6 (fc00::/7)
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Deduplicate by (project, kind, resource, location), first occurrence wins,
/// then sort by project, kind and resource
pub fn merge_associations(associations: impl IntoIterator<Item = IpAssociation>) -> Vec<IpAssociation> {
    let mut seen = HashSet::new();
    let mut merged: Vec<IpAssociation> = Vec::new();
    for assoc in associations {
        let key = (
            assoc.project.clone(),
            assoc.kind,
            assoc.resource.clone(),
            assoc.location.clone(),
        );
        if seen.insert(key) {
            merged.push(assoc);
        }
    }
    merged.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    merged
}

pub struct IpLookup {
    api: Arc<dyn ComputeApi>,
    cache: Option<Arc<dyn LocationCache>>,
    progress: Progress,
}

impl IpLookup {
    pub fn new(api: Arc<dyn ComputeApi>) -> Self {
        Self {
            api,
            cache: None,
            progress: Progress::none(),
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn LocationCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn project(&self) -> &str {
        self.api.project()
    }

    /// Find every resource in the project referencing `literal`
    pub async fn lookup(
        &self,
        literal: &str,
        mode: IpLookupMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpAssociation>> {
        let target = Target::new(parse_ip(literal)?);
        let key = format!("ip/{}", target.canonical);
        let result = self.lookup_inner(&key, &target, mode, cancel).await;
        match &result {
            Ok(found) => self.progress.done(&key, format!("{} association(s)", found.len())),
            Err(e) => self.progress.fail(&key, "lookup failed", e),
        }
        result
    }

    async fn lookup_inner(
        &self,
        key: &str,
        target: &Target,
        mode: IpLookupMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpAssociation>> {
        let hints = match mode {
            IpLookupMode::AlwaysComplete => Vec::new(),
            _ => self.subnet_hints(key, target),
        };

        if hints.is_empty() {
            self.progress.update(key, "Scanning all resources");
            return Ok(merge_associations(self.full_scan(target, cancel).await?));
        }

        let targeted = self.targeted_scan(key, target, &hints, cancel).await?;
        let holders = targeted.iter().filter(|a| a.kind.is_holder()).count();
        tracing::debug!(
            "Targeted scan for {}: {} association(s), {} holder(s)",
            target.canonical,
            targeted.len(),
            holders
        );

        if holders > 0 || mode == IpLookupMode::FastOnly {
            return Ok(merge_associations(targeted));
        }

        self.progress.info(key, "no holder in cached subnets, scanning everything");
        let full = self.full_scan(target, cancel).await?;
        Ok(merge_associations(targeted.into_iter().chain(full)))
    }

    /// Cached subnets of the active project that contain the address
    fn subnet_hints(&self, key: &str, target: &Target) -> Vec<SubnetEntry> {
        if !is_private(&target.ip) {
            tracing::debug!("{} is public, skipping subnet hints", target.canonical);
            return Vec::new();
        }
        let Some(cache) = &self.cache else {
            return Vec::new();
        };

        let (own, foreign): (Vec<SubnetEntry>, Vec<SubnetEntry>) = cache
            .find_subnets_for_ip(target.ip)
            .into_iter()
            .partition(|s| s.project == self.project());
        if !foreign.is_empty() {
            self.progress.info(
                key,
                format!("ignoring {} cached subnet(s) from other projects", foreign.len()),
            );
        }
        own
    }

    /// Narrowed scans plus the cache-only subnet pass
    async fn targeted_scan(
        &self,
        key: &str,
        target: &Target,
        hints: &[SubnetEntry],
        cancel: &CancellationToken,
    ) -> Result<Vec<IpAssociation>> {
        let narrowing = Narrowing {
            regions: hints.iter().map(|h| h.region.clone()).collect(),
            networks: hints.iter().map(|h| h.network.clone()).collect(),
        };
        self.progress.update(
            key,
            format!(
                "Scanning {} region(s) from {} cached subnet(s)",
                narrowing.regions.len(),
                hints.len()
            ),
        );

        let api = self.api.as_ref();
        let (instances, rules, addresses) = tokio::try_join!(
            scan::scan_instances(api, target, Some(&narrowing), cancel),
            scan::scan_forwarding_rules(api, target, Some(&narrowing), cancel),
            scan::scan_addresses(api, target, Some(&narrowing), cancel),
        )?;

        let subnets = hints.iter().filter_map(|h| subnet::match_subnet(h, target));
        Ok(instances
            .into_iter()
            .chain(rules)
            .chain(addresses)
            .chain(subnets)
            .collect())
    }

    /// All three resource scans at once; the first failure drops the others
    async fn full_scan(&self, target: &Target, cancel: &CancellationToken) -> Result<Vec<IpAssociation>> {
        let api = self.api.as_ref();
        let (instances, rules, addresses) = tokio::try_join!(
            scan::scan_instances(api, target, None, cancel),
            scan::scan_forwarding_rules(api, target, None, cancel),
            scan::scan_addresses(api, target, None, cancel),
        )?;
        Ok(instances.into_iter().chain(rules).chain(addresses).collect())
    }

    /// Store every subnet of the project in the cache for later lookups.
    /// Returns the number of entries written.
    pub async fn refresh_subnets(&self, cancel: &CancellationToken) -> Result<usize> {
        let key = "cache/subnets";
        let Some(cache) = &self.cache else {
            self.progress.done(key, "no cache configured");
            return Ok(0);
        };

        self.progress.update(key, "Listing subnetworks");
        let api = self.api.as_ref();
        let project = self.project().to_string();
        let scope = format!("project {}", project);
        let listed = collect_pages(
            ScanLabel {
                op: "list subnetworks",
                scope: &scope,
            },
            cancel,
            move |token| api.aggregated_subnetworks(token),
        )
        .await;

        let subnets = match listed {
            Ok(subnets) => subnets,
            Err(e) => {
                self.progress.fail(key, "listing failed", &e);
                return Err(e);
            }
        };

        let entries: Vec<SubnetEntry> = subnets
            .iter()
            .map(|s| SubnetEntry::from_subnetwork(&project, &s.item))
            .collect();
        let count = entries.len();
        if let Err(e) = cache.remember_subnet_batch(entries) {
            tracing::warn!("Failed to cache subnets of {}: {:#}", project, e);
            self.progress.fail(key, "cache write failed", &e);
            return Ok(0);
        }
        self.progress.done(key, format!("cached {} subnet(s)", count));
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileCache, SubnetRange};
    use crate::gcp::compute::{Address, ForwardingRule, Scope, Scoped, Subnetwork};
    use crate::gcp::fake::{instance, FakeCompute};
    use crate::progress::recorder::Recorder;

    const PROJECT: &str = "net-project";

    fn subnet_entry(project: &str, region: &str, network: &str, cidr: &str) -> SubnetEntry {
        SubnetEntry {
            project: project.to_string(),
            region: region.to_string(),
            network: network.to_string(),
            name: format!("{}-{}", network, region),
            self_link: String::new(),
            primary_cidr: cidr.to_string(),
            secondary_ranges: Vec::<SubnetRange>::new(),
            ipv6_cidr: None,
            gateway: None,
        }
    }

    fn estate() -> FakeCompute {
        let mut api = FakeCompute::new(PROJECT);
        api.instances = vec![
            instance("prod-db", "us-east1-b", "prod", "10.0.0.5", None),
            instance("dev-db", "us-east1-c", "dev", "10.0.0.5", None),
            instance("edge", "europe-west1-b", "prod", "10.1.0.7", Some("34.1.2.3")),
        ];
        api.forwarding_rules = vec![Scoped {
            scope: Scope::Global,
            item: ForwardingRule {
                name: "web-lb".to_string(),
                ip_address: Some("34.1.2.3".to_string()),
                ip_protocol: Some("TCP".to_string()),
                port_range: Some("443-443".to_string()),
                ..Default::default()
            },
        }];
        api.addresses = vec![Scoped {
            scope: Scope::Region("europe-west1".to_string()),
            item: Address {
                name: "edge-ip".to_string(),
                address: Some("34.1.2.3".to_string()),
                address_type: Some("EXTERNAL".to_string()),
                status: Some("IN_USE".to_string()),
                users: vec!["projects/p/zones/europe-west1-b/instances/edge".to_string()],
                ..Default::default()
            },
        }];
        api
    }

    fn with_subnets(entries: Vec<SubnetEntry>) -> Arc<dyn LocationCache> {
        let cache = FileCache::in_memory();
        cache.remember_subnet_batch(entries).unwrap();
        Arc::new(cache)
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip(" 10.0.0.1 ").unwrap().to_string(), "10.0.0.1");
        assert_eq!(parse_ip("2001:0db8:0:0::1").unwrap().to_string(), "2001:db8::1");
        assert!(matches!(parse_ip("not-an-ip"), Err(Error::InvalidInput(_))));
        assert!(parse_ip("10.0.0.0/8").is_err());
    }

    #[test]
    fn test_equal_ip() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(equal_ip("2001:0db8:0000::0001", &ip));
        assert!(!equal_ip("2001:db8::2", &ip));
        assert!(!equal_ip("not-an-ip", &ip));
        assert!(!equal_ip("", &ip));
    }

    #[test]
    fn test_is_private() {
        for private in ["10.1.2.3", "172.16.0.1", "172.31.255.255", "192.168.0.1", "fd00::1", "fc12::7"] {
            assert!(is_private(&private.parse().unwrap()), "{}", private);
        }
        for public in ["8.8.8.8", "172.32.0.1", "34.1.2.3", "2600:1900::1", "fe80::1"] {
            assert!(!is_private(&public.parse().unwrap()), "{}", public);
        }
    }

    #[test]
    fn test_merge_dedups_first_wins_and_sorts() {
        let assoc = |project: &str, kind, resource: &str, details: &str| IpAssociation {
            project: project.to_string(),
            kind,
            resource: resource.to_string(),
            location: "us-east1".to_string(),
            ip: "10.0.0.5".to_string(),
            details: details.to_string(),
            resource_link: None,
        };
        let merged = merge_associations(vec![
            assoc("b", AssociationKind::Address, "x", "first"),
            assoc("a", AssociationKind::Subnet, "s", ""),
            assoc("b", AssociationKind::Address, "x", "second"),
            assoc("a", AssociationKind::InternalInterface, "vm", ""),
        ]);
        let order: Vec<(&str, &str)> = merged
            .iter()
            .map(|a| (a.project.as_str(), a.resource.as_str()))
            .collect();
        assert_eq!(order, vec![("a", "vm"), ("a", "s"), ("b", "x")]);
        assert_eq!(merged[2].details, "first");
        assert_eq!(merge_associations(merged.clone()), merged);
    }

    #[test]
    fn test_merge_orders_kinds_by_name() {
        let assoc = |kind| IpAssociation {
            project: "p".to_string(),
            kind,
            resource: "r".to_string(),
            location: "us-east1".to_string(),
            ip: "10.0.0.5".to_string(),
            details: String::new(),
            resource_link: None,
        };
        let merged = merge_associations(vec![
            assoc(AssociationKind::Subnet),
            assoc(AssociationKind::InternalInterface),
            assoc(AssociationKind::Address),
            assoc(AssociationKind::ForwardingRule),
            assoc(AssociationKind::ExternalInterface),
        ]);
        let kinds: Vec<&str> = merged.iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "address",
                "external-interface",
                "forwarding-rule",
                "internal-interface",
                "subnet",
            ]
        );
    }

    #[tokio::test]
    async fn test_full_scan_finds_every_holder() {
        let api = Arc::new(estate());
        let lookup = IpLookup::new(api.clone());
        let found = lookup
            .lookup("34.1.2.3", IpLookupMode::SmartFallback, &CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<&str> = found.iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(kinds, vec!["address", "external-interface", "forwarding-rule"]);
        assert_eq!(found[0].details, "type=EXTERNAL, status=IN_USE, users=edge");
        assert_eq!(found[1].resource, "edge");
        assert_eq!(found[1].details, "interface=nic0, access-config=External NAT, network=prod");
        assert_eq!(found[2].location, "global");
        assert_eq!(found[2].details, "protocol=TCP, ports=443-443");
        assert!(found.iter().all(|a| a.ip == "34.1.2.3"));
    }

    #[tokio::test]
    async fn test_invalid_literal_makes_no_calls() {
        let api = Arc::new(estate());
        let lookup = IpLookup::new(api.clone());
        let err = lookup
            .lookup("300.1.1.1", IpLookupMode::AlwaysComplete, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(api.calls("aggregated_instances"), 0);
    }

    #[tokio::test]
    async fn test_public_address_ignores_subnet_cache() {
        let api = Arc::new(estate());
        let cache = with_subnets(vec![subnet_entry(PROJECT, "us-east1", "prod", "0.0.0.0/0")]);
        let lookup = IpLookup::new(api.clone()).with_cache(Some(cache));
        let found = lookup
            .lookup("34.1.2.3", IpLookupMode::FastOnly, &CancellationToken::new())
            .await
            .unwrap();
        assert!(found.iter().all(|a| a.kind != AssociationKind::Subnet));
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn test_targeted_scan_narrows_to_hinted_network() {
        let api = Arc::new(estate());
        let cache = with_subnets(vec![subnet_entry(PROJECT, "us-east1", "prod", "10.0.0.0/24")]);
        let lookup = IpLookup::new(api.clone()).with_cache(Some(cache));
        let found = lookup
            .lookup("10.0.0.5", IpLookupMode::FastOnly, &CancellationToken::new())
            .await
            .unwrap();

        let resources: Vec<(&str, AssociationKind)> =
            found.iter().map(|a| (a.resource.as_str(), a.kind)).collect();
        assert_eq!(
            resources,
            vec![
                ("prod-db", AssociationKind::InternalInterface),
                ("prod-us-east1", AssociationKind::Subnet),
            ]
        );
        assert_eq!(found[1].details, "primary range 10.0.0.0/24, network=prod");
    }

    #[tokio::test]
    async fn test_fast_mode_does_not_fall_back() {
        let api = Arc::new(estate());
        // Stale hint: the address now lives in a different region
        let cache = with_subnets(vec![subnet_entry(PROJECT, "asia-east1", "prod", "10.1.0.0/24")]);
        let lookup = IpLookup::new(api.clone()).with_cache(Some(cache));
        let found = lookup
            .lookup("10.1.0.7", IpLookupMode::FastOnly, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, AssociationKind::Subnet);
        // three instances at two per page
        assert_eq!(api.calls("aggregated_instances"), 2);
    }

    #[tokio::test]
    async fn test_smart_mode_falls_back_and_dedups() {
        let api = Arc::new(estate());
        let cache = with_subnets(vec![subnet_entry(PROJECT, "asia-east1", "prod", "10.1.0.0/24")]);
        let recorder = Arc::new(Recorder::default());
        let lookup = IpLookup::new(api.clone())
            .with_cache(Some(cache))
            .with_progress(Progress::new(recorder.clone()));
        let found = lookup
            .lookup("10.1.0.7", IpLookupMode::SmartFallback, &CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<AssociationKind> = found.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AssociationKind::InternalInterface, AssociationKind::Subnet]);
        assert_eq!(found[0].resource, "edge");
        assert_eq!(api.calls("aggregated_instances"), 4);
        assert!(recorder.snapshot().iter().any(|e| e.informational));
        recorder.assert_well_formed();
    }

    #[tokio::test]
    async fn test_complete_mode_skips_cache() {
        let api = Arc::new(estate());
        let cache = with_subnets(vec![subnet_entry(PROJECT, "us-east1", "prod", "10.0.0.0/24")]);
        let lookup = IpLookup::new(api.clone()).with_cache(Some(cache));
        let found = lookup
            .lookup("10.0.0.5", IpLookupMode::AlwaysComplete, &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<&str> = found.iter().map(|a| a.resource.as_str()).collect();
        assert_eq!(names, vec!["dev-db", "prod-db"]);
    }

    #[tokio::test]
    async fn test_foreign_project_subnets_are_ignored() {
        let api = Arc::new(estate());
        let cache = with_subnets(vec![subnet_entry("other", "us-east1", "prod", "10.0.0.0/24")]);
        let lookup = IpLookup::new(api.clone()).with_cache(Some(cache));
        let found = lookup
            .lookup("10.0.0.5", IpLookupMode::FastOnly, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|a| a.project == PROJECT));
    }

    #[tokio::test]
    async fn test_scan_failure_is_reported() {
        let mut api = estate();
        api.failures.insert("aggregated_forwarding_rules", 403);
        let recorder = Arc::new(Recorder::default());
        let lookup = IpLookup::new(Arc::new(api)).with_progress(Progress::new(recorder.clone()));
        let err = lookup
            .lookup("34.1.2.3", IpLookupMode::SmartFallback, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upstream { op: "list forwarding rules", .. }));
        recorder.assert_well_formed();
    }

    #[tokio::test]
    async fn test_cancelled_lookup() {
        let lookup = IpLookup::new(Arc::new(estate()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = lookup
            .lookup("10.0.0.5", IpLookupMode::AlwaysComplete, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_refresh_subnets_feeds_targeted_lookup() {
        let mut api = estate();
        api.subnetworks = vec![Scoped {
            scope: Scope::Region("us-east1".to_string()),
            item: Subnetwork {
                name: "prod-east".to_string(),
                region: "projects/net-project/regions/us-east1".to_string(),
                network: "projects/net-project/global/networks/prod".to_string(),
                ip_cidr_range: "10.0.0.0/24".to_string(),
                ..Default::default()
            },
        }];
        let api = Arc::new(api);
        let cache: Arc<dyn LocationCache> = Arc::new(FileCache::in_memory());
        let lookup = IpLookup::new(api.clone()).with_cache(Some(cache.clone()));

        let cancel = CancellationToken::new();
        assert_eq!(lookup.refresh_subnets(&cancel).await.unwrap(), 1);
        assert_eq!(cache.find_subnets_for_ip("10.0.0.5".parse().unwrap()).len(), 1);

        let found = lookup.lookup("10.0.0.5", IpLookupMode::FastOnly, &cancel).await.unwrap();
        assert!(found.iter().any(|a| a.resource == "prod-east"));
        assert!(found.iter().all(|a| a.resource != "dev-db"));
    }

    #[tokio::test]
    async fn test_refresh_without_cache_is_noop() {
        let api = Arc::new(estate());
        let lookup = IpLookup::new(api.clone());
        assert_eq!(lookup.refresh_subnets(&CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(api.calls("aggregated_subnetworks"), 0);
    }
}
