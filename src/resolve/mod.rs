//! Tiered location resolution for instances and managed instance groups.
//!
//! With an explicit zone or region the resolver performs one direct lookup and
//! never touches the cache. Otherwise it tries, in order:
//!
//! 1. the location cache, verified by a point lookup at the cached location;
//! 2. one pass over the aggregated listing, stopping at the first matching page;
//! 3. for MIGs only, parallel per-region probing ([`probe`]).
//!
//! A location found by tier 2 or 3 is written back to the cache.

mod probe;

use crate::cache::{LocationCache, LocationHint, ResourceKind};
use crate::error::{Error, Result};
use crate::gcp::client::region_of_zone;
use crate::gcp::compute::{ComputeApi, ManagedInstanceRef, Scope};
use crate::gcp::http::ApiError;
use crate::gcp::pager::{collect_pages, find_in_pages, ScanLabel};
use crate::progress::Progress;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default number of regions probed at once
pub const DEFAULT_PROBE_CONCURRENCY: usize = 10;

/// Which tier produced a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedVia {
    Explicit,
    Cache,
    Scan,
    RegionProbe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceLocation {
    pub name: String,
    pub project: String,
    pub zone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_iap: Option<bool>,
    pub via: ResolvedVia,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigLocation {
    pub name: String,
    pub project: String,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_iap: Option<bool>,
    pub via: ResolvedVia,
}

/// A resolved MIG and the member chosen to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigInstance {
    pub mig: MigLocation,
    pub instance: ManagedInstanceRef,
}

/// First RUNNING member, else the first member. Order preserving.
pub fn select_preferred(members: &[ManagedInstanceRef]) -> Option<&ManagedInstanceRef> {
    members
        .iter()
        .find(|m| m.is_running())
        .or_else(|| members.first())
}

/// Run an API call unless the caller cancels first
async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = std::result::Result<T, ApiError>>,
) -> Result<std::result::Result<T, ApiError>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = call => Ok(result),
    }
}

pub struct Resolver {
    api: Arc<dyn ComputeApi>,
    cache: Option<Arc<dyn LocationCache>>,
    progress: Progress,
    probe_concurrency: usize,
}

impl Resolver {
    pub fn new(api: Arc<dyn ComputeApi>) -> Self {
        Self {
            api,
            cache: None,
            progress: Progress::none(),
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
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

    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = concurrency.max(1);
        self
    }

    pub fn project(&self) -> &str {
        self.api.project()
    }

    /// Emit the terminal progress event for `key` and pass the result through
    fn finish<T>(&self, key: &str, result: Result<T>, describe: impl FnOnce(&T) -> String) -> Result<T> {
        match &result {
            Ok(value) => self.progress.done(key, describe(value)),
            Err(e) => self.progress.fail(key, "lookup failed", e),
        }
        result
    }

    /// Cached hint for `name`, if it is for the active project and the expected kind
    fn cached_hint(&self, key: &str, name: &str, kind: ResourceKind) -> Option<LocationHint> {
        let cache = self.cache.as_ref()?;
        let hint = cache.get_scoped(name, self.project())?;

        if hint.project != self.project() {
            tracing::debug!(
                "Rejecting cached {} for {}: project {} != {}",
                hint.kind,
                name,
                hint.project,
                self.project()
            );
            self.progress.info(key, "cached location belongs to another project");
            return None;
        }
        if hint.kind != kind {
            tracing::debug!("Rejecting cached {} for {}: expected {}", hint.kind, name, kind);
            self.progress.info(key, format!("cached entry is a {}, not a {}", hint.kind, kind));
            return None;
        }
        Some(hint)
    }

    /// Upsert a discovered location, keeping any stored connection preference.
    /// Returns the preference now attached to the location.
    fn remember(&self, name: &str, mut hint: LocationHint) -> Option<bool> {
        let Some(cache) = &self.cache else {
            return None;
        };
        if hint.use_iap.is_none() {
            hint.use_iap = cache
                .get_scoped(name, &hint.project)
                .filter(|prev| prev.kind == hint.kind)
                .and_then(|prev| prev.use_iap);
        }
        let use_iap = hint.use_iap;
        if let Err(e) = cache.set(name, hint) {
            tracing::warn!("Failed to cache location of {}: {:#}", name, e);
        }
        use_iap
    }

    /// Store the user's IAP preference for a resource already in the cache
    pub fn remember_preference(&self, name: &str, kind: ResourceKind, use_iap: bool) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Some(hint) = cache
            .get_scoped(name, self.project())
            .filter(|h| h.kind == kind)
        {
            if let Err(e) = cache.set(name, hint.with_iap(Some(use_iap))) {
                tracing::warn!("Failed to cache preference for {}: {:#}", name, e);
            }
        }
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Resolve the zone of instance `name`
    pub async fn resolve_instance(
        &self,
        name: &str,
        zone: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<InstanceLocation> {
        let key = format!("instance/{}", name);
        let result = self.resolve_instance_inner(&key, name, zone, cancel).await;
        self.finish(&key, result, |loc| format!("{} is in {}", loc.name, loc.zone))
    }

    async fn resolve_instance_inner(
        &self,
        key: &str,
        name: &str,
        zone: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<InstanceLocation> {
        let api = self.api.as_ref();
        let project = self.project().to_string();
        let location = |zone: &str, use_iap: Option<bool>, via| InstanceLocation {
            name: name.to_string(),
            project: project.clone(),
            zone: zone.to_string(),
            use_iap,
            via,
        };

        if let Some(zone) = zone {
            self.progress.update(key, format!("Looking up {} in {}", name, zone));
            return match guarded(cancel, self.api.get_instance(zone, name)).await? {
                Ok(_) => Ok(location(zone, None, ResolvedVia::Explicit)),
                Err(e) if e.is_not_found() => Err(Error::not_found("instance", name, &project)),
                Err(e) => Err(Error::upstream("get instance", format!("zone {}", zone), e)),
            };
        }

        if let Some(hint) = self.cached_hint(key, name, ResourceKind::Instance) {
            self.progress.update(key, format!("Checking cached zone {}", hint.location));
            match guarded(cancel, self.api.get_instance(&hint.location, name)).await? {
                Ok(_) => {
                    tracing::info!("Resolved instance {} from cache: {}", name, hint.location);
                    return Ok(location(&hint.location, hint.use_iap, ResolvedVia::Cache));
                }
                Err(e) => {
                    tracing::debug!("Cached zone {} for {} is stale: {}", hint.location, name, e);
                    self.progress.info(key, "cached zone is stale, scanning");
                }
            }
        }

        self.progress.update(key, "Scanning instances in all zones");
        let scope = format!("project {}", project);
        let found = find_in_pages(
            ScanLabel {
                op: "list instances",
                scope: &scope,
            },
            cancel,
            move |token| api.aggregated_instances(token),
            |scoped| scoped.item.name == name,
        )
        .await?;

        let Some(found) = found else {
            return Err(Error::not_found("instance", name, &project));
        };

        tracing::info!("Resolved instance {} by scan: {}", name, found.scope);
        let hint = LocationHint::new(&project, ResourceKind::Instance, &found.scope);
        let use_iap = self.remember(name, hint);
        Ok(location(found.scope.name(), use_iap, ResolvedVia::Scan))
    }

    // =========================================================================
    // Managed instance groups
    // =========================================================================

    /// Resolve the zone or region of MIG `name`
    pub async fn resolve_mig(
        &self,
        name: &str,
        scope: Option<Scope>,
        cancel: &CancellationToken,
    ) -> Result<MigLocation> {
        let key = format!("mig/{}", name);
        let result = self.resolve_mig_inner(&key, name, scope, cancel).await;
        self.finish(&key, result, |loc| format!("{} is in {}", loc.name, loc.scope))
    }

    async fn resolve_mig_inner(
        &self,
        key: &str,
        name: &str,
        scope: Option<Scope>,
        cancel: &CancellationToken,
    ) -> Result<MigLocation> {
        let api = self.api.as_ref();
        let project = self.project().to_string();
        let location = |scope: Scope, use_iap: Option<bool>, via| MigLocation {
            name: name.to_string(),
            project: project.clone(),
            scope,
            use_iap,
            via,
        };

        if let Some(scope) = scope {
            self.progress.update(key, format!("Looking up {} in {}", name, scope));
            return match guarded(cancel, self.api.get_instance_group_manager(&scope, name)).await? {
                Ok(_) => Ok(location(scope, None, ResolvedVia::Explicit)),
                Err(e) if e.is_not_found() => {
                    Err(Error::not_found("managed instance group", name, &project))
                }
                Err(e) => Err(Error::upstream(
                    "get instance group manager",
                    scope.to_string(),
                    e,
                )),
            };
        }

        if let Some(hint) = self.cached_hint(key, name, ResourceKind::Mig) {
            let cached = hint.scope();
            self.progress.update(key, format!("Checking cached location {}", cached));
            match guarded(cancel, self.api.get_instance_group_manager(&cached, name)).await? {
                Ok(_) => {
                    tracing::info!("Resolved MIG {} from cache: {}", name, cached);
                    return Ok(location(cached, hint.use_iap, ResolvedVia::Cache));
                }
                Err(e) => {
                    tracing::debug!("Cached location {} for MIG {} is stale: {}", cached, name, e);
                    self.progress.info(key, "cached location is stale, scanning");
                }
            }
        }

        self.progress.update(key, "Scanning instance groups in all zones and regions");
        let label_scope = format!("project {}", project);
        let found = find_in_pages(
            ScanLabel {
                op: "list instance group managers",
                scope: &label_scope,
            },
            cancel,
            move |token| api.aggregated_instance_group_managers(token),
            |scoped| scoped.item.name == name,
        )
        .await?;

        let (scope, via) = match found {
            Some(found) => (found.scope, ResolvedVia::Scan),
            None => {
                let regions = self.regions(cancel).await?;
                self.progress
                    .update(key, format!("Probing {} regions", regions.len()));
                let region = probe::probe_regions(
                    self.api.clone(),
                    name,
                    regions,
                    self.probe_concurrency,
                    cancel,
                )
                .await?
                .ok_or_else(|| Error::not_found("managed instance group", name, &project))?;
                (Scope::Region(region), ResolvedVia::RegionProbe)
            }
        };

        tracing::info!("Resolved MIG {} via {:?}: {}", name, via, scope);
        let use_iap = self.remember(name, LocationHint::new(&project, ResourceKind::Mig, &scope));
        Ok(location(scope, use_iap, via))
    }

    /// Resolve MIG `name` and pick the member instance to use
    pub async fn resolve_mig_instance(
        &self,
        name: &str,
        scope: Option<Scope>,
        cancel: &CancellationToken,
    ) -> Result<MigInstance> {
        let mig = self.resolve_mig(name, scope, cancel).await?;
        let api = self.api.as_ref();
        let mig_scope = &mig.scope;
        let label_scope = mig_scope.to_string();
        let members = collect_pages(
            ScanLabel {
                op: "list managed instances",
                scope: &label_scope,
            },
            cancel,
            move |token| api.list_managed_instances(mig_scope, name, token),
        )
        .await?;

        let instance = select_preferred(&members)
            .cloned()
            .ok_or_else(|| Error::not_found("member instance of group", name, self.project()))?;

        tracing::debug!(
            "MIG {} has {} member(s), selected {} ({})",
            name,
            members.len(),
            instance.name,
            instance.status
        );
        Ok(MigInstance { mig, instance })
    }

    /// Regions of the project, derived from its zones (cached when possible)
    async fn regions(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let api = self.api.as_ref();
        let project = self.project();
        let cached = self.cache.as_ref().and_then(|c| c.zones(project));

        let zones = match cached {
            Some(zones) => zones,
            None => {
                let scope = format!("project {}", project);
                let zones = collect_pages(
                    ScanLabel {
                        op: "list zones",
                        scope: &scope,
                    },
                    cancel,
                    move |token| api.list_zones(token),
                )
                .await?;
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.set_zones(project, zones.clone()) {
                        tracing::warn!("Failed to cache zones of {}: {:#}", project, e);
                    }
                }
                zones
            }
        };

        let regions: BTreeSet<&str> = zones.iter().map(|z| region_of_zone(z)).collect();
        Ok(regions.into_iter().map(str::to_string).collect())
    }

    // =========================================================================
    // Cache warm-up
    // =========================================================================

    /// List every instance and MIG once and store all locations.
    /// Returns the number of hints written.
    pub async fn warm_cache(&self, cancel: &CancellationToken) -> Result<usize> {
        let key = "cache/warm";
        let result = self.warm_cache_inner(key, cancel).await;
        self.finish(key, result, |n| format!("cached {} locations", n))
    }

    async fn warm_cache_inner(&self, key: &str, cancel: &CancellationToken) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let api = self.api.as_ref();
        let project = self.project().to_string();
        let scope = format!("project {}", project);

        self.progress.update(key, "Listing instances and instance groups");
        let (migs, instances) = tokio::try_join!(
            collect_pages(
                ScanLabel {
                    op: "list instance group managers",
                    scope: &scope,
                },
                cancel,
                move |token| api.aggregated_instance_group_managers(token),
            ),
            collect_pages(
                ScanLabel {
                    op: "list instances",
                    scope: &scope,
                },
                cancel,
                move |token| api.aggregated_instances(token),
            ),
        )?;

        // Instances go in last: on a name clash the MIG hint is replaced and
        // later MIG lookups reject it by kind
        let mut hints: HashMap<String, LocationHint> = HashMap::new();
        for mig in migs {
            let hint = LocationHint::new(&project, ResourceKind::Mig, &mig.scope);
            hints.insert(mig.item.name, hint);
        }
        for instance in instances {
            let hint = LocationHint::new(&project, ResourceKind::Instance, &instance.scope);
            hints.insert(instance.item.name, hint);
        }

        for (name, hint) in hints.iter_mut() {
            hint.use_iap = cache
                .get_scoped(name, &project)
                .filter(|prev| prev.kind == hint.kind)
                .and_then(|prev| prev.use_iap);
        }

        let count = hints.len();
        if let Err(e) = cache.set_batch(hints) {
            tracing::warn!("Failed to write warmed cache: {:#}", e);
            return Ok(0);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileCache;
    use crate::gcp::fake::{igm, instance, member, FakeCompute};
    use crate::progress::recorder::Recorder;
    use std::net::IpAddr;
    use std::time::Duration;

    const PROJECT: &str = "project-b";

    fn fleet() -> FakeCompute {
        let mut api = FakeCompute::new(PROJECT);
        api.instances = vec![
            instance("db-1", "us-east1-b", "default", "10.0.0.2", None),
            instance("web-1", "us-east1-c", "default", "10.0.0.3", None),
            instance("web-2", "europe-west1-b", "default", "10.1.0.3", None),
            instance("batch-1", "asia-east1-a", "default", "10.2.0.3", None),
            instance("target", "asia-east1-b", "default", "10.2.0.4", None),
        ];
        api
    }

    fn hint(project: &str, kind: ResourceKind, scope: Scope) -> LocationHint {
        LocationHint::new(project, kind, &scope)
    }

    /// Cache that answers every lookup with the same hint, whatever was asked
    struct StaticCache(LocationHint);

    impl LocationCache for StaticCache {
        fn get(&self, _name: &str) -> Option<LocationHint> {
            Some(self.0.clone())
        }
        fn get_scoped(&self, _name: &str, _project: &str) -> Option<LocationHint> {
            Some(self.0.clone())
        }
        fn set(&self, _name: &str, _hint: LocationHint) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("read-only"))
        }
        fn set_batch(&self, _hints: HashMap<String, LocationHint>) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("read-only"))
        }
        fn zones(&self, _project: &str) -> Option<Vec<String>> {
            None
        }
        fn set_zones(&self, _project: &str, _zones: Vec<String>) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("read-only"))
        }
        fn find_subnets_for_ip(&self, _ip: IpAddr) -> Vec<crate::cache::SubnetEntry> {
            Vec::new()
        }
        fn remember_subnet_batch(&self, _entries: Vec<crate::cache::SubnetEntry>) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("read-only"))
        }
    }

    #[tokio::test]
    async fn test_scan_then_cache_hit_give_same_zone() {
        let api = Arc::new(fleet());
        let cache = Arc::new(FileCache::in_memory());
        let resolver = Resolver::new(api.clone()).with_cache(Some(cache.clone()));
        let cancel = CancellationToken::new();

        let first = resolver.resolve_instance("target", None, &cancel).await.unwrap();
        assert_eq!(first.zone, "asia-east1-b");
        assert_eq!(first.via, ResolvedVia::Scan);
        assert_eq!(cache.get("target").unwrap().location, "asia-east1-b");

        let second = resolver.resolve_instance("target", None, &cancel).await.unwrap();
        assert_eq!(second.zone, first.zone);
        assert_eq!(second.via, ResolvedVia::Cache);
        assert_eq!(api.calls("aggregated_instances"), 3);
        assert_eq!(api.calls("get_instance"), 1);
    }

    #[tokio::test]
    async fn test_scan_stops_at_matching_page() {
        let api = Arc::new(fleet());
        let resolver = Resolver::new(api.clone());
        let loc = resolver
            .resolve_instance("web-1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.zone, "us-east1-c");
        assert_eq!(api.calls("aggregated_instances"), 1);
    }

    #[tokio::test]
    async fn test_explicit_zone_bypasses_cache() {
        let api = Arc::new(fleet());
        let cache = Arc::new(FileCache::in_memory());
        cache
            .set("web-1", hint(PROJECT, ResourceKind::Instance, Scope::Zone("wrong-zone-a".into())))
            .unwrap();
        let resolver = Resolver::new(api.clone()).with_cache(Some(cache.clone()));

        let loc = resolver
            .resolve_instance("web-1", Some("us-east1-c"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.via, ResolvedVia::Explicit);
        assert_eq!(api.calls("get_instance"), 1);
        assert_eq!(api.calls("aggregated_instances"), 0);
        assert_eq!(cache.get("web-1").unwrap().location, "wrong-zone-a");

        let err = resolver
            .resolve_instance("web-1", Some("europe-west1-b"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_hint_for_other_project_is_never_used() {
        let api = Arc::new(fleet());
        let foreign = hint("project-a", ResourceKind::Instance, Scope::Zone("us-east1-c".into()));
        let resolver = Resolver::new(api.clone()).with_cache(Some(Arc::new(StaticCache(foreign))));

        let loc = resolver
            .resolve_instance("web-1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.via, ResolvedVia::Scan);
        assert_eq!(loc.project, PROJECT);
        assert_eq!(api.calls("get_instance"), 0);
    }

    #[tokio::test]
    async fn test_hint_of_wrong_kind_is_rejected() {
        let api = Arc::new(fleet());
        let wrong_kind = hint(PROJECT, ResourceKind::Mig, Scope::Zone("us-east1-c".into()));
        let resolver = Resolver::new(api.clone()).with_cache(Some(Arc::new(StaticCache(wrong_kind))));

        let loc = resolver
            .resolve_instance("web-1", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.via, ResolvedVia::Scan);
        assert_eq!(api.calls("get_instance"), 0);
    }

    #[tokio::test]
    async fn test_stale_hint_falls_through_and_keeps_preference() {
        let api = Arc::new(fleet());
        let cache = Arc::new(FileCache::in_memory());
        cache
            .set(
                "web-2",
                hint(PROJECT, ResourceKind::Instance, Scope::Zone("us-east1-b".into()))
                    .with_iap(Some(true)),
            )
            .unwrap();
        let resolver = Resolver::new(api.clone()).with_cache(Some(cache.clone()));

        let loc = resolver
            .resolve_instance("web-2", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.zone, "europe-west1-b");
        assert_eq!(loc.via, ResolvedVia::Scan);
        assert_eq!(loc.use_iap, Some(true));
        assert_eq!(api.calls("get_instance"), 1);

        let stored = cache.get_scoped("web-2", PROJECT).unwrap();
        assert_eq!(stored.location, "europe-west1-b");
        assert_eq!(stored.use_iap, Some(true));
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_not_fatal() {
        let api = Arc::new(fleet());
        let stale = hint(PROJECT, ResourceKind::Instance, Scope::Zone("us-east1-b".into()));
        let resolver = Resolver::new(api.clone()).with_cache(Some(Arc::new(StaticCache(stale))));
        let loc = resolver
            .resolve_instance("target", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.zone, "asia-east1-b");
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let resolver = Resolver::new(Arc::new(fleet()));
        let err = resolver
            .resolve_instance("ghost", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "instance", .. }));
    }

    #[tokio::test]
    async fn test_scan_error_is_surfaced_with_context() {
        let mut api = fleet();
        api.failures.insert("aggregated_instances", 503);
        let resolver = Resolver::new(Arc::new(api));
        let err = resolver
            .resolve_instance("web-1", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { op: "list instances", .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_lookup() {
        let resolver = Resolver::new(Arc::new(fleet()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolver.resolve_instance("web-1", None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_progress_events_end_once_per_key() {
        let recorder = Arc::new(Recorder::default());
        let resolver = Resolver::new(Arc::new(fleet()))
            .with_cache(Some(Arc::new(FileCache::in_memory())))
            .with_progress(Progress::new(recorder.clone()));
        let cancel = CancellationToken::new();
        resolver.resolve_instance("web-1", None, &cancel).await.unwrap();
        resolver.resolve_instance("ghost", None, &cancel).await.unwrap_err();
        recorder.assert_well_formed();
    }

    #[test]
    fn test_select_preferred_first_running() {
        let members = vec![
            member("n1", "z", "STOPPED"),
            member("n2", "z", "RUNNING"),
            member("n3", "z", "RUNNING"),
        ];
        assert_eq!(select_preferred(&members).unwrap().name, "n2");
    }

    #[test]
    fn test_select_preferred_falls_back_to_first() {
        let members = vec![member("n1", "z", "STOPPED"), member("n2", "z", "STOPPED")];
        assert_eq!(select_preferred(&members).unwrap().name, "n1");
        assert!(select_preferred(&[]).is_none());
    }

    fn mig_fleet() -> FakeCompute {
        let mut api = FakeCompute::new(PROJECT);
        api.igms = vec![
            igm("api", Scope::Zone("us-east1-b".into())),
            igm("worker", Scope::Region("europe-west1".into())),
        ];
        api.members.insert(
            "api".to_string(),
            vec![
                member("api-aaaa", "us-east1-b", "STOPPING"),
                member("api-bbbb", "us-east1-b", "RUNNING"),
            ],
        );
        api.zones = ["r1-a", "r1-b", "r2-a", "r3-a", "r4-a", "r5-a"]
            .iter()
            .map(|z| z.to_string())
            .collect();
        api
    }

    #[tokio::test]
    async fn test_mig_found_by_scan_with_running_member() {
        let api = Arc::new(mig_fleet());
        let cache = Arc::new(FileCache::in_memory());
        let resolver = Resolver::new(api.clone()).with_cache(Some(cache.clone()));

        let resolved = resolver
            .resolve_mig_instance("api", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolved.mig.scope, Scope::Zone("us-east1-b".into()));
        assert_eq!(resolved.mig.via, ResolvedVia::Scan);
        assert_eq!(resolved.instance.name, "api-bbbb");
        assert_eq!(cache.get("api").unwrap().kind, ResourceKind::Mig);

        let again = resolver
            .resolve_mig("api", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.via, ResolvedVia::Cache);
    }

    #[tokio::test]
    async fn test_regional_mig_from_scan_keeps_region() {
        let api = Arc::new(mig_fleet());
        let cache = Arc::new(FileCache::in_memory());
        let resolver = Resolver::new(api).with_cache(Some(cache.clone()));
        let loc = resolver
            .resolve_mig("worker", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.scope, Scope::Region("europe-west1".into()));
        let stored = cache.get("worker").unwrap();
        assert!(stored.regional);
        assert_eq!(stored.scope(), loc.scope);
    }

    #[tokio::test]
    async fn test_empty_group_has_no_member() {
        let api = Arc::new(mig_fleet());
        let resolver = Resolver::new(api);
        let err = resolver
            .resolve_mig_instance("worker", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_region_probe_first_success_wins() {
        let mut api = mig_fleet();
        api.unlisted_igms = vec![igm("hidden", Scope::Region("r3".into()))];
        api.probe_delay = Duration::from_millis(300);
        api.region_faults
            .insert("r3".to_string(), (Duration::from_millis(10), None));
        let api = Arc::new(api);
        let cache = Arc::new(FileCache::in_memory());
        let resolver = Resolver::new(api.clone()).with_cache(Some(cache.clone()));

        let loc = resolver
            .resolve_mig("hidden", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.scope, Scope::Region("r3".into()));
        assert_eq!(loc.via, ResolvedVia::RegionProbe);

        let completed = api.completed_probes();
        assert!(completed.len() <= 5);
        assert_eq!(completed, vec!["r3".to_string()]);
        assert_eq!(api.found_probes(), 1);

        // zone list was cached, region probed result too
        assert_eq!(cache.zones(PROJECT).unwrap().len(), 6);
        assert_eq!(cache.get("hidden").unwrap().location, "r3");
    }

    #[tokio::test]
    async fn test_region_probe_bounded_width() {
        let mut api = mig_fleet();
        api.unlisted_igms = vec![igm("hidden", Scope::Region("r5".into()))];
        let api = Arc::new(api);
        let resolver = Resolver::new(api.clone()).with_probe_concurrency(2);
        let loc = resolver
            .resolve_mig("hidden", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.scope, Scope::Region("r5".into()));
        assert!(api.calls("get_igm") <= 5);
    }

    #[tokio::test]
    async fn test_region_probe_all_missing() {
        let api = Arc::new(mig_fleet());
        let resolver = Resolver::new(api.clone());
        let err = resolver
            .resolve_mig("ghost", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "managed instance group", .. }));
        assert_eq!(api.completed_probes().len(), 5);
    }

    #[tokio::test]
    async fn test_region_probe_error_aborts() {
        let mut api = mig_fleet();
        api.probe_delay = Duration::from_millis(200);
        api.region_faults
            .insert("r2".to_string(), (Duration::from_millis(5), Some(500)));
        let resolver = Resolver::new(Arc::new(api));
        let err = resolver
            .resolve_mig("ghost", None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Upstream { op, scope, .. } => {
                assert_eq!(op, "probe instance group manager");
                assert_eq!(scope, "region r2");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_explicit_region_for_mig() {
        let api = Arc::new(mig_fleet());
        let resolver = Resolver::new(api.clone());
        let loc = resolver
            .resolve_mig(
                "worker",
                Some(Scope::Region("europe-west1".into())),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(loc.via, ResolvedVia::Explicit);
        assert_eq!(api.calls("aggregated_igms"), 0);
    }

    #[tokio::test]
    async fn test_warm_cache_then_resolve_from_cache() {
        let mut api = fleet();
        api.igms = vec![igm("api", Scope::Zone("us-east1-b".into()))];
        let api = Arc::new(api);
        let cache = Arc::new(FileCache::in_memory());
        let resolver = Resolver::new(api.clone()).with_cache(Some(cache.clone()));
        let cancel = CancellationToken::new();

        assert_eq!(resolver.warm_cache(&cancel).await.unwrap(), 6);
        let before = api.calls("aggregated_instances");
        let loc = resolver.resolve_instance("batch-1", None, &cancel).await.unwrap();
        assert_eq!(loc.via, ResolvedVia::Cache);
        assert_eq!(api.calls("aggregated_instances"), before);
    }

    #[tokio::test]
    async fn test_remember_preference() {
        let api = Arc::new(fleet());
        let cache = Arc::new(FileCache::in_memory());
        let resolver = Resolver::new(api).with_cache(Some(cache.clone()));
        let cancel = CancellationToken::new();
        resolver.resolve_instance("db-1", None, &cancel).await.unwrap();
        resolver.remember_preference("db-1", ResourceKind::Instance, true);
        let loc = resolver.resolve_instance("db-1", None, &cancel).await.unwrap();
        assert_eq!(loc.use_iap, Some(true));
    }
}
