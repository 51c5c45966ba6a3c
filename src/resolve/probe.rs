//! Parallel regional probing for managed instance groups.
//!
//! Up to `concurrency` regions are asked at once whether they hold the MIG.
//! The first region that answers yes cancels every sibling probe; a sibling
//! that observes the cancellation reports [`ProbeOutcome::Cancelled`] rather
//! than a miss.

use crate::error::{Error, Result};
use crate::gcp::compute::{ComputeApi, Scope};
use crate::gcp::http::ApiError;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
enum ProbeOutcome {
    Found(String),
    Missing,
    Cancelled,
    Failed(String, ApiError),
}

async fn probe_one(
    api: Arc<dyn ComputeApi>,
    slots: Arc<Semaphore>,
    race: CancellationToken,
    region: String,
    name: String,
) -> ProbeOutcome {
    let _permit = tokio::select! {
        biased;
        _ = race.cancelled() => return ProbeOutcome::Cancelled,
        permit = slots.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return ProbeOutcome::Cancelled,
        },
    };

    let scope = Scope::Region(region.clone());
    tokio::select! {
        biased;
        _ = race.cancelled() => ProbeOutcome::Cancelled,
        result = api.get_instance_group_manager(&scope, &name) => match result {
            Ok(_) => ProbeOutcome::Found(region),
            Err(e) if e.is_not_found() => ProbeOutcome::Missing,
            Err(e) => ProbeOutcome::Failed(region, e),
        },
    }
}

/// Find the region holding the regional MIG `name`.
///
/// `Ok(None)` means every region answered "not found". Any other API error
/// stops the remaining probes and is returned.
pub(crate) async fn probe_regions(
    api: Arc<dyn ComputeApi>,
    name: &str,
    regions: Vec<String>,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    if regions.is_empty() {
        return Ok(None);
    }

    let width = concurrency.clamp(1, regions.len());
    let slots = Arc::new(Semaphore::new(width));
    let race = cancel.child_token();
    let mut workers = JoinSet::new();

    tracing::debug!("Probing {} regions for MIG {} ({} at a time)", regions.len(), name, width);

    for region in regions {
        workers.spawn(probe_one(
            api.clone(),
            slots.clone(),
            race.clone(),
            region,
            name.to_string(),
        ));
    }

    let mut winner: Option<String> = None;
    let mut failure: Option<Error> = None;
    let mut missing = 0usize;
    let mut cancelled = 0usize;

    while let Some(joined) = workers.join_next().await {
        let settled = winner.is_some() || failure.is_some();
        match joined {
            Ok(ProbeOutcome::Found(region)) if !settled => {
                tracing::debug!("MIG {} found in region {}", name, region);
                winner = Some(region);
                race.cancel();
            }
            Ok(ProbeOutcome::Failed(region, e)) if !settled => {
                failure = Some(Error::upstream(
                    "probe instance group manager",
                    format!("region {}", region),
                    e,
                ));
                race.cancel();
            }
            Ok(ProbeOutcome::Missing) => missing += 1,
            Ok(ProbeOutcome::Cancelled) => cancelled += 1,
            // A late success or error after the race was decided
            Ok(other) => tracing::debug!("Ignoring late probe outcome {:?}", other),
            Err(join_err) if !settled => {
                failure = Some(Error::upstream(
                    "probe instance group manager",
                    "worker task",
                    ApiError::Other(anyhow::anyhow!("probe task failed: {}", join_err)),
                ));
                race.cancel();
            }
            Err(join_err) => tracing::warn!("Probe task failed after race settled: {}", join_err),
        }
    }

    tracing::debug!("Probe finished: {} missing, {} cancelled", missing, cancelled);

    if let Some(region) = winner {
        return Ok(Some(region));
    }
    if let Some(err) = failure {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(None)
}
