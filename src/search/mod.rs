//! Cross-project search.
//!
//! A query fans out over projects, at most `concurrency` projects at a time.
//! Inside one project the active providers run one after another. A provider
//! failure becomes a [`SearchWarning`] for its (project, kind) pair and never
//! stops other work; only configuration problems fail the whole call.

pub mod providers;

use crate::error::{Error, Result};
use crate::progress::Progress;
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

/// Default number of projects searched at once
pub const DEFAULT_SEARCH_CONCURRENCY: usize = 4;

/// Warning kind for a project whose whole search failed
pub const ALL_KINDS: &str = "*";

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Case-insensitive substring match after trimming both sides.
/// An empty term matches nothing.
pub fn matches_query(candidate: &str, term: &str) -> bool {
    let term = normalize(term);
    !term.is_empty() && normalize(candidate).contains(&term)
}

/// `true` when any of `fields` matches `term`
pub fn matches_any<'a>(fields: impl IntoIterator<Item = &'a str>, term: &str) -> bool {
    fields.into_iter().any(|f| matches_query(f, term))
}

/// Trim, drop empties and duplicates, keep first-seen order
pub fn normalize_projects(projects: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    projects
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty() && seen.insert(p.to_string()))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    term: String,
    kinds: Option<BTreeSet<String>>,
}

impl SearchQuery {
    pub fn new(term: &str) -> Self {
        Self {
            term: normalize(term),
            kinds: None,
        }
    }

    /// Restrict the search to these provider kinds; an empty list means all
    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let kinds: BTreeSet<String> = kinds
            .into_iter()
            .map(|k| normalize(k.as_ref()))
            .filter(|k| !k.is_empty())
            .collect();
        self.kinds = (!kinds.is_empty()).then_some(kinds);
        self
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn kinds(&self) -> Option<&BTreeSet<String>> {
        self.kinds.as_ref()
    }

    /// Whether a provider of `kind` should run for this query
    pub fn wants(&self, kind: &str) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&normalize(kind)))
    }

    pub fn matches(&self, candidate: &str) -> bool {
        matches_query(candidate, &self.term)
    }

    pub fn matches_any<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> bool {
        matches_any(fields, &self.term)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub kind: String,
    pub name: String,
    pub project: String,
    pub location: String,
    pub detail: BTreeMap<String, String>,
}

impl SearchResult {
    fn sort_key(&self) -> (&str, &str, &str, &str) {
        (&self.project, &self.kind, &self.name, &self.location)
    }
}

fn display_error<S: Serializer>(error: &anyhow::Error, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{:#}", error))
}

/// A (project, kind) pair that could not be searched
#[derive(Debug, Serialize)]
pub struct SearchWarning {
    pub project: String,
    pub kind: String,
    #[serde(serialize_with = "display_error")]
    pub error: anyhow::Error,
}

#[derive(Debug, Default, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub warnings: Vec<SearchWarning>,
}

/// Searches one resource kind in one project at a time
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> &str;

    /// Matching resources of this kind in `project`. The provider builds its
    /// own project-scoped client; it is never called for a filtered-out kind.
    async fn search(
        &self,
        project: &str,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<SearchResult>>;
}

#[derive(Default)]
struct Accumulator {
    results: Mutex<Vec<SearchResult>>,
    warnings: Mutex<Vec<SearchWarning>>,
}

impl Accumulator {
    fn add_results(&self, found: Vec<SearchResult>) {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(found);
    }

    fn add_warning(&self, warning: SearchWarning) {
        self.warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(warning);
    }

    fn take(&self) -> SearchOutcome {
        let mut results =
            std::mem::take(&mut *self.results.lock().unwrap_or_else(|p| p.into_inner()));
        let mut warnings =
            std::mem::take(&mut *self.warnings.lock().unwrap_or_else(|p| p.into_inner()));
        results.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        warnings.sort_by(|a, b| (&a.project, &a.kind).cmp(&(&b.project, &b.kind)));
        SearchOutcome { results, warnings }
    }
}

pub struct SearchEngine {
    providers: Vec<Arc<dyn Provider>>,
    concurrency: usize,
    progress: Progress,
}

impl SearchEngine {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers,
            concurrency: DEFAULT_SEARCH_CONCURRENCY,
            progress: Progress::none(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.kind()).collect()
    }

    /// Matches only; warnings are logged and dropped
    pub async fn search(
        &self,
        projects: &[String],
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        let outcome = self.search_with_warnings(projects, query, cancel).await?;
        for warning in &outcome.warnings {
            tracing::warn!(
                "Search of {} in {} failed: {:#}",
                warning.kind,
                warning.project,
                warning.error
            );
        }
        Ok(outcome.results)
    }

    /// Search every project, collecting per-(project, kind) failures as warnings
    pub async fn search_with_warnings(
        &self,
        projects: &[String],
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        let projects = normalize_projects(projects);
        if projects.is_empty() {
            return Err(Error::InvalidInput("no projects to search".to_string()));
        }
        if self.providers.is_empty() {
            return Err(Error::InvalidInput("no search providers configured".to_string()));
        }
        if query.term().is_empty() {
            return Err(Error::InvalidInput("search term is empty".to_string()));
        }

        let active: Vec<Arc<dyn Provider>> = self
            .providers
            .iter()
            .filter(|p| query.wants(p.kind()))
            .cloned()
            .collect();
        if active.is_empty() {
            let requested = query
                .kinds()
                .map(|k| k.iter().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            return Err(Error::InvalidInput(format!(
                "no provider for kind(s) {}; available: {}",
                requested,
                self.kinds().join(", ")
            )));
        }

        tracing::debug!(
            "Searching '{}' in {} project(s) with {} provider(s), {} at a time",
            query.term(),
            projects.len(),
            active.len(),
            self.concurrency
        );

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let acc = Arc::new(Accumulator::default());
        let active = Arc::new(active);
        let mut workers = JoinSet::new();
        let mut worker_projects: HashMap<task::Id, String> = HashMap::new();

        for project in projects {
            let handle = workers.spawn(search_project(
                project.clone(),
                active.clone(),
                query.clone(),
                slots.clone(),
                acc.clone(),
                self.progress.clone(),
                cancel.clone(),
            ));
            worker_projects.insert(handle.id(), project);
        }

        while let Some(joined) = workers.join_next().await {
            let Err(e) = joined else {
                continue;
            };
            let project = worker_projects.remove(&e.id()).unwrap_or_default();
            tracing::error!("Search worker for {} failed: {}", project, e);
            self.progress
                .fail(&format!("search/{}", project), "search failed", &e);
            acc.add_warning(SearchWarning {
                project,
                kind: ALL_KINDS.to_string(),
                error: anyhow::Error::new(e).context("search task failed"),
            });
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let outcome = acc.take();
        tracing::info!(
            "Search '{}': {} result(s), {} warning(s)",
            query.term(),
            outcome.results.len(),
            outcome.warnings.len()
        );
        Ok(outcome)
    }
}

async fn search_project(
    project: String,
    providers: Arc<Vec<Arc<dyn Provider>>>,
    query: SearchQuery,
    slots: Arc<Semaphore>,
    acc: Arc<Accumulator>,
    progress: Progress,
    cancel: CancellationToken,
) {
    let key = format!("search/{}", project);
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            progress.fail(&key, "search cancelled", &Error::Cancelled);
            return;
        }
        permit = slots.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(e) => {
                progress.fail(&key, "search aborted", &e);
                return;
            }
        },
    };

    let mut found = 0usize;
    let mut failed = 0usize;
    for provider in providers.iter() {
        if cancel.is_cancelled() {
            progress.fail(&key, "search cancelled", &Error::Cancelled);
            return;
        }
        progress.update(&key, format!("Searching {}", provider.kind()));

        match provider.search(&project, &query, &cancel).await {
            Ok(results) => {
                found += results.len();
                acc.add_results(results);
            }
            Err(error) => {
                tracing::debug!("{} in {}: {:#}", provider.kind(), project, error);
                failed += 1;
                acc.add_warning(SearchWarning {
                    project: project.clone(),
                    kind: provider.kind().to_string(),
                    error,
                });
            }
        }
    }

    progress.done(
        &key,
        match failed {
            0 => format!("{} match(es)", found),
            n => format!("{} match(es), {} kind(s) failed", found, n),
        },
    );
}
