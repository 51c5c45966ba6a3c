//! Continuation-token pagination shared by every list call.

use super::http::ApiError;
use crate::error::{Error, Result};
use std::future::Future;
use std::ops::ControlFlow;
use tokio_util::sync::CancellationToken;

/// One page of a list response
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}

/// What a scan is doing and where, used to label upstream errors
#[derive(Debug, Clone, Copy)]
pub struct ScanLabel<'a> {
    pub op: &'static str,
    pub scope: &'a str,
}

/// Fetch pages until `visit` breaks or the listing is exhausted.
///
/// Returns the break value, or `None` when every page was visited.
/// Cancellation is checked while each page is in flight.
pub async fn scan_pages<T, B, F, Fut, V>(
    label: ScanLabel<'_>,
    cancel: &CancellationToken,
    mut fetch: F,
    mut visit: V,
) -> Result<Option<B>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = std::result::Result<Page<T>, ApiError>>,
    V: FnMut(Vec<T>) -> ControlFlow<B>,
{
    let mut token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            page = fetch(token.take()) => {
                page.map_err(|source| Error::upstream(label.op, label.scope, source))?
            }
        };
        pages += 1;

        if let ControlFlow::Break(found) = visit(page.items) {
            tracing::debug!("{}: stopped after {} page(s)", label.op, pages);
            return Ok(Some(found));
        }

        match page.next_page_token.filter(|t| !t.is_empty()) {
            Some(next) => token = Some(next),
            None => {
                tracing::debug!("{}: exhausted after {} page(s)", label.op, pages);
                return Ok(None);
            }
        }
    }
}

/// Fetch and concatenate every page
pub async fn collect_pages<T, F, Fut>(
    label: ScanLabel<'_>,
    cancel: &CancellationToken,
    fetch: F,
) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = std::result::Result<Page<T>, ApiError>>,
{
    let mut all = Vec::new();
    scan_pages::<T, (), _, _, _>(label, cancel, fetch, |items| {
        all.extend(items);
        ControlFlow::Continue(())
    })
    .await?;
    Ok(all)
}

/// Return the first item matching `pred`, stopping the scan on the page that holds it
pub async fn find_in_pages<T, F, Fut, P>(
    label: ScanLabel<'_>,
    cancel: &CancellationToken,
    fetch: F,
    mut pred: P,
) -> Result<Option<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = std::result::Result<Page<T>, ApiError>>,
    P: FnMut(&T) -> bool,
{
    scan_pages(label, cancel, fetch, |items| {
        match items.into_iter().find(|item| pred(item)) {
            Some(found) => ControlFlow::Break(found),
            None => ControlFlow::Continue(()),
        }
    })
    .await
}
