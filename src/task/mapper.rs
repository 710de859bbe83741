//! Bounded-concurrency mapping over lists and paged reports.
//!
//! Both primitives create one child task per item, keep results in input
//! order and never let one failing item abort its siblings.

use crate::task::tree::TaskHandle;
use crate::task::types::TaskOptions;
use crate::task::wrapper::{TaskFunctionOptions, run_in_task};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::future::Future;
use tracing::debug;

/// Number of items fetched at the same time unless configured otherwise
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Outcome for one mapped item
#[derive(Debug)]
pub struct MapResult<I, T, E> {
    pub item: I,
    pub result: Result<T, E>,
}

/// Run `func` once per item with at most `max_concurrent` in flight.
///
/// Items beyond the bound are queued, not rejected. Result `i` belongs to
/// `items[i]` whatever the completion order.
pub async fn parallel_task_map<I, T, E, F, Fut, N>(
    task: &TaskHandle,
    items: Vec<I>,
    max_concurrent: usize,
    title: N,
    func: F,
) -> Result<Vec<MapResult<I, T, E>>>
where
    I: Clone,
    E: Display,
    N: Fn(&I) -> String,
    F: Fn(I, TaskHandle) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut children = Vec::with_capacity(items.len());
    for item in &items {
        children.push(task.create_child(title(item), TaskOptions::default()).await?);
    }

    let options = TaskFunctionOptions::default();
    let results = stream::iter(items.into_iter().zip(children))
        .map(|(item, child)| {
            let work = func(item.clone(), child.clone());
            let options = &options;
            async move {
                let result = run_in_task(&child, options, work).await;
                MapResult { item, result }
            }
        })
        .buffered(max_concurrent.max(1))
        .collect::<Vec<_>>()
        .await;

    Ok(results)
}

/// One fetched page together with the page count the portal reported
#[derive(Debug, Clone)]
pub struct PageData<T> {
    pub num_pages: u32,
    pub value: T,
}

/// Results of a paged fetch keyed by page number
#[derive(Debug)]
pub struct PagedData<T, E> {
    /// `None` when no page could be fetched
    pub num_pages: Option<u32>,
    pub pages: BTreeMap<u32, Result<T, E>>,
    /// Page 1 failed while the page count was still unknown
    pub discovery_failed: bool,
}

impl<T, E> PagedData<T, E> {
    pub fn failed_pages(&self) -> BTreeSet<u32> {
        self.pages
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(&page, _)| page)
            .collect()
    }

    pub fn successful(&self) -> impl Iterator<Item = (u32, &T)> {
        self.pages
            .iter()
            .filter_map(|(&page, result)| result.as_ref().ok().map(|value| (page, value)))
    }
}

/// Fetch a paged report.
///
/// With no `pages` requested, page 1 is fetched first to learn the page
/// count and pages `2..=num_pages` follow concurrently. With an explicit
/// list only those pages are fetched.
pub async fn get_paged_data<T, E, F, Fut>(
    task: &TaskHandle,
    pages: Option<Vec<u32>>,
    max_concurrent: usize,
    get_data: F,
) -> Result<PagedData<T, E>>
where
    E: Display,
    F: Fn(u32, TaskHandle) -> Fut,
    Fut: Future<Output = Result<PageData<T>, E>>,
{
    let requested: Vec<u32> = pages
        .unwrap_or_default()
        .into_iter()
        .filter(|&page| page > 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut paged = PagedData {
        num_pages: None,
        pages: BTreeMap::new(),
        discovery_failed: false,
    };

    let remaining = if requested.is_empty() {
        task.set_progress_max(None).await;
        let first = task.create_child("Page 1", TaskOptions::default()).await?;
        let options = TaskFunctionOptions::default();
        match run_in_task(&first, &options, get_data(1, first.clone())).await {
            Ok(data) => {
                let num_pages = data.num_pages.max(1);
                debug!("Paged fetch discovered {} pages", num_pages);
                task.set_progress_max(Some(num_pages as f64)).await;
                paged.num_pages = Some(num_pages);
                paged.pages.insert(1, Ok(data.value));
                (2..=num_pages).collect()
            }
            Err(e) => {
                paged.pages.insert(1, Err(e));
                paged.discovery_failed = true;
                return Ok(paged);
            }
        }
    } else {
        task.set_progress_max(Some(requested.len() as f64)).await;
        requested
    };

    let results = parallel_task_map(
        task,
        remaining,
        max_concurrent,
        |page| format!("Page {}", page),
        |page, child| get_data(page, child),
    )
    .await?;

    for MapResult { item: page, result } in results {
        match result {
            Ok(data) => {
                paged.num_pages = Some(paged.num_pages.unwrap_or(0).max(data.num_pages));
                paged.pages.insert(page, Ok(data.value));
            }
            Err(e) => {
                paged.pages.insert(page, Err(e));
            }
        }
    }

    Ok(paged)
}
