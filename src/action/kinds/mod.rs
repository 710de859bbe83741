//! Work functions for each `ActionKind`.

mod ledger;
mod receipts;
mod returns;

use crate::action::registry::ActionKind;
use crate::action::runner::{ActionConfig, RunContext};
use crate::action::types::*;
use crate::portal::{PageRequest, PortalError, PortalFetcher, Record, Session};
use crate::task::{PageData, PagedData, TaskHandle};
use std::collections::BTreeSet;

/// Output of a finished instance together with the sub-work that failed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    pub output: ActionOutput,
    pub failures: FailedWork,
}

impl ActionKind {
    pub async fn execute(
        self,
        ctx: &RunContext<'_>,
        task: &TaskHandle,
        input: &ActionInput,
        config: &ActionConfig,
    ) -> Result<ActionOutcome, ActionError> {
        match self {
            ActionKind::LedgerRecords => ledger::run(ctx, task, input, config).await,
            ActionKind::ReturnHistory => returns::run(ctx, task, input, config).await,
            ActionKind::PaymentReceipts => receipts::run(ctx, task, input, config).await,
        }
    }
}

/// Fetch one report page. An empty report is a successful empty page.
async fn fetch_records(
    fetcher: &dyn PortalFetcher,
    session: &Session,
    request: PageRequest,
) -> Result<PageData<Vec<Record>>, PortalError> {
    match fetcher.fetch_page(session, &request).await {
        Ok(page) => Ok(PageData {
            num_pages: page.num_pages,
            value: page.records,
        }),
        Err(PortalError::NoRecords) => Ok(PageData {
            num_pages: 1,
            value: Vec::new(),
        }),
        Err(e) => Err(e),
    }
}

fn missing_pages<T, E>(paged: &PagedData<T, E>) -> MissingPages {
    if paged.discovery_failed {
        MissingPages::All
    } else {
        MissingPages::Pages(paged.failed_pages())
    }
}

fn non_empty_pages(pages: Option<&Vec<u32>>) -> Option<Vec<u32>> {
    pages.filter(|p| !p.is_empty()).cloned()
}

fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
