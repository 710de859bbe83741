use super::{ActionOutcome, fetch_records, missing_pages, non_empty_pages};
use crate::action::runner::{ActionConfig, RunContext};
use crate::action::types::*;
use crate::portal::{PageRequest, ReportKind};
use crate::task::{TaskHandle, get_paged_data};
use std::collections::BTreeMap;
use tracing::debug;

pub(super) async fn run(
    ctx: &RunContext<'_>,
    task: &TaskHandle,
    input: &ActionInput,
    config: &ActionConfig,
) -> Result<ActionOutcome, ActionError> {
    let session = ctx.session()?;
    let fetcher = ctx.fetcher;
    let from_date = input.from_date.clone().unwrap_or_default();
    let to_date = input.to_date.clone().unwrap_or_default();

    task.set_status("Fetching ledger pages").await;
    let paged = get_paged_data(
        task,
        non_empty_pages(input.pages.as_ref()),
        config.max_concurrent,
        |page, _page_task| {
            let request = PageRequest {
                report: ReportKind::Ledger,
                tax_type: None,
                from_date: from_date.clone(),
                to_date: to_date.clone(),
                page,
            };
            fetch_records(fetcher, session, request)
        },
    )
    .await?;

    let units: BTreeMap<WorkUnit, _> = paged
        .successful()
        .map(|(page, records)| (WorkUnit::Page { page }, records.clone()))
        .collect();
    let missing = missing_pages(&paged);
    debug!(
        "Ledger: {} pages fetched, missing {:?}",
        units.len(),
        missing
    );

    Ok(ActionOutcome {
        output: ActionOutput::from_units(units),
        failures: if missing.is_empty() {
            FailedWork::None
        } else {
            FailedWork::Pages(missing)
        },
    })
}
