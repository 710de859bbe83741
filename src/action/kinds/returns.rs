use super::{ActionOutcome, fetch_records, missing_pages, non_empty_pages};
use crate::action::runner::{ActionConfig, RunContext};
use crate::action::types::*;
use crate::portal::{PageRequest, ReportKind, TaxTypeId};
use crate::task::{TaskFunctionOptions, TaskHandle, TaskOptions, get_paged_data, run_in_task};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Return history is fetched one tax type after another, each as its own
/// paged report.
pub(super) async fn run(
    ctx: &RunContext<'_>,
    task: &TaskHandle,
    input: &ActionInput,
    config: &ActionConfig,
) -> Result<ActionOutcome, ActionError> {
    let session = ctx.session()?;
    let fetcher = ctx.fetcher;
    let registered = ctx.tax_types.ok_or_else(|| {
        ActionError::MissingPrerequisite("tax types of the client are unknown".to_string())
    })?;

    let tax_types: Vec<TaxTypeId> = match &input.tax_types {
        Some(wanted) => {
            for tax_type in wanted.iter().filter(|t| !registered.contains(*t)) {
                warn!("Client is not registered for {}, skipping", tax_type);
            }
            registered
                .iter()
                .filter(|t| wanted.contains(*t))
                .cloned()
                .collect()
        }
        None => registered.to_vec(),
    };

    let from_date = input.from_date.clone().unwrap_or_default();
    let to_date = input.to_date.clone().unwrap_or_default();
    let mut units = BTreeMap::new();
    let mut failures = BTreeMap::new();

    task.set_progress_max(Some(tax_types.len() as f64)).await;
    for tax_type in tax_types {
        let tax_task = task
            .create_child(tax_type.to_string(), TaskOptions::default().unknown_max_progress())
            .await?;
        let pages = input
            .tax_type_pages
            .as_ref()
            .and_then(|by_tax_type| non_empty_pages(by_tax_type.get(&tax_type)));

        // the tax type task ends in the aggregate state of its page tasks
        let paged = run_in_task(
            &tax_task,
            &TaskFunctionOptions::from_children(),
            get_paged_data(&tax_task, pages, config.max_concurrent, |page, _page_task| {
                let request = PageRequest {
                    report: ReportKind::ReturnHistory,
                    tax_type: Some(tax_type.clone()),
                    from_date: from_date.clone(),
                    to_date: to_date.clone(),
                    page,
                };
                fetch_records(fetcher, session, request)
            }),
        )
        .await?;

        for (page, records) in paged.successful() {
            units.insert(
                WorkUnit::TaxTypePage {
                    tax_type: tax_type.clone(),
                    page,
                },
                records.clone(),
            );
        }

        let missing = missing_pages(&paged);
        if !missing.is_empty() {
            debug!("Return history for {}: missing {:?}", tax_type, missing);
            failures.insert(tax_type, missing);
        }
    }

    Ok(ActionOutcome {
        output: ActionOutput::from_units(units),
        failures: if failures.is_empty() {
            FailedWork::None
        } else {
            FailedWork::TaxTypes(failures)
        },
    })
}
