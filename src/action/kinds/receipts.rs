use super::{ActionOutcome, dedup_ids};
use crate::action::runner::{ActionConfig, RunContext};
use crate::action::types::*;
use crate::portal::{ItemRequest, PortalError};
use crate::task::{MapResult, TaskHandle, parallel_task_map};
use std::collections::{BTreeMap, BTreeSet};

pub(super) async fn run(
    ctx: &RunContext<'_>,
    task: &TaskHandle,
    input: &ActionInput,
    config: &ActionConfig,
) -> Result<ActionOutcome, ActionError> {
    let session = ctx.session()?;
    let fetcher = ctx.fetcher;
    let ids = dedup_ids(input.item_ids.as_deref().unwrap_or_default());

    task.set_status(format!("Fetching {} receipts", ids.len())).await;
    let results = parallel_task_map(
        task,
        ids,
        config.max_concurrent,
        |id| format!("Receipt {}", id),
        |id, _item_task| async move {
            match fetcher.fetch_item(session, &ItemRequest { item_id: id }).await {
                Ok(record) => Ok(vec![record]),
                Err(PortalError::NoRecords) => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        },
    )
    .await?;

    let mut units = BTreeMap::new();
    let mut failed = BTreeSet::new();
    for MapResult { item, result } in results {
        match result {
            Ok(records) => {
                units.insert(WorkUnit::Item { id: item }, records);
            }
            Err(_) => {
                failed.insert(item);
            }
        }
    }

    Ok(ActionOutcome {
        output: ActionOutput::from_units(units),
        failures: if failed.is_empty() {
            FailedWork::None
        } else {
            FailedWork::Items(failed)
        },
    })
}
