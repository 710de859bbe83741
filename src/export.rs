//! JSON export of merged run outputs
//!
//! Output is grouped by action id, one entry per client:
//! `{ "<action>": [ { "client": ..., "records": [...], "units": [...] } ] }`

use crate::action::{ActionId, WorkUnit};
use crate::portal::{ClientId, Record};
use crate::run::MergedOutput;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ClientExport {
    pub client: ClientId,
    pub records: Vec<Record>,
    /// Units that produced the records, so gaps are visible
    pub units: Vec<WorkUnit>,
}

pub type Export = BTreeMap<ActionId, Vec<ClientExport>>;

pub fn build_export(outputs: &[MergedOutput]) -> Export {
    let mut export = Export::new();
    for merged in outputs {
        export
            .entry(merged.action_id.clone())
            .or_default()
            .push(ClientExport {
                client: merged.client_id.clone(),
                records: merged.output.records().cloned().collect(),
                units: merged.output.units.iter().map(|u| u.unit.clone()).collect(),
            });
    }
    export
}

pub fn to_json_string(outputs: &[MergedOutput]) -> Result<String> {
    Ok(serde_json::to_string_pretty(&build_export(outputs))?)
}

pub fn write_json_file<P: AsRef<Path>>(path: P, outputs: &[MergedOutput]) -> Result<()> {
    let path = path.as_ref();
    let content = to_json_string(outputs)?;
    fs::write(path, content).with_context(|| format!("Failed to write export to {:?}", path))?;
    info!("Wrote {} outputs to {:?}", outputs.len(), path);
    Ok(())
}
