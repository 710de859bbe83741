use crate::portal::{PortalError, Record, TaxTypeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Identifier of an action in the registry, e.g. `ledger_records`
pub type ActionId = String;

/// Unique identifier for one (run, client, action) execution
pub type InstanceId = Uuid;

/// Input of an action instance.
///
/// Which fields matter depends on the action. The page and item fields
/// narrow the work down and are normally only set by a retry.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionInput {
    /// `dd/mm/yyyy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<String>,
    /// `dd/mm/yyyy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_date: Option<String>,
    /// Restrict work to these tax types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_types: Option<Vec<TaxTypeId>>,
    /// Pages of a single paged report. Absent or empty means every page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<u32>>,
    /// Pages per tax type. A tax type without an entry gets every page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_type_pages: Option<BTreeMap<TaxTypeId, Vec<u32>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_ids: Option<Vec<String>>,
}

/// Minimal description of the work a failed instance still owes
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_types: Option<Vec<TaxTypeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_type_pages: Option<BTreeMap<TaxTypeId, Vec<u32>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_ids: Option<Vec<String>>,
}

impl RetryInput {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ActionInput {
    /// Input for a fresh instance that redoes only the work in `retry`
    pub fn with_retry(&self, retry: &RetryInput) -> ActionInput {
        let mut input = self.clone();
        if let Some(pages) = &retry.pages {
            input.pages = if pages.is_empty() { None } else { Some(pages.clone()) };
        }
        if let Some(tax_types) = &retry.tax_types {
            input.tax_types = Some(tax_types.clone());
        }
        if let Some(tax_type_pages) = &retry.tax_type_pages {
            input.tax_type_pages = Some(tax_type_pages.clone());
        }
        if let Some(item_ids) = &retry.item_ids {
            input.item_ids = Some(item_ids.clone());
        }
        input
    }

    /// Fill fields left unset from `defaults`
    pub fn or_defaults(mut self, defaults: &ActionInput) -> ActionInput {
        fn fill<T: Clone>(field: &mut Option<T>, default: &Option<T>) {
            if field.is_none() {
                field.clone_from(default);
            }
        }
        fill(&mut self.from_date, &defaults.from_date);
        fill(&mut self.to_date, &defaults.to_date);
        fill(&mut self.tax_types, &defaults.tax_types);
        fill(&mut self.pages, &defaults.pages);
        fill(&mut self.tax_type_pages, &defaults.tax_type_pages);
        fill(&mut self.item_ids, &defaults.item_ids);
        self
    }
}

/// Smallest piece of work whose success is tracked separately
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    Page { page: u32 },
    TaxTypePage { tax_type: TaxTypeId, page: u32 },
    Item { id: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UnitOutput {
    pub unit: WorkUnit,
    pub records: Vec<Record>,
}

/// Records retrieved by an instance, grouped by the unit that produced them
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ActionOutput {
    /// Sorted by unit, at most one entry per unit
    pub units: Vec<UnitOutput>,
}

impl ActionOutput {
    pub fn from_units(units: BTreeMap<WorkUnit, Vec<Record>>) -> Self {
        Self {
            units: units
                .into_iter()
                .map(|(unit, records)| UnitOutput { unit, records })
                .collect(),
        }
    }

    pub fn contains(&self, unit: &WorkUnit) -> bool {
        self.units.iter().any(|u| &u.unit == unit)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.units.iter().flat_map(|u| u.records.iter())
    }

    pub fn record_count(&self) -> usize {
        self.units.iter().map(|u| u.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Pages of one report that still have to be fetched
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingPages {
    /// Page 1 failed, so the page count was never learned
    All,
    Pages(BTreeSet<u32>),
}

impl MissingPages {
    pub fn is_empty(&self) -> bool {
        matches!(self, MissingPages::Pages(pages) if pages.is_empty())
    }

    fn to_list(&self) -> Vec<u32> {
        match self {
            MissingPages::All => Vec::new(),
            MissingPages::Pages(pages) => pages.iter().copied().collect(),
        }
    }
}

/// Failure bookkeeping of an instance, one variant per kind of sub-work
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailedWork {
    #[default]
    None,
    Pages(MissingPages),
    TaxTypes(BTreeMap<TaxTypeId, MissingPages>),
    Items(BTreeSet<String>),
}

impl FailedWork {
    pub fn is_empty(&self) -> bool {
        match self {
            FailedWork::None => true,
            FailedWork::Pages(missing) => missing.is_empty(),
            FailedWork::TaxTypes(by_tax_type) => by_tax_type.values().all(MissingPages::is_empty),
            FailedWork::Items(items) => items.is_empty(),
        }
    }

    /// Input fragment that requests exactly the failed sub-work
    pub fn retry_input(&self) -> RetryInput {
        match self {
            FailedWork::None => RetryInput::default(),
            FailedWork::Pages(missing) => RetryInput {
                pages: Some(missing.to_list()),
                ..Default::default()
            },
            FailedWork::TaxTypes(by_tax_type) => {
                let failed: BTreeMap<&TaxTypeId, &MissingPages> = by_tax_type
                    .iter()
                    .filter(|(_, missing)| !missing.is_empty())
                    .collect();
                RetryInput {
                    tax_types: Some(failed.keys().map(|&t| t.clone()).collect()),
                    tax_type_pages: Some(
                        failed
                            .iter()
                            .filter_map(|(&tax_type, missing)| match missing {
                                MissingPages::All => None,
                                MissingPages::Pages(_) => Some((tax_type.clone(), missing.to_list())),
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }
            }
            FailedWork::Items(items) => RetryInput {
                item_ids: Some(items.iter().cloned().collect()),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{field} '{value}' is not a valid dd/mm/yyyy date")]
    MalformedDate { field: &'static str, value: String },
    #[error("from date {from} is after to date {to}")]
    DateOrder { from: String, to: String },
    #[error("{0} must not be empty")]
    EmptyList(&'static str),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("Session error: {0}")]
    Session(String),
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),
    #[error("Fetch failed: {0}")]
    Fetch(String),
    #[error("{0}")]
    Internal(String),
}

impl ActionError {
    /// Errors a later run can fix on its own
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ActionError::Validation(_))
    }
}

impl From<PortalError> for ActionError {
    fn from(e: PortalError) -> Self {
        match e {
            PortalError::Session(msg) => ActionError::Session(msg),
            other => ActionError::Fetch(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(e: anyhow::Error) -> Self {
        ActionError::Internal(e.to_string())
    }
}
