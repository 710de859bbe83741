use crate::action::types::*;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Date format used by the portal
pub const PORTAL_DATE_FORMAT: &str = "%d/%m/%Y";

/// The kinds of work the engine knows how to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Paged ledger report over a date range
    LedgerRecords,
    /// Paged return history, one report per registered tax type
    ReturnHistory,
    /// Individual payment receipts looked up by receipt number
    PaymentReceipts,
}

/// Declarative input checks run before an instance starts
#[derive(Debug, Clone, Default)]
pub struct InputRules {
    pub date_range_required: bool,
    pub item_ids_required: bool,
}

impl InputRules {
    pub fn validate(&self, input: &ActionInput) -> Result<(), ValidationError> {
        if self.date_range_required {
            let from = parse_date("from_date", input.from_date.as_deref())?;
            let to = parse_date("to_date", input.to_date.as_deref())?;
            if from > to {
                return Err(ValidationError::DateOrder {
                    from: input.from_date.clone().unwrap_or_default(),
                    to: input.to_date.clone().unwrap_or_default(),
                });
            }
        }
        if self.item_ids_required {
            match &input.item_ids {
                None => return Err(ValidationError::MissingField("item_ids")),
                Some(ids) if ids.iter().all(|id| id.trim().is_empty()) => {
                    return Err(ValidationError::EmptyList("item_ids"));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn parse_date(field: &'static str, value: Option<&str>) -> Result<NaiveDate, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?;
    NaiveDate::parse_from_str(value.trim(), PORTAL_DATE_FORMAT).map_err(|_| ValidationError::MalformedDate {
        field,
        value: value.to_string(),
    })
}

/// Immutable description of an action
#[derive(Debug, Clone)]
pub struct Action {
    pub id: ActionId,
    pub name: String,
    pub kind: ActionKind,
    /// Needs the client's registered tax types before it can start
    pub requires_tax_types: bool,
    /// Keeps using the logged-in session, which must be closed explicitly afterwards
    pub uses_logged_in_tab: bool,
    pub default_input: ActionInput,
    pub input_rules: InputRules,
}

impl Action {
    pub fn validate_input(&self, input: &ActionInput) -> Result<(), ValidationError> {
        self.input_rules.validate(input)
    }
}

/// Actions available to the orchestrator, created once at startup
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    actions: Vec<Arc<Action>>,
}

impl ActionRegistry {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions: actions.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Action>> {
        self.actions.iter().find(|a| a.id == id).cloned()
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    pub fn ids(&self) -> Vec<ActionId> {
        self.actions.iter().map(|a| a.id.clone()).collect()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new(vec![
            Action {
                id: "ledger_records".to_string(),
                name: "Get ledger records".to_string(),
                kind: ActionKind::LedgerRecords,
                requires_tax_types: false,
                uses_logged_in_tab: false,
                default_input: ActionInput::default(),
                input_rules: InputRules {
                    date_range_required: true,
                    item_ids_required: false,
                },
            },
            Action {
                id: "return_history".to_string(),
                name: "Get return history".to_string(),
                kind: ActionKind::ReturnHistory,
                requires_tax_types: true,
                uses_logged_in_tab: false,
                default_input: ActionInput::default(),
                input_rules: InputRules {
                    date_range_required: true,
                    item_ids_required: false,
                },
            },
            Action {
                id: "payment_receipts".to_string(),
                name: "Get payment receipts".to_string(),
                kind: ActionKind::PaymentReceipts,
                requires_tax_types: false,
                uses_logged_in_tab: true,
                default_input: ActionInput::default(),
                input_rules: InputRules {
                    date_range_required: false,
                    item_ids_required: true,
                },
            },
        ])
    }
}
