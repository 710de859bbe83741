use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier of a taxpayer account
pub type ClientId = String;

/// One parsed table row, column name to cell text
pub type Record = BTreeMap<String, String>;

/// A taxpayer account the engine operates on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    /// Taxpayer identification number used to log in
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.username)
    }
}

/// Code of a tax type such as "ITX" or "VAT"
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxTypeId(String);

impl TaxTypeId {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaxTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaxTypeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Logged-in session handle, shared read-only by the actions of one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub client_id: ClientId,
}

impl Session {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.into(),
        }
    }
}

/// Reports the portal can page through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Ledger,
    ReturnHistory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub report: ReportKind,
    pub tax_type: Option<TaxTypeId>,
    pub from_date: String,
    pub to_date: String,
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRequest {
    pub item_id: String,
}

/// A page of a parsed report table
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub num_pages: u32,
    pub current_page: u32,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortalError {
    /// The report is legitimately empty
    #[error("No records found")]
    NoRecords,
    #[error("Fetch failed: {0}")]
    Fetch(String),
    #[error("Session error: {0}")]
    Session(String),
}
