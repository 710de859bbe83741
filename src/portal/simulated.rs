//! Fixture-driven portal used by the CLI and the test suite.
//!
//! A fixture lists, per client, the report pages and receipts the portal
//! holds plus how many times each fetch should fail before succeeding.
//! Fetch keys are `login`, `logout`, `tax_types`, `ledger:<page>`,
//! `returns:<tax type>:<page>` and `receipt:<id>`.

use super::{PortalFetcher, SessionProvider};
use crate::portal::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalFixture {
    #[serde(default)]
    pub clients: Vec<Client>,
    /// Portal data keyed by client id
    #[serde(default)]
    pub accounts: BTreeMap<ClientId, AccountFixture>,
    /// Artificial latency applied to every fetch
    #[serde(default)]
    pub fetch_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountFixture {
    #[serde(default)]
    pub tax_types: Vec<TaxTypeId>,
    /// Ledger report, one entry per page
    #[serde(default)]
    pub ledger: Vec<Vec<Record>>,
    /// Return history report per tax type, one entry per page
    #[serde(default)]
    pub returns: BTreeMap<TaxTypeId, Vec<Vec<Record>>>,
    #[serde(default)]
    pub receipts: BTreeMap<String, Record>,
    /// Number of times each fetch key fails before it succeeds
    #[serde(default)]
    pub failures: BTreeMap<String, u32>,
}

impl PortalFixture {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read portal fixture {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid portal fixture {:?}", path))
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    remaining_failures: HashMap<(ClientId, String), u32>,
    fetch_log: Vec<(ClientId, String)>,
    open_sessions: HashSet<Uuid>,
    closed_sessions: Vec<Uuid>,
    logins: usize,
}

/// In-memory portal backed by a `PortalFixture`
#[derive(Debug)]
pub struct SimulatedPortal {
    fixture: PortalFixture,
    state: Mutex<SimulatedState>,
}

impl SimulatedPortal {
    pub fn new(fixture: PortalFixture) -> Self {
        let remaining_failures = fixture
            .accounts
            .iter()
            .flat_map(|(client_id, account)| {
                account
                    .failures
                    .iter()
                    .map(move |(key, &count)| ((client_id.clone(), key.clone()), count))
            })
            .collect();
        Self {
            fixture,
            state: Mutex::new(SimulatedState {
                remaining_failures,
                ..Default::default()
            }),
        }
    }

    pub fn clients(&self) -> &[Client] {
        &self.fixture.clients
    }

    /// Every fetch key attempted for `client_id`, in call order
    pub async fn fetch_log(&self, client_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .fetch_log
            .iter()
            .filter(|(id, _)| id == client_id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Successful logins so far
    pub async fn opened_session_count(&self) -> usize {
        self.state.lock().await.logins
    }

    pub async fn open_session_count(&self) -> usize {
        self.state.lock().await.open_sessions.len()
    }

    pub async fn closed_session_count(&self) -> usize {
        self.state.lock().await.closed_sessions.len()
    }

    fn account(&self, client_id: &str) -> Result<&AccountFixture, PortalError> {
        self.fixture
            .accounts
            .get(client_id)
            .ok_or_else(|| PortalError::Fetch(format!("Unknown client {}", client_id)))
    }

    /// Log the attempt and consume one scheduled failure, if any
    async fn attempt(&self, client_id: &str, key: String) -> bool {
        if self.fixture.fetch_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.fixture.fetch_delay_ms)).await;
        }
        let mut state = self.state.lock().await;
        state.fetch_log.push((client_id.to_string(), key.clone()));
        match state.remaining_failures.get_mut(&(client_id.to_string(), key)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn page_of(pages: &[Vec<Record>], page: u32) -> Result<FetchedPage, PortalError> {
        if pages.is_empty() {
            return Err(PortalError::NoRecords);
        }
        let records = pages
            .get(page.saturating_sub(1) as usize)
            .ok_or_else(|| PortalError::Fetch(format!("Page {} out of range", page)))?;
        Ok(FetchedPage {
            num_pages: pages.len() as u32,
            current_page: page,
            records: records.clone(),
        })
    }
}

#[async_trait]
impl SessionProvider for SimulatedPortal {
    async fn login(&self, client: &Client, max_attempts: u32) -> Result<Session, PortalError> {
        if !self.fixture.accounts.contains_key(&client.id) {
            return Err(PortalError::Session(format!("Unknown client {}", client.id)));
        }
        for attempt in 1..=max_attempts.max(1) {
            if self.attempt(&client.id, "login".to_string()).await {
                warn!("Login attempt {} for {} failed", attempt, client);
                continue;
            }
            let session = Session::new(client.id.clone());
            let mut state = self.state.lock().await;
            state.open_sessions.insert(session.id);
            state.logins += 1;
            info!("Logged in as {}", client);
            return Ok(session);
        }
        Err(PortalError::Session(format!(
            "Failed to log in after {} attempts",
            max_attempts.max(1)
        )))
    }

    async fn logout(&self, session: &Session) -> Result<(), PortalError> {
        if self.attempt(&session.client_id, "logout".to_string()).await {
            return Err(PortalError::Session("Logout failed".to_string()));
        }
        self.state.lock().await.open_sessions.remove(&session.id);
        debug!("Logged out session {}", session.id);
        Ok(())
    }

    async fn close_session(&self, session: &Session) {
        let mut state = self.state.lock().await;
        state.open_sessions.remove(&session.id);
        state.closed_sessions.push(session.id);
    }
}

#[async_trait]
impl PortalFetcher for SimulatedPortal {
    async fn fetch_page(&self, session: &Session, request: &PageRequest) -> Result<FetchedPage, PortalError> {
        let client_id = session.client_id.as_str();
        let key = match (&request.report, &request.tax_type) {
            (ReportKind::Ledger, _) => format!("ledger:{}", request.page),
            (ReportKind::ReturnHistory, Some(tax_type)) => {
                format!("returns:{}:{}", tax_type, request.page)
            }
            (ReportKind::ReturnHistory, None) => {
                return Err(PortalError::Fetch("Return history needs a tax type".to_string()));
            }
        };
        if self.attempt(client_id, key.clone()).await {
            return Err(PortalError::Fetch(format!("Simulated failure fetching {}", key)));
        }

        let account = self.account(client_id)?;
        match (&request.report, &request.tax_type) {
            (ReportKind::Ledger, _) => Self::page_of(&account.ledger, request.page),
            (ReportKind::ReturnHistory, Some(tax_type)) => {
                let pages = account.returns.get(tax_type).map(Vec::as_slice).unwrap_or(&[]);
                Self::page_of(pages, request.page)
            }
            (ReportKind::ReturnHistory, None) => Err(PortalError::NoRecords),
        }
    }

    async fn fetch_item(&self, session: &Session, request: &ItemRequest) -> Result<Record, PortalError> {
        let client_id = session.client_id.as_str();
        let key = format!("receipt:{}", request.item_id);
        if self.attempt(client_id, key.clone()).await {
            return Err(PortalError::Fetch(format!("Simulated failure fetching {}", key)));
        }
        self.account(client_id)?
            .receipts
            .get(&request.item_id)
            .cloned()
            .ok_or_else(|| PortalError::Fetch(format!("Receipt {} not found", request.item_id)))
    }

    async fn fetch_tax_types(&self, session: &Session) -> Result<Vec<TaxTypeId>, PortalError> {
        let client_id = session.client_id.as_str();
        if self.attempt(client_id, "tax_types".to_string()).await {
            return Err(PortalError::Fetch("Simulated failure fetching tax types".to_string()));
        }
        Ok(self.account(client_id)?.tax_types.clone())
    }
}
