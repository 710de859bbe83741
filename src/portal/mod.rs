//! Boundary to the tax portal.
//!
//! Logging in, page scraping and table parsing live behind the traits in
//! this module. The engine only sees parsed records and page counts.

pub mod simulated;
pub mod types;

pub use simulated::{AccountFixture, PortalFixture, SimulatedPortal};
pub use types::*;

use async_trait::async_trait;

/// Opens and closes logged-in portal sessions
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Log in as `client`, trying at most `max_attempts` times
    async fn login(&self, client: &Client, max_attempts: u32) -> Result<Session, PortalError>;

    async fn logout(&self, session: &Session) -> Result<(), PortalError>;

    /// Release the session handle. Safe to call after a failed or partial logout.
    async fn close_session(&self, session: &Session);
}

/// Fetches parsed report pages and single records
#[async_trait]
pub trait PortalFetcher: Send + Sync {
    async fn fetch_page(&self, session: &Session, request: &PageRequest) -> Result<FetchedPage, PortalError>;

    async fn fetch_item(&self, session: &Session, request: &ItemRequest) -> Result<Record, PortalError>;

    /// Tax types the client is registered for
    async fn fetch_tax_types(&self, session: &Session) -> Result<Vec<TaxTypeId>, PortalError>;
}
