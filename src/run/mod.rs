//! Run orchestration
//!
//! A run executes a set of actions over a set of clients. Clients are
//! processed one after another; each gets one portal session and its
//! actions run concurrently inside it. Runs are kept in a [`RunStore`] so
//! a later run can retry just the failed parts of an earlier one and the
//! outputs of both can be merged.

pub mod orchestrator;
pub mod store;


pub use orchestrator::*;
pub use store::*;
