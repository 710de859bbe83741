pub mod kinds;
pub mod registry;
pub mod runner;
pub mod types;

#[cfg(test)]
mod tests;

pub use kinds::ActionOutcome;
pub use registry::*;
pub use runner::*;
pub use types::*;
