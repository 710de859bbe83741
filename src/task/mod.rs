pub mod mapper;
pub mod tree;
pub mod types;
pub mod wrapper;

#[cfg(test)]
mod tests;

pub use mapper::*;
pub use tree::*;
pub use types::*;
pub use wrapper::*;
