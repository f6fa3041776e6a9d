//! Common Utilities and Types Library
//!
//! This crate provides shared identifiers, radio timing types and helpers used
//! by the scheduling core and the simulator.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;
