//! Scheduler Boundary Interfaces Library
//!
//! This crate defines the messages exchanged between the MAC scheduler and its
//! collaborators (RLC, PHY feedback, mobility) and a JSON codec for traces.

pub mod message_types;

use thiserror::Error;

pub use message_types::*;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}
