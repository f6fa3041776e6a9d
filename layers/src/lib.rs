//! NR Scheduling Core Layers Library
//!
//! This crate implements the gNB MAC scheduler and the PHY-side link
//! abstraction it relies on (error models, AMC, MIMO rank and precoder search).

pub mod phy;
pub mod mac;

use thiserror::Error;

/// Common errors for the scheduling core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("Unknown RNTI: {0}")]
    UnknownRnti(u16),

    #[error("Missing SAP: {0}")]
    MissingSap(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<common::types::TypeError> for LayerError {
    fn from(err: common::types::TypeError) -> Self {
        LayerError::InvalidConfiguration(err.to_string())
    }
}

impl From<interfaces::InterfaceError> for LayerError {
    fn from(err: interfaces::InterfaceError) -> Self {
        LayerError::InvalidState(err.to_string())
    }
}
