//! Physical Layer Abstraction
//!
//! Link-to-system models used by the MAC scheduler: MCS/CQI tables, LDPC
//! segmentation, HARQ-aware error models, AMC and MIMO precoding search.

pub mod amc;
pub mod error_model;
pub mod ldpc;
pub mod mcs_tables;
pub mod mimo;

// Re-export commonly used types
pub use amc::{Amc, AmcModel, CqiFeedback, McsParams};
pub use error_model::{ErrorModel, ErrorModelOutput, ErrorModelType};
pub use mcs_tables::McsTable;
pub use mimo::{ComplexMatrixArray, CovMat, IntfNormChanMat, PmCqiInfo, PmSearch, PmSearchIdeal, SinrMatrix};
