//! Scheduler Configuration
//!
//! Carrier layout and scheduling parameters of one BWP. Every field has a
//! serde default so scenario files only list what they change; `validate()`
//! is run by the scheduler constructor and refuses inconsistent setups.

use super::fh_control::FhControlConfig;
use super::scheduler::Coreset0Config;
use super::slot_pattern::SlotPattern;
use super::srs;
use super::ue_info::SchedulingPolicy;
use crate::LayerError;
use crate::phy::amc::AmcModel;
use crate::phy::error_model::ErrorModelType;
use crate::phy::mimo::PmSearchConfig;
use common::types::{DuplexMode, SubcarrierSpacing};
use serde::{Deserialize, Serialize};

/// How resources are shared between UEs inside a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// RBGs are split between UEs over the same symbols
    Ofdma,
    /// Symbols are split between UEs, each using the whole band
    Tdma,
}

/// Carrier and BWP layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    pub cell_id: u16,
    pub bwp_id: u16,
    pub numerology: u8,
    pub num_rbs: u32,
    pub rb_per_rbg: u32,
    /// OFDM symbols per slot
    pub num_symbols: u8,
    /// Table 13-1 index, gives the DL control length
    pub coreset0_index: u8,
    /// Symbols at the end of UL-capable slots reserved for UL control
    pub ul_ctrl_symbols: u8,
    pub duplex: DuplexMode,
    /// `DL|DL|F|UL` style pattern, required for TDD
    pub tdd_pattern: Option<String>,
    /// RBGs never used for DL data
    pub dl_notched_rbgs: Vec<usize>,
    /// RBGs never used for UL data
    pub ul_notched_rbgs: Vec<usize>,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            cell_id: 1,
            bwp_id: 0,
            numerology: 0,
            num_rbs: 52,
            rb_per_rbg: 4,
            num_symbols: 14,
            coreset0_index: 1,
            ul_ctrl_symbols: 1,
            duplex: DuplexMode::Fdd,
            tdd_pattern: None,
            dl_notched_rbgs: Vec::new(),
            ul_notched_rbgs: Vec::new(),
        }
    }
}

impl CarrierConfig {
    /// RBGs in the BWP, the last one possibly partial
    pub fn num_rbgs(&self) -> usize {
        self.num_rbs.div_ceil(self.rb_per_rbg.max(1)) as usize
    }

    pub fn slot_pattern(&self) -> Result<SlotPattern, LayerError> {
        SlotPattern::for_duplex(self.duplex, self.tdd_pattern.as_deref())
    }

    /// Usable-RBG mask after removing the notched ones
    pub fn rbg_mask(&self, notched: &[usize]) -> Vec<bool> {
        (0..self.num_rbgs()).map(|rbg| !notched.contains(&rbg)).collect()
    }

    /// Subcarrier spacing of the configured numerology
    pub fn subcarrier_spacing(&self) -> Result<SubcarrierSpacing, LayerError> {
        Ok(SubcarrierSpacing::from_numerology(self.numerology)?)
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        self.subcarrier_spacing()?;
        if self.num_rbs == 0 || self.rb_per_rbg == 0 {
            return Err(LayerError::InvalidConfiguration("RB and RBG sizes must be positive".into()));
        }
        if self.num_symbols == 0 || self.num_symbols > 14 {
            return Err(LayerError::InvalidConfiguration(format!("{} symbols per slot", self.num_symbols)));
        }
        let coreset = Coreset0Config::from_index(self.coreset0_index)?;
        if coreset.num_symbols as u8 + self.ul_ctrl_symbols >= self.num_symbols {
            return Err(LayerError::InvalidConfiguration(
                "control regions leave no symbol for data".into()
            ));
        }
        self.slot_pattern()?;
        let num_rbgs = self.num_rbgs();
        if let Some(rbg) = self.dl_notched_rbgs.iter().chain(&self.ul_notched_rbgs).find(|&&r| r >= num_rbgs) {
            return Err(LayerError::InvalidConfiguration(format!(
                "notched RBG {} outside a BWP of {} RBGs", rbg, num_rbgs
            )));
        }
        Ok(())
    }
}

/// Complete scheduler setup of one BWP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub carrier: CarrierConfig,
    pub policy: SchedulingPolicy,
    pub access: AccessMode,
    /// Exponent of the potential throughput in the PF metric
    pub fairness_index: f64,
    /// Averaging window of the past throughput, in slots
    pub time_window: f64,
    /// Slots a CQI report stays valid
    pub cqi_expiration: u32,
    pub start_dl_mcs: u8,
    pub start_ul_mcs: u8,
    /// Defaults to the top of the MCS table
    pub max_dl_mcs: Option<u8>,
    pub max_ul_mcs: Option<u8>,
    /// Ignore CQI and always use this MCS
    pub fixed_dl_mcs: Option<u8>,
    pub fixed_ul_mcs: Option<u8>,
    pub harq_processes: u8,
    pub max_harq_retx: u8,
    pub error_model: ErrorModelType,
    pub amc_model: AmcModel,
    pub pm_search: PmSearchConfig,
    pub fh_control: Option<FhControlConfig>,
    /// Starting SRS period in slots, `None` disables sounding
    pub srs_periodicity: Option<u32>,
    /// Symbols of a sounding occasion, right before the UL control region
    pub srs_symbols: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            carrier: CarrierConfig::default(),
            policy: SchedulingPolicy::ProportionalFair,
            access: AccessMode::Ofdma,
            fairness_index: 1.0,
            time_window: 99.0,
            cqi_expiration: 20,
            start_dl_mcs: 0,
            start_ul_mcs: 0,
            max_dl_mcs: None,
            max_ul_mcs: None,
            fixed_dl_mcs: None,
            fixed_ul_mcs: None,
            harq_processes: 16,
            max_harq_retx: 3,
            error_model: ErrorModelType::EesmCcT1,
            amc_model: AmcModel::ErrorModel,
            pm_search: PmSearchConfig::default(),
            fh_control: None,
            srs_periodicity: None,
            srs_symbols: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn max_dl_mcs(&self) -> u8 {
        self.max_dl_mcs.unwrap_or_else(|| self.error_model.mcs_table().max_mcs())
    }

    pub fn max_ul_mcs(&self) -> u8 {
        self.max_ul_mcs.unwrap_or_else(|| self.error_model.mcs_table().max_mcs())
    }

    /// Change the PF fairness exponent, keeping the old value when out of range
    pub fn set_fairness_index(&mut self, fairness_index: f64) -> Result<(), LayerError> {
        let previous = std::mem::replace(&mut self.fairness_index, fairness_index);
        self.validate().inspect_err(|_| self.fairness_index = previous)
    }

    pub fn set_cqi_expiration(&mut self, slots: u32) -> Result<(), LayerError> {
        let previous = std::mem::replace(&mut self.cqi_expiration, slots);
        self.validate().inspect_err(|_| self.cqi_expiration = previous)
    }

    pub fn set_fh_control(&mut self, fh_control: Option<FhControlConfig>) -> Result<(), LayerError> {
        let previous = std::mem::replace(&mut self.fh_control, fh_control);
        self.validate().inspect_err(|_| self.fh_control = previous)
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        self.carrier.validate()?;
        self.pm_search.validate()?;
        if let Some(fh) = &self.fh_control {
            fh.validate()?;
        }
        if let Some(periodicity) = self.srs_periodicity {
            srs::validate_periodicity(periodicity)?;
            let coreset = Coreset0Config::from_index(self.carrier.coreset0_index)?;
            let reserved = coreset.num_symbols + self.carrier.ul_ctrl_symbols as u32 + self.srs_symbols as u32;
            if self.srs_symbols == 0 || reserved >= self.carrier.num_symbols as u32 {
                return Err(LayerError::InvalidConfiguration(format!(
                    "{} SRS symbols do not fit next to the control regions", self.srs_symbols
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.fairness_index) {
            return Err(LayerError::InvalidConfiguration(format!(
                "fairness index {} outside [0, 1]", self.fairness_index
            )));
        }
        if !(self.time_window >= 1.0) {
            return Err(LayerError::InvalidConfiguration(format!(
                "time window {} below one slot", self.time_window
            )));
        }
        if self.cqi_expiration == 0 {
            return Err(LayerError::InvalidConfiguration("CQI expiration must be at least one slot".into()));
        }
        if self.harq_processes == 0 || self.harq_processes > 16 {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} HARQ processes, expected 1..=16", self.harq_processes
            )));
        }
        let table_max = self.error_model.mcs_table().max_mcs();
        for (name, start, max) in [
            ("DL", self.start_dl_mcs, self.max_dl_mcs()),
            ("UL", self.start_ul_mcs, self.max_ul_mcs()),
        ] {
            if max > table_max || start > max {
                return Err(LayerError::InvalidConfiguration(format!(
                    "{} MCS range start={} max={} outside table limit {}", name, start, max, table_max
                )));
            }
        }
        for (name, fixed) in [("DL", self.fixed_dl_mcs), ("UL", self.fixed_ul_mcs)] {
            if fixed.is_some_and(|m| m > table_max) {
                return Err(LayerError::InvalidConfiguration(format!(
                    "fixed {} MCS above table limit {}", name, table_max
                )));
            }
        }
        Ok(())
    }
}
