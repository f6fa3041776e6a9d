//! Slot Allocation Data Model
//!
//! The per-slot output of the scheduler towards the PHY: one DCI per
//! allocation plus the RLC PDUs it carries, ordered by starting symbol.

use crate::LayerError;
use crate::phy::mimo::ComplexMatrixArray;
use common::types::{Rnti, SfnSf};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Direction of a DCI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DciFormat {
    Dl,
    Ul,
}

/// Purpose of a DCI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DciType {
    /// Control region (PDCCH / PUCCH)
    Ctrl,
    /// Data (PDSCH / PUSCH)
    Data,
    /// Sounding reference signal
    Srs,
    /// Random access message 3
    Msg3,
}

/// Time/frequency allocation of one transmission
#[derive(Debug, Clone, PartialEq)]
pub struct DciInfoElementTdma {
    pub rnti: Rnti,
    pub format: DciFormat,
    pub dci_type: DciType,
    pub sym_start: u8,
    pub num_sym: u8,
    pub mcs: u8,
    pub rank: u8,
    /// Transport block size in bytes
    pub tb_size: u32,
    pub harq_process: u8,
    pub ndi: u8,
    pub rv: u8,
    pub bwp_index: u16,
    /// Transmit power control command
    pub tpc: u8,
    /// One flag per RBG of the BWP
    pub rbg_bitmask: Vec<bool>,
    pub prec_mats: Option<Arc<ComplexMatrixArray>>,
}

impl DciInfoElementTdma {
    /// Control-region DCI spanning every RBG
    pub fn ctrl(format: DciFormat, sym_start: u8, num_sym: u8, bwp_index: u16, num_rbgs: usize) -> Self {
        Self {
            rnti: Rnti(0),
            format,
            dci_type: DciType::Ctrl,
            sym_start,
            num_sym,
            mcs: 0,
            rank: 1,
            tb_size: 0,
            harq_process: 0,
            ndi: 0,
            rv: 0,
            bwp_index,
            tpc: 1,
            rbg_bitmask: vec![true; num_rbgs],
            prec_mats: None,
        }
    }

    /// Sounding occasion of one UE over the whole band
    pub fn srs(rnti: Rnti, sym_start: u8, num_sym: u8, bwp_index: u16, num_rbgs: usize) -> Self {
        Self {
            rnti,
            dci_type: DciType::Srs,
            ..Self::ctrl(DciFormat::Ul, sym_start, num_sym, bwp_index, num_rbgs)
        }
    }

    /// Number of RBGs set in the bitmask
    pub fn num_rbgs(&self) -> usize {
        self.rbg_bitmask.iter().filter(|&&b| b).count()
    }

    /// Index of every RBG set in the bitmask
    pub fn rbg_indices(&self) -> Vec<usize> {
        self.rbg_bitmask.iter().enumerate().filter(|(_, &b)| b).map(|(i, _)| i).collect()
    }

    /// Symbol after the last one used
    pub fn sym_end(&self) -> u8 {
        self.sym_start + self.num_sym
    }

    /// True when both DCIs share at least one symbol and one RBG
    pub fn overlaps(&self, other: &DciInfoElementTdma) -> bool {
        let time = self.sym_start < other.sym_end() && other.sym_start < self.sym_end();
        let freq = self.rbg_bitmask.iter()
            .zip(other.rbg_bitmask.iter())
            .any(|(&a, &b)| a && b);
        time && freq
    }
}

impl fmt::Display for DciFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DciFormat::Dl => write!(f, "DL"),
            DciFormat::Ul => write!(f, "UL"),
        }
    }
}

impl fmt::Display for DciType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DciType::Ctrl => "CTRL",
            DciType::Data => "DATA",
            DciType::Srs => "SRS",
            DciType::Msg3 => "MSG3",
        };
        f.write_str(name)
    }
}

impl fmt::Display for DciInfoElementTdma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} rnti={} sym=[{};{}) mcs={} rank={} tbs={} harq={} ndi={} rv={} rbgs=",
            self.format, self.dci_type, self.rnti, self.sym_start, self.sym_end(),
            self.mcs, self.rank, self.tb_size, self.harq_process, self.ndi, self.rv
        )?;
        // Contiguous RBG runs printed as [first;last]
        let mut start: Option<usize> = None;
        for i in 0..=self.rbg_bitmask.len() {
            let set = self.rbg_bitmask.get(i).copied().unwrap_or(false);
            match (set, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    write!(f, "[{};{}]", s, i - 1)?;
                    start = None;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// RLC bytes assigned to one logical channel inside a TB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcPduInfo {
    pub lcid: u8,
    pub size: u32,
}

/// A DCI with the RLC PDUs it carries
#[derive(Debug, Clone, PartialEq)]
pub struct VarTtiAllocInfo {
    pub dci: Arc<DciInfoElementTdma>,
    pub rlc_pdu_info: Vec<RlcPduInfo>,
}

impl VarTtiAllocInfo {
    pub fn new(dci: DciInfoElementTdma) -> Self {
        Self { dci: Arc::new(dci), rlc_pdu_info: Vec::new() }
    }
}

/// Directions present in a slot; the discriminants multiply to BOTH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationType {
    None = 0,
    Dl = 2,
    Ul = 3,
    Both = 4,
}

impl fmt::Display for AllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationType::None => "NONE",
            AllocationType::Dl => "DL",
            AllocationType::Ul => "UL",
            AllocationType::Both => "BOTH",
        };
        f.write_str(name)
    }
}

/// Everything scheduled in one slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotAllocInfo {
    pub sfn_sf: SfnSf,
    pub alloc_type: AllocationType,
    pub num_sym_alloc: u32,
    pub var_tti_alloc_info: Vec<VarTtiAllocInfo>,
}

impl SlotAllocInfo {
    pub fn new(sfn_sf: SfnSf) -> Self {
        Self {
            sfn_sf,
            alloc_type: AllocationType::None,
            num_sym_alloc: 0,
            var_tti_alloc_info: Vec::new(),
        }
    }

    /// Merge another allocation of the same slot into this one
    pub fn merge(&mut self, other: &SlotAllocInfo) -> Result<(), LayerError> {
        if self.sfn_sf != other.sfn_sf {
            return Err(LayerError::InternalInconsistency(format!(
                "merging allocations of slots {} and {}", self.sfn_sf, other.sfn_sf
            )));
        }
        if self.alloc_type == AllocationType::None || other.alloc_type == AllocationType::None {
            return Err(LayerError::InternalInconsistency(
                "merging an allocation of type NONE".into()
            ));
        }
        // BOTH absorbs every other type so that merging stays associative
        if (self.alloc_type as u8) * (other.alloc_type as u8) == 6 || other.alloc_type == AllocationType::Both {
            self.alloc_type = AllocationType::Both;
        }
        self.num_sym_alloc += other.num_sym_alloc;

        let mut merged = other.var_tti_alloc_info.clone();
        merged.append(&mut self.var_tti_alloc_info);
        merged.sort_by_key(|v| v.dci.sym_start);
        self.var_tti_alloc_info = merged;
        Ok(())
    }

    pub fn contains_data_allocation(&self) -> bool {
        self.var_tti_alloc_info.iter().any(|v| v.dci.dci_type == DciType::Data)
    }

    pub fn contains_dl_ctrl_allocation(&self) -> bool {
        self.var_tti_alloc_info.iter()
            .any(|v| v.dci.dci_type == DciType::Ctrl && v.dci.format == DciFormat::Dl)
    }

    pub fn contains_ul_ctrl_allocation(&self) -> bool {
        self.var_tti_alloc_info.iter()
            .any(|v| v.dci.dci_type == DciType::Ctrl && v.dci.format == DciFormat::Ul)
    }

    pub fn contains_ul_msg3_allocation(&self) -> bool {
        self.var_tti_alloc_info.iter().any(|v| v.dci.dci_type == DciType::Msg3)
    }

    /// DCIs of one format and type
    pub fn dcis(&self, format: DciFormat, dci_type: DciType) -> impl Iterator<Item = &Arc<DciInfoElementTdma>> {
        self.var_tti_alloc_info.iter()
            .map(|v| &v.dci)
            .filter(move |d| d.format == format && d.dci_type == dci_type)
    }
}

/// Symbols spanned from `start` to the furthest end among `entries`
pub fn count_used_symbols(start: u8, entries: &[VarTtiAllocInfo]) -> u32 {
    entries.iter()
        .map(|v| v.dci.sym_end() as u32)
        .max()
        .map(|end| end.saturating_sub(start as u32))
        .unwrap_or(0)
}

impl fmt::Display for SlotAllocInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "slot {} type {} symbols {} allocations {}",
            self.sfn_sf, self.alloc_type, self.num_sym_alloc, self.var_tti_alloc_info.len()
        )?;
        for v in &self.var_tti_alloc_info {
            writeln!(f, "  {}", v.dci)?;
        }
        Ok(())
    }
}
