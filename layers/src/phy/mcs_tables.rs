//! MCS and CQI Tables
//!
//! TS 38.214 Tables 5.1.3.1-1/-2 (PDSCH MCS) and 5.2.2.1-2/-3 (4-bit CQI).

use serde::{Deserialize, Serialize};

/// Which pair of MCS/CQI tables is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum McsTable {
    /// Up to 64QAM
    Table1,
    /// Up to 256QAM
    Table2,
}

/// (modulation order, target code rate x 1024)
const MCS_TABLE1: [(u8, f64); 29] = [
    (2, 120.0), (2, 157.0), (2, 193.0), (2, 251.0), (2, 308.0),
    (2, 379.0), (2, 449.0), (2, 526.0), (2, 602.0), (2, 679.0),
    (4, 340.0), (4, 378.0), (4, 434.0), (4, 490.0), (4, 553.0),
    (4, 616.0), (4, 658.0),
    (6, 438.0), (6, 466.0), (6, 517.0), (6, 567.0), (6, 616.0),
    (6, 666.0), (6, 719.0), (6, 772.0), (6, 822.0), (6, 873.0),
    (6, 910.0), (6, 948.0),
];

const MCS_TABLE2: [(u8, f64); 28] = [
    (2, 120.0), (2, 193.0), (2, 308.0), (2, 449.0), (2, 602.0),
    (4, 378.0), (4, 434.0), (4, 490.0), (4, 553.0), (4, 616.0),
    (4, 658.0),
    (6, 466.0), (6, 517.0), (6, 567.0), (6, 616.0), (6, 666.0),
    (6, 719.0), (6, 772.0), (6, 822.0), (6, 873.0),
    (8, 682.5), (8, 711.0), (8, 754.0), (8, 797.0), (8, 841.0),
    (8, 885.0), (8, 916.5), (8, 948.0),
];

/// Index 0 is "out of range"
const CQI_TABLE1: [(u8, f64); 16] = [
    (0, 0.0),
    (2, 78.0), (2, 120.0), (2, 193.0), (2, 308.0), (2, 449.0),
    (2, 602.0), (4, 378.0), (4, 490.0), (4, 616.0), (6, 466.0),
    (6, 567.0), (6, 666.0), (6, 772.0), (6, 873.0), (6, 948.0),
];

const CQI_TABLE2: [(u8, f64); 16] = [
    (0, 0.0),
    (2, 78.0), (2, 193.0), (2, 449.0), (4, 378.0), (4, 490.0),
    (4, 616.0), (6, 466.0), (6, 567.0), (6, 666.0), (6, 772.0),
    (6, 873.0), (8, 711.0), (8, 797.0), (8, 885.0), (8, 948.0),
];

impl McsTable {
    fn mcs_entries(&self) -> &'static [(u8, f64)] {
        match self {
            McsTable::Table1 => &MCS_TABLE1,
            McsTable::Table2 => &MCS_TABLE2,
        }
    }

    fn cqi_entries(&self) -> &'static [(u8, f64); 16] {
        match self {
            McsTable::Table1 => &CQI_TABLE1,
            McsTable::Table2 => &CQI_TABLE2,
        }
    }

    /// Highest MCS index of the table
    pub fn max_mcs(&self) -> u8 {
        (self.mcs_entries().len() - 1) as u8
    }

    fn entry(&self, mcs: u8) -> (u8, f64) {
        let entries = self.mcs_entries();
        entries[(mcs as usize).min(entries.len() - 1)]
    }

    /// Modulation order (bits per symbol), out-of-range MCS values are clamped
    pub fn modulation_order(&self, mcs: u8) -> u8 {
        self.entry(mcs).0
    }

    /// Target code rate in [0, 1]
    pub fn code_rate(&self, mcs: u8) -> f64 {
        self.entry(mcs).1 / 1024.0
    }

    /// Bits per resource element
    pub fn spectral_efficiency(&self, mcs: u8) -> f64 {
        let (qm, rate) = self.entry(mcs);
        qm as f64 * rate / 1024.0
    }

    /// Bits per resource element promised by a CQI index; 0 for CQI 0
    pub fn cqi_spectral_efficiency(&self, cqi: u8) -> f64 {
        let (qm, rate) = self.cqi_entries()[(cqi as usize).min(15)];
        qm as f64 * rate / 1024.0
    }

    /// Modulation orders available in the table, ascending
    pub fn modulation_orders(&self) -> &'static [u8] {
        match self {
            McsTable::Table1 => &[2, 4, 6],
            McsTable::Table2 => &[2, 4, 6, 8],
        }
    }

    /// Highest MCS that uses the given modulation order
    pub fn max_mcs_for_modulation(&self, qm: u8) -> Option<u8> {
        self.mcs_entries()
            .iter()
            .rposition(|&(order, _)| order == qm)
            .map(|idx| idx as u8)
    }

    /// Highest MCS whose spectral efficiency does not exceed the CQI's
    pub fn mcs_from_cqi(&self, cqi: u8) -> u8 {
        if cqi == 0 {
            return 0;
        }
        let target = self.cqi_spectral_efficiency(cqi);
        self.mcs_entries()
            .iter()
            .rposition(|&(qm, rate)| qm as f64 * rate / 1024.0 <= target + 1e-9)
            .map(|idx| idx as u8)
            .unwrap_or(0)
    }

    /// Highest CQI whose spectral efficiency does not exceed `se`; 0 when even CQI 1 is too high
    pub fn cqi_from_spectral_efficiency(&self, se: f64) -> u8 {
        (1..=15u8)
            .rev()
            .find(|&cqi| self.cqi_spectral_efficiency(cqi) <= se + 1e-9)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulation_boundaries() {
        let t1 = McsTable::Table1;
        assert_eq!(t1.modulation_order(9), 2);
        assert_eq!(t1.modulation_order(10), 4);
        assert_eq!(t1.modulation_order(16), 4);
        assert_eq!(t1.modulation_order(17), 6);
        assert_eq!(t1.modulation_order(28), 6);

        let t2 = McsTable::Table2;
        assert_eq!(t2.modulation_order(4), 2);
        assert_eq!(t2.modulation_order(5), 4);
        assert_eq!(t2.modulation_order(11), 6);
        assert_eq!(t2.modulation_order(19), 6);
        assert_eq!(t2.modulation_order(20), 8);
        assert_eq!(t2.max_mcs(), 27);
    }

    #[test]
    fn test_max_mcs_per_modulation() {
        assert_eq!(McsTable::Table1.max_mcs_for_modulation(2), Some(9));
        assert_eq!(McsTable::Table1.max_mcs_for_modulation(6), Some(28));
        assert_eq!(McsTable::Table1.max_mcs_for_modulation(8), None);
        assert_eq!(McsTable::Table2.max_mcs_for_modulation(8), Some(27));
    }

    #[test]
    fn test_cqi_to_mcs_is_monotonic() {
        for table in [McsTable::Table1, McsTable::Table2] {
            let mut last = 0;
            for cqi in 0..=15 {
                let mcs = table.mcs_from_cqi(cqi);
                assert!(mcs >= last);
                assert!(table.spectral_efficiency(mcs) <= table.cqi_spectral_efficiency(cqi).max(table.spectral_efficiency(0)));
                last = mcs;
            }
            assert_eq!(table.mcs_from_cqi(15), table.max_mcs());
        }
    }

    #[test]
    fn test_cqi_from_spectral_efficiency() {
        let t1 = McsTable::Table1;
        assert_eq!(t1.cqi_from_spectral_efficiency(0.1), 0);
        assert_eq!(t1.cqi_from_spectral_efficiency(10.0), 15);
        let se = t1.cqi_spectral_efficiency(7);
        assert_eq!(t1.cqi_from_spectral_efficiency(se), 7);
    }
}
