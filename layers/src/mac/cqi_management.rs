//! CQI Management
//!
//! Applies DL CQI reports and UL SINR measurements to the per-UE state and
//! ages them out once they are older than the configured expiration.

use super::ue_info::{DlCqiState, SchedulerUeInfo, UlCqiState};
use crate::LayerError;
use crate::phy::amc::Amc;
use crate::phy::mimo::ComplexMatrixArray;
use interfaces::{CqiType, DlCqiReport, UlSinrReport};
use std::sync::Arc;
use tracing::{debug, trace};

/// A DL CQI report with the precoders selected alongside it
#[derive(Debug, Clone)]
pub struct DlCqiInfo {
    pub report: DlCqiReport,
    pub prec_mats: Option<Arc<ComplexMatrixArray>>,
}

impl From<DlCqiReport> for DlCqiInfo {
    fn from(report: DlCqiReport) -> Self {
        Self { report, prec_mats: None }
    }
}

/// Link adaptation state shared by every UE of a BWP
#[derive(Debug, Clone)]
pub struct CqiManagement {
    dl_amc: Amc,
    ul_amc: Amc,
    start_dl_mcs: u8,
    start_ul_mcs: u8,
    max_ul_mcs: u8,
}

impl CqiManagement {
    pub fn new(dl_amc: Amc, ul_amc: Amc, start_dl_mcs: u8, start_ul_mcs: u8, max_ul_mcs: u8) -> Self {
        Self { dl_amc, ul_amc, start_dl_mcs, start_ul_mcs, max_ul_mcs }
    }

    pub fn dl_amc(&self) -> &Amc {
        &self.dl_amc
    }

    pub fn ul_amc(&self) -> &Amc {
        &self.ul_amc
    }

    /// Store a DL report and derive the MCS the UE will be served with
    pub fn dl_cqi_reported(
        &self,
        info: &DlCqiInfo,
        ue: &mut SchedulerUeInfo,
        expiration: u32,
        max_dl_mcs: u8,
        bandwidth_in_rbgs: usize,
    ) -> Result<(), LayerError> {
        let report = &info.report;
        report.validate()?;

        ue.dl_cqi = DlCqiState {
            cqi_type: report.cqi_type,
            wb_cqi: report.wb_cqi,
            sb_cqis: report.sb_cqis.clone(),
            timer: expiration,
        };
        ue.dl.mcs = self.dl_amc.mcs_from_cqi(report.wb_cqi).min(max_dl_mcs);
        ue.dl.rank = report.rank.max(1);
        if info.prec_mats.is_some() {
            ue.dl_prec_mats = info.prec_mats.clone();
        }

        ue.dl_sb_mcs.clear();
        ue.rbg_to_sb.clear();
        if report.cqi_type == CqiType::Subband && !report.sb_cqis.is_empty() {
            let num_sb = report.sb_cqis.len();
            ue.dl_sb_mcs = report.sb_cqis.iter()
                .map(|&cqi| self.dl_amc.mcs_from_cqi(cqi).min(max_dl_mcs))
                .collect();
            let rbgs_per_sb = bandwidth_in_rbgs.div_ceil(num_sb).max(1);
            ue.rbg_to_sb = (0..bandwidth_in_rbgs)
                .map(|rbg| (rbg / rbgs_per_sb).min(num_sb - 1))
                .collect();
        }

        debug!(
            rnti = %ue.rnti,
            "DL CQI {:?} wb={} rank={} -> mcs={}",
            report.cqi_type, report.wb_cqi, ue.dl.rank, ue.dl.mcs
        );
        Ok(())
    }

    /// Apply a UL SINR measurement of the allocation described by `rbg_mask`
    pub fn ul_sb_cqi_reported(
        &self,
        expiration: u32,
        tbs: u32,
        report: &UlSinrReport,
        ue: &mut SchedulerUeInfo,
        rbg_mask: &[bool],
        rb_per_rbg: u32,
    ) -> Result<(), LayerError> {
        report.validate()?;
        if !rbg_mask.iter().any(|&b| b) {
            return Err(LayerError::InvalidState(format!(
                "UL CQI of RNTI {} without the allocation that produced it", ue.rnti
            )));
        }

        let rb_per_rbg = rb_per_rbg as usize;
        let sinr: Vec<f64> = rbg_mask.iter()
            .enumerate()
            .filter(|(_, &set)| set)
            .flat_map(|(rbg, _)| rbg * rb_per_rbg..(rbg + 1) * rb_per_rbg)
            .filter_map(|rb| report.sinr_per_rb.get(rb).copied())
            .collect();
        if sinr.is_empty() {
            return Err(LayerError::InvalidState(format!(
                "UL SINR of RNTI {} does not cover the allocated RBs", ue.rnti
            )));
        }

        let feedback = self.ul_amc.create_cqi_feedback_siso(&sinr)?;
        ue.ul_cqi = UlCqiState {
            cqi_type: CqiType::Subband,
            wb_cqi: feedback.cqi,
            sinr,
            timer: expiration,
        };
        ue.ul.mcs = feedback.mcs.min(self.max_ul_mcs);
        trace!(rnti = %ue.rnti, "UL CQI over TB of {} bytes: cqi={} mcs={}", tbs, feedback.cqi, ue.ul.mcs);
        Ok(())
    }

    /// Age the DL reports by one slot, resetting the expired ones
    pub fn refresh_dl_cqi_maps<'a>(&self, ues: impl IntoIterator<Item = &'a mut SchedulerUeInfo>) {
        for ue in ues {
            if ue.dl_cqi.timer == 0 {
                continue;
            }
            ue.dl_cqi.timer -= 1;
            if ue.dl_cqi.timer == 0 {
                debug!(rnti = %ue.rnti, "DL CQI expired, back to MCS {}", self.start_dl_mcs);
                ue.dl_cqi = DlCqiState::default();
                ue.dl.mcs = self.start_dl_mcs;
                ue.dl.rank = 1;
                ue.dl_sb_mcs.clear();
                ue.rbg_to_sb.clear();
                ue.dl_prec_mats = None;
            }
        }
    }

    /// Age the UL measurements by one slot, resetting the expired ones
    pub fn refresh_ul_cqi_maps<'a>(&self, ues: impl IntoIterator<Item = &'a mut SchedulerUeInfo>) {
        for ue in ues {
            if ue.ul_cqi.timer == 0 {
                continue;
            }
            ue.ul_cqi.timer -= 1;
            if ue.ul_cqi.timer == 0 {
                debug!(rnti = %ue.rnti, "UL CQI expired, back to MCS {}", self.start_ul_mcs);
                ue.ul_cqi = UlCqiState::default();
                ue.ul.mcs = self.start_ul_mcs;
                ue.ul.rank = 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::amc::AmcModel;
    use crate::phy::error_model::ErrorModelType;
    use common::types::{BwpId, CellId, LinkDirection, Rnti, SfnSf};

    fn manager() -> CqiManagement {
        let dl = Amc::from_type(ErrorModelType::EesmCcT1, AmcModel::ErrorModel, LinkDirection::Downlink);
        let ul = Amc::from_type(ErrorModelType::EesmCcT1, AmcModel::ErrorModel, LinkDirection::Uplink);
        CqiManagement::new(dl, ul, 0, 0, 20)
    }

    fn report(cqi_type: CqiType, wb: u8, sb: Vec<u8>) -> DlCqiInfo {
        DlCqiReport {
            rnti: Rnti(1),
            cell_id: CellId(1),
            bwp_id: BwpId(0),
            cqi_type,
            rank: 2,
            wb_cqi: wb,
            sb_cqis: sb,
        }
        .into()
    }

    #[test]
    fn test_dl_report_caps_mcs() {
        let m = manager();
        let mut ue = SchedulerUeInfo::new(Rnti(1), 0, 0, 0, 16, 3);
        m.dl_cqi_reported(&report(CqiType::Wideband, 15, vec![]), &mut ue, 5, 9, 10).unwrap();
        assert_eq!(ue.dl.mcs, 9);
        assert_eq!(ue.dl.rank, 2);
        assert_eq!(ue.dl_cqi.timer, 5);
        assert!(ue.dl_sb_mcs.is_empty());
    }

    #[test]
    fn test_subband_map_covers_bandwidth() {
        let m = manager();
        let mut ue = SchedulerUeInfo::new(Rnti(1), 0, 0, 0, 16, 3);
        m.dl_cqi_reported(&report(CqiType::Subband, 7, vec![3, 7, 11]), &mut ue, 5, 28, 10).unwrap();
        assert_eq!(ue.dl_sb_mcs.len(), 3);
        assert!(ue.dl_sb_mcs[0] <= ue.dl_sb_mcs[1] && ue.dl_sb_mcs[1] <= ue.dl_sb_mcs[2]);
        // ceil(10 / 3) = 4 RBGs per subband
        assert_eq!(ue.rbg_to_sb, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_dl_expiry_restores_start_state() {
        let m = manager();
        let mut ue = SchedulerUeInfo::new(Rnti(1), 0, 0, 0, 16, 3);
        m.dl_cqi_reported(&report(CqiType::Subband, 12, vec![12, 12]), &mut ue, 3, 28, 4).unwrap();
        assert!(ue.dl.mcs > 0);
        for _ in 0..2 {
            m.refresh_dl_cqi_maps(std::iter::once(&mut ue));
            assert!(ue.dl.mcs > 0);
        }
        m.refresh_dl_cqi_maps(std::iter::once(&mut ue));
        assert_eq!(ue.dl.mcs, 0);
        assert_eq!(ue.dl.rank, 1);
        assert_eq!(ue.dl_cqi.wb_cqi, 1);
        assert_eq!(ue.dl_cqi.cqi_type, CqiType::Wideband);
        assert!(ue.rbg_to_sb.is_empty());
    }

    #[test]
    fn test_ul_needs_allocation_mask() {
        let m = manager();
        let mut ue = SchedulerUeInfo::new(Rnti(1), 0, 0, 0, 16, 3);
        let sinr = UlSinrReport {
            rnti: Rnti(1),
            sfn_sf: SfnSf::origin(0).unwrap(),
            sinr_per_rb: vec![1000.0; 16],
        };
        assert!(m.ul_sb_cqi_reported(4, 100, &sinr, &mut ue, &[false; 4], 4).is_err());

        m.ul_sb_cqi_reported(4, 100, &sinr, &mut ue, &[true, true, false, false], 4).unwrap();
        assert_eq!(ue.ul_cqi.sinr.len(), 8);
        assert!(ue.ul.mcs > 0 && ue.ul.mcs <= 20);
        assert_eq!(ue.ul_cqi.timer, 4);

        for _ in 0..4 {
            m.refresh_ul_cqi_maps(std::iter::once(&mut ue));
        }
        assert_eq!(ue.ul.mcs, 0);
        assert!(ue.ul_cqi.sinr.is_empty());
    }
}
