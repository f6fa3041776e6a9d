//! Message Types for the Scheduler Boundary
//!
//! Defines the reports consumed by the MAC scheduler. The PHY-bound slot
//! allocation lives with the scheduler itself.

use crate::InterfaceError;
use common::types::{BwpId, CellId, LinkDirection, Qci, Rnti, SfnSf};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Highest CQI index of the 4-bit CQI tables
pub const MAX_CQI: u8 = 15;

/// RLC buffer status report for one logical channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlcBufferStatus {
    /// UE identifier
    pub rnti: Rnti,
    /// Logical channel identifier
    pub lcid: u8,
    /// Bytes waiting for a first transmission
    pub tx_queue_size: u32,
    /// Head-of-line delay of the transmission queue in ms
    pub tx_queue_hol_delay: u16,
    /// Bytes waiting for retransmission
    pub retx_queue_size: u32,
    /// Head-of-line delay of the retransmission queue in ms
    pub retx_queue_hol_delay: u16,
    /// Pending status PDU size in bytes
    pub status_pdu_size: u16,
}

impl RlcBufferStatus {
    /// Total bytes this report asks the scheduler to serve
    pub fn total_bytes(&self) -> u32 {
        self.tx_queue_size
            .saturating_add(self.retx_queue_size)
            .saturating_add(self.status_pdu_size as u32)
    }
}

/// Uplink buffer status report for one logical channel group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UlBsr {
    pub rnti: Rnti,
    /// Logical channel group
    pub lcg: u8,
    /// Buffered bytes
    pub buffer_size: u32,
}

/// Granularity of a CQI report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CqiType {
    Wideband,
    Subband,
}

/// Downlink channel quality report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlCqiReport {
    pub rnti: Rnti,
    pub cell_id: CellId,
    pub bwp_id: BwpId,
    pub cqi_type: CqiType,
    /// Rank indicator
    pub rank: u8,
    /// Wideband CQI
    pub wb_cqi: u8,
    /// Subband CQIs, empty for wideband reports
    #[serde(default)]
    pub sb_cqis: Vec<u8>,
}

impl DlCqiReport {
    /// Reject reports that can not come from a compliant UE
    pub fn validate(&self) -> Result<(), InterfaceError> {
        if self.wb_cqi > MAX_CQI {
            return Err(InterfaceError::InvalidMessage(
                format!("wideband CQI {} out of range", self.wb_cqi)
            ));
        }
        if self.rank == 0 {
            return Err(InterfaceError::InvalidMessage("rank indicator 0".into()));
        }
        if self.cqi_type == CqiType::Subband && self.sb_cqis.is_empty() {
            return Err(InterfaceError::InvalidMessage("subband report without subbands".into()));
        }
        if let Some(cqi) = self.sb_cqis.iter().find(|&&c| c > MAX_CQI) {
            return Err(InterfaceError::InvalidMessage(
                format!("subband CQI {} out of range", cqi)
            ));
        }
        Ok(())
    }
}

/// Uplink SINR measured by the gNB PHY on a previous UL allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UlSinrReport {
    pub rnti: Rnti,
    /// Slot in which the measured allocation was transmitted
    pub sfn_sf: SfnSf,
    /// Linear SINR per resource block of the BWP
    pub sinr_per_rb: Vec<f64>,
}

impl UlSinrReport {
    pub fn validate(&self) -> Result<(), InterfaceError> {
        if self.sinr_per_rb.is_empty() {
            return Err(InterfaceError::InvalidMessage("empty UL SINR report".into()));
        }
        if self.sinr_per_rb.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(InterfaceError::InvalidMessage("UL SINR must be finite and non-negative".into()));
        }
        Ok(())
    }
}

/// HARQ acknowledgement for one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarqFeedback {
    pub rnti: Rnti,
    pub direction: LinkDirection,
    pub harq_process_id: u8,
    pub ack: bool,
    pub bwp_index: u16,
}

/// A mobility decision moved the UE to another cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoverSignal {
    pub rnti: Rnti,
    pub target_cell: CellId,
}

/// Random access preamble answered with a RAR; the UE now needs a Msg3 grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RachIndication {
    /// Temporary C-RNTI given in the RAR
    pub rnti: Rnti,
}

/// Logical channel setup from the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcConfig {
    pub rnti: Rnti,
    pub lcid: u8,
    /// Logical channel group used by uplink BSRs
    pub lcg: u8,
    #[serde(default)]
    pub qci: Qci,
    pub direction: LinkDirection,
}

/// Envelope used when scheduler input is recorded or replayed as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerMessage {
    RlcBufferStatus(RlcBufferStatus),
    UlBsr(UlBsr),
    DlCqi(DlCqiReport),
    UlSinr(UlSinrReport),
    HarqFeedback(HarqFeedback),
    Handover(HandoverSignal),
    LcConfig(LcConfig),
    RachIndication(RachIndication),
}

impl SchedulerMessage {
    /// UE the message refers to
    pub fn rnti(&self) -> Rnti {
        match self {
            Self::RlcBufferStatus(m) => m.rnti,
            Self::UlBsr(m) => m.rnti,
            Self::DlCqi(m) => m.rnti,
            Self::UlSinr(m) => m.rnti,
            Self::HarqFeedback(m) => m.rnti,
            Self::Handover(m) => m.rnti,
            Self::LcConfig(m) => m.rnti,
            Self::RachIndication(m) => m.rnti,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RlcBufferStatus(_) => "rlc_buffer_status",
            Self::UlBsr(_) => "ul_bsr",
            Self::DlCqi(_) => "dl_cqi",
            Self::UlSinr(_) => "ul_sinr",
            Self::HarqFeedback(_) => "harq_feedback",
            Self::Handover(_) => "handover",
            Self::LcConfig(_) => "lc_config",
            Self::RachIndication(_) => "rach_indication",
        }
    }

    /// Encode as a single JSON line
    pub fn to_json(&self) -> Result<String, InterfaceError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate a JSON line
    pub fn from_json(line: &str) -> Result<Self, InterfaceError> {
        let msg: SchedulerMessage = serde_json::from_str(line)?;
        match &msg {
            Self::DlCqi(report) => report.validate()?,
            Self::UlSinr(report) => report.validate()?,
            _ => {}
        }
        trace!("Decoded {} for RNTI {}", msg.kind(), msg.rnti());
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = SchedulerMessage::RlcBufferStatus(RlcBufferStatus {
            rnti: Rnti(17),
            lcid: 4,
            tx_queue_size: 1500,
            tx_queue_hol_delay: 3,
            retx_queue_size: 200,
            retx_queue_hol_delay: 8,
            status_pdu_size: 12,
        });

        let serialized = msg.to_json().unwrap();
        assert!(serialized.contains("\"type\":\"rlc_buffer_status\""));

        let deserialized = SchedulerMessage::from_json(&serialized).unwrap();
        assert_eq!(deserialized, msg);
        assert_eq!(deserialized.rnti(), Rnti(17));
    }

    #[test]
    fn test_rach_indication_tag() {
        let json = "{\"type\":\"rach_indication\",\"rnti\":42}";
        let msg = SchedulerMessage::from_json(json).unwrap();
        assert_eq!(msg, SchedulerMessage::RachIndication(RachIndication { rnti: Rnti(42) }));
        assert_eq!(msg.kind(), "rach_indication");
    }

    #[test]
    fn test_buffer_status_total() {
        let bsr = RlcBufferStatus {
            rnti: Rnti(1),
            lcid: 1,
            tx_queue_size: 100,
            tx_queue_hol_delay: 0,
            retx_queue_size: 20,
            retx_queue_hol_delay: 0,
            status_pdu_size: 2,
        };
        assert_eq!(bsr.total_bytes(), 122);
    }

    #[test]
    fn test_cqi_report_validation() {
        let mut report = DlCqiReport {
            rnti: Rnti(3),
            cell_id: CellId(1),
            bwp_id: BwpId(0),
            cqi_type: CqiType::Wideband,
            rank: 1,
            wb_cqi: 12,
            sb_cqis: vec![],
        };
        assert!(report.validate().is_ok());

        report.wb_cqi = 16;
        assert!(report.validate().is_err());

        report.wb_cqi = 7;
        report.cqi_type = CqiType::Subband;
        assert!(report.validate().is_err());
        report.sb_cqis = vec![7, 9, 20];
        assert!(report.validate().is_err());
    }

    #[test]
    fn test_invalid_sinr_rejected_on_decode() {
        let msg = SchedulerMessage::UlSinr(UlSinrReport {
            rnti: Rnti(9),
            sfn_sf: SfnSf::origin(1).unwrap(),
            sinr_per_rb: vec![],
        });
        let json = msg.to_json().unwrap();
        assert!(matches!(
            SchedulerMessage::from_json(&json),
            Err(InterfaceError::InvalidMessage(_))
        ));
        assert!(matches!(
            SchedulerMessage::from_json("{\"type\":\"nope\"}"),
            Err(InterfaceError::SerializationError(_))
        ));
    }
}
