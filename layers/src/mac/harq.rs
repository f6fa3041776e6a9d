//! HARQ Process Bookkeeping
//!
//! Per-UE, per-direction stop-and-wait processes. A process holds the DCI and
//! RLC assignment of its transport block until it is acknowledged, dropped
//! after too many retransmissions, or the UE is released.

use super::alloc::{DciInfoElementTdma, RlcPduInfo};
use crate::LayerError;
use common::types::{LinkDirection, Rnti};
use std::sync::Arc;
use tracing::{debug, trace};

/// State of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqStatus {
    Inactive,
    /// Sent, feedback pending
    WaitingFeedback,
    /// NACKed (or dropped before transmission), retransmission pending
    ReceivedFeedback,
}

#[derive(Debug, Clone)]
pub struct HarqProcess {
    pub status: HarqStatus,
    pub dci: Option<Arc<DciInfoElementTdma>>,
    pub rlc_pdu_info: Vec<RlcPduInfo>,
    /// Retransmissions already performed
    pub retx_count: u8,
}

impl Default for HarqProcess {
    fn default() -> Self {
        Self {
            status: HarqStatus::Inactive,
            dci: None,
            rlc_pdu_info: Vec::new(),
            retx_count: 0,
        }
    }
}

impl HarqProcess {
    pub fn is_active(&self) -> bool {
        self.status != HarqStatus::Inactive
    }
}

/// What happened to a process after feedback
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    Acked,
    /// Queued for retransmission
    Retransmit,
    /// Retransmission budget exhausted, the block is lost
    Failed(HarqFailure),
}

/// A transport block given up after `max_harq_retx` retransmissions
#[derive(Debug, Clone, PartialEq)]
pub struct HarqFailure {
    pub rnti: Rnti,
    pub direction: LinkDirection,
    pub harq_process: u8,
    pub tb_size: u32,
    pub rlc_pdu_info: Vec<RlcPduInfo>,
}

/// All HARQ processes of one UE in one direction
#[derive(Debug, Clone)]
pub struct HarqProcesses {
    rnti: Rnti,
    direction: LinkDirection,
    processes: Vec<HarqProcess>,
    max_retx: u8,
}

impl HarqProcesses {
    pub fn new(rnti: Rnti, direction: LinkDirection, num_processes: u8, max_retx: u8) -> Self {
        Self {
            rnti,
            direction,
            processes: vec![HarqProcess::default(); num_processes as usize],
            max_retx,
        }
    }

    /// Lowest idle process id
    pub fn find_free(&self) -> Option<u8> {
        self.processes.iter().position(|p| !p.is_active()).map(|i| i as u8)
    }

    pub fn can_insert(&self) -> bool {
        self.find_free().is_some()
    }

    pub fn get(&self, id: u8) -> Result<&HarqProcess, LayerError> {
        self.processes.get(id as usize).ok_or_else(|| {
            LayerError::InvalidState(format!("RNTI {} has no HARQ process {}", self.rnti, id))
        })
    }

    fn get_mut(&mut self, id: u8) -> Result<&mut HarqProcess, LayerError> {
        let rnti = self.rnti;
        self.processes.get_mut(id as usize).ok_or_else(|| {
            LayerError::InvalidState(format!("RNTI {} has no HARQ process {}", rnti, id))
        })
    }

    /// Store a new transmission in the process named by its DCI
    pub fn insert(&mut self, dci: Arc<DciInfoElementTdma>, rlc_pdu_info: Vec<RlcPduInfo>) -> Result<(), LayerError> {
        let process = self.get_mut(dci.harq_process)?;
        if process.is_active() {
            return Err(LayerError::InternalInconsistency(format!(
                "HARQ process {} of RNTI {} is busy", dci.harq_process, dci.rnti
            )));
        }
        *process = HarqProcess {
            status: HarqStatus::WaitingFeedback,
            dci: Some(dci),
            rlc_pdu_info,
            retx_count: 0,
        };
        Ok(())
    }

    /// Record that a pending retransmission went out with `dci`
    pub fn retransmitted(&mut self, dci: Arc<DciInfoElementTdma>) -> Result<(), LayerError> {
        let process = self.get_mut(dci.harq_process)?;
        if process.status != HarqStatus::ReceivedFeedback {
            return Err(LayerError::InternalInconsistency(format!(
                "HARQ process {} retransmitted without pending feedback", dci.harq_process
            )));
        }
        process.retx_count = process.retx_count.checked_add(1).ok_or_else(|| {
            LayerError::InternalInconsistency(format!("HARQ process {} retransmission count overflow", dci.harq_process))
        })?;
        process.status = HarqStatus::WaitingFeedback;
        process.dci = Some(dci);
        Ok(())
    }

    /// A transmission that never left the gNB counts as a NACK: it becomes a
    /// pending retransmission, or a failure once the budget is spent
    pub fn mark_dropped(&mut self, id: u8) -> Result<Option<HarqFailure>, LayerError> {
        if self.get(id)?.status != HarqStatus::WaitingFeedback {
            return Ok(None);
        }
        match self.feedback(id, false)? {
            FeedbackOutcome::Failed(failure) => Ok(Some(failure)),
            _ => Ok(None),
        }
    }

    /// Check that `id` is a process waiting for ACK/NACK
    pub fn expects_feedback(&self, id: u8) -> Result<(), LayerError> {
        let process = self.get(id)?;
        if process.status != HarqStatus::WaitingFeedback {
            return Err(LayerError::InvalidState(format!(
                "feedback for HARQ process {} of RNTI {} in state {:?}", id, self.rnti, process.status
            )));
        }
        Ok(())
    }

    /// Apply ACK/NACK to a process
    pub fn feedback(&mut self, id: u8, ack: bool) -> Result<FeedbackOutcome, LayerError> {
        self.expects_feedback(id)?;
        let (rnti, direction, max_retx) = (self.rnti, self.direction, self.max_retx);
        let process = self.get_mut(id)?;
        if ack {
            trace!("RNTI {} {:?} HARQ {} ACK", rnti, direction, id);
            *process = HarqProcess::default();
            return Ok(FeedbackOutcome::Acked);
        }
        if process.retx_count >= max_retx {
            let failure = HarqFailure {
                rnti,
                direction,
                harq_process: id,
                tb_size: process.dci.as_ref().map(|d| d.tb_size).unwrap_or(0),
                rlc_pdu_info: std::mem::take(&mut process.rlc_pdu_info),
            };
            debug!("RNTI {} {:?} HARQ {} dropped after {} retransmissions", rnti, direction, id, process.retx_count);
            *process = HarqProcess::default();
            return Ok(FeedbackOutcome::Failed(failure));
        }
        process.status = HarqStatus::ReceivedFeedback;
        Ok(FeedbackOutcome::Retransmit)
    }

    /// Processes waiting to be retransmitted
    pub fn pending_retx(&self) -> impl Iterator<Item = (u8, &HarqProcess)> {
        self.processes.iter()
            .enumerate()
            .filter(|(_, p)| p.status == HarqStatus::ReceivedFeedback)
            .map(|(i, p)| (i as u8, p))
    }

    pub fn num_active(&self) -> usize {
        self.processes.iter().filter(|p| p.is_active()).count()
    }

    pub fn reset(&mut self) {
        self.processes.iter_mut().for_each(|p| *p = HarqProcess::default());
    }
}
