//! Logical Channel Queues
//!
//! Scheduler-side view of the RLC queues of a UE, grouped by logical channel
//! group, and the split of a transport block between active channels.

use super::alloc::RlcPduInfo;
use common::types::Qci;
use interfaces::RlcBufferStatus;
use std::collections::BTreeMap;
use tracing::trace;

/// Queue state of one logical channel
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalChannel {
    pub lcid: u8,
    pub qci: Qci,
    pub tx_queue: u32,
    pub retx_queue: u32,
    pub status_pdu: u32,
    pub tx_hol_delay_ms: u16,
}

impl LogicalChannel {
    pub fn new(lcid: u8, qci: Qci) -> Self {
        Self {
            lcid,
            qci,
            tx_queue: 0,
            retx_queue: 0,
            status_pdu: 0,
            tx_hol_delay_ms: 0,
        }
    }

    pub fn total_bytes(&self) -> u32 {
        self.tx_queue
            .saturating_add(self.retx_queue)
            .saturating_add(self.status_pdu)
    }

    pub fn is_active(&self) -> bool {
        self.total_bytes() > 0
    }

    /// Drain `bytes`, serving the status PDU, then retransmissions, then new data
    pub fn serve(&mut self, mut bytes: u32) {
        for queue in [&mut self.status_pdu, &mut self.retx_queue, &mut self.tx_queue] {
            let taken = bytes.min(*queue);
            *queue -= taken;
            bytes -= taken;
        }
    }
}

/// Logical channels sharing a group id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogicalChannelGroup {
    lcs: BTreeMap<u8, LogicalChannel>,
}

impl LogicalChannelGroup {
    pub fn insert(&mut self, lc: LogicalChannel) {
        self.lcs.insert(lc.lcid, lc);
    }

    pub fn remove(&mut self, lcid: u8) -> Option<LogicalChannel> {
        self.lcs.remove(&lcid)
    }

    pub fn contains(&self, lcid: u8) -> bool {
        self.lcs.contains_key(&lcid)
    }

    pub fn is_empty(&self) -> bool {
        self.lcs.is_empty()
    }

    pub fn total_bytes(&self) -> u32 {
        self.lcs.values().map(LogicalChannel::total_bytes).fold(0, u32::saturating_add)
    }

    pub fn active_lcs(&self) -> impl Iterator<Item = &LogicalChannel> {
        self.lcs.values().filter(|lc| lc.is_active())
    }

    /// Overwrite the queue sizes of one channel with an RLC report
    pub fn update_from_rlc(&mut self, status: &RlcBufferStatus) {
        if let Some(lc) = self.lcs.get_mut(&status.lcid) {
            lc.tx_queue = status.tx_queue_size;
            lc.retx_queue = status.retx_queue_size;
            lc.status_pdu = status.status_pdu_size as u32;
            lc.tx_hol_delay_ms = status.tx_queue_hol_delay;
        }
    }

    /// A BSR reports the group total; it is kept on the lowest channel
    pub fn update_from_bsr(&mut self, buffer_size: u32) {
        let mut iter = self.lcs.values_mut();
        if let Some(first) = iter.next() {
            first.tx_queue = buffer_size;
            first.retx_queue = 0;
            first.status_pdu = 0;
        }
        for lc in iter {
            lc.tx_queue = 0;
            lc.retx_queue = 0;
            lc.status_pdu = 0;
        }
    }

    fn serve(&mut self, lcid: u8, bytes: u32) {
        if let Some(lc) = self.lcs.get_mut(&lcid) {
            lc.serve(bytes);
        }
    }
}

/// Total buffered bytes over all groups
pub fn total_bytes(lcgs: &BTreeMap<u8, LogicalChannelGroup>) -> u32 {
    lcgs.values().map(LogicalChannelGroup::total_bytes).fold(0, u32::saturating_add)
}

/// Split `tbs` bytes evenly across every active channel and drain the queues
///
/// A channel never gets more than it holds; the division remainder goes to
/// the last active channel.
pub fn assign_bytes(lcgs: &mut BTreeMap<u8, LogicalChannelGroup>, tbs: u32) -> Vec<RlcPduInfo> {
    let active: Vec<(u8, u8, u32)> = lcgs
        .iter()
        .flat_map(|(&lcg, group)| group.active_lcs().map(move |lc| (lcg, lc.lcid, lc.total_bytes())))
        .collect();
    if active.is_empty() {
        return Vec::new();
    }
    let n = active.len() as u32;
    let (per_lc, remainder) = (tbs / n, tbs % n);
    let last = active.len() - 1;
    let mut assigned = Vec::with_capacity(active.len());
    for (i, (lcg, lcid, queued)) in active.into_iter().enumerate() {
        let share = if i == last { per_lc + remainder } else { per_lc };
        let size = share.min(queued);
        if size == 0 {
            continue;
        }
        trace!("LCG {} LC {} gets {} bytes", lcg, lcid, size);
        if let Some(group) = lcgs.get_mut(&lcg) {
            group.serve(lcid, size);
        }
        assigned.push(RlcPduInfo { lcid, size });
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Rnti;

    fn group(lcids: &[u8]) -> LogicalChannelGroup {
        let mut g = LogicalChannelGroup::default();
        for &id in lcids {
            g.insert(LogicalChannel::new(id, Qci::DEFAULT));
        }
        g
    }

    fn report(lcid: u8, tx: u32, retx: u32) -> RlcBufferStatus {
        RlcBufferStatus {
            rnti: Rnti(1),
            lcid,
            tx_queue_size: tx,
            tx_queue_hol_delay: 0,
            retx_queue_size: retx,
            retx_queue_hol_delay: 0,
            status_pdu_size: 2,
        }
    }

    #[test]
    fn test_serve_order() {
        let mut lc = LogicalChannel::new(3, Qci::DEFAULT);
        lc.tx_queue = 100;
        lc.retx_queue = 10;
        lc.status_pdu = 5;
        lc.serve(20);
        assert_eq!((lc.status_pdu, lc.retx_queue, lc.tx_queue), (0, 0, 95));
        lc.serve(1000);
        assert!(!lc.is_active());
    }

    #[test]
    fn test_equal_split_between_active_channels() {
        let mut lcgs = BTreeMap::new();
        let mut g = group(&[1, 2, 3]);
        g.update_from_rlc(&report(1, 300, 0));
        g.update_from_rlc(&report(2, 50, 20));
        lcgs.insert(0, g);

        let out = assign_bytes(&mut lcgs, 200);
        // LC 2 only holds 72 bytes
        assert_eq!(out, vec![RlcPduInfo { lcid: 1, size: 100 }, RlcPduInfo { lcid: 2, size: 72 }]);
        assert_eq!(total_bytes(&lcgs), 302 - 100);
    }

    #[test]
    fn test_remainder_goes_to_last_channel() {
        let mut lcgs = BTreeMap::new();
        let mut g = group(&[1, 2]);
        g.update_from_rlc(&report(1, 1000, 0));
        g.update_from_rlc(&report(2, 1000, 0));
        lcgs.insert(0, g);

        let out = assign_bytes(&mut lcgs, 201);
        assert_eq!(out, vec![RlcPduInfo { lcid: 1, size: 100 }, RlcPduInfo { lcid: 2, size: 101 }]);
        assert_eq!(out.iter().map(|p| p.size).sum::<u32>(), 201);
        assert_eq!(total_bytes(&lcgs), 2004 - 201);
    }

    #[test]
    fn test_no_active_channel_assigns_nothing() {
        let mut lcgs = BTreeMap::new();
        lcgs.insert(1, group(&[4]));
        assert!(assign_bytes(&mut lcgs, 100).is_empty());
    }

    #[test]
    fn test_bsr_replaces_group_total() {
        let mut g = group(&[5, 6]);
        g.update_from_bsr(800);
        assert_eq!(g.total_bytes(), 800);
        g.update_from_bsr(0);
        assert_eq!(g.total_bytes(), 0);
    }
}
