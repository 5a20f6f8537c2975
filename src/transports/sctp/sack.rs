//! Receive bitmap bookkeeping and SACK / NR-SACK construction.

use super::association::Association;
use super::chunk::{
    CT_NR_SACK, CT_SACK, ControlChunk, NR_SACK_FIXED_SIZE, NetId, SACK_FIXED_SIZE,
    SCTP_COMMON_HEADER_SIZE, tsn_gt, tsn_lte,
};
use super::destination::ReachState;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

/// Receive window tracked by the bitmap, in TSNs.
const MAX_MAP_TSNS: usize = 32 * 1024;
const MAX_DUPS_TRACKED: usize = 256;

/// Runs of set bits inside one bitmap byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapEntry {
    /// Bit 0 is set: a run may continue from the previous byte.
    pub low_edge: bool,
    /// Bit 7 is set: a run may continue into the next byte.
    pub high_edge: bool,
    pub count: u8,
    pub runs: [(u8, u8); 4],
}

const fn gap_entry(v: u8) -> GapEntry {
    let mut runs = [(0u8, 0u8); 4];
    let mut count = 0usize;
    let mut bit = 0u32;
    while bit < 8 {
        if v & (1u8 << bit) != 0 {
            let start = bit;
            while bit < 8 && v & (1u8 << bit) != 0 {
                bit += 1;
            }
            runs[count] = (start as u8, (bit - 1) as u8);
            count += 1;
        } else {
            bit += 1;
        }
    }
    GapEntry {
        low_edge: v & 0x01 != 0,
        high_edge: v & 0x80 != 0,
        count: count as u8,
        runs,
    }
}

/// Every 8 bit window of the receive bitmap mapped to its runs.
pub static GAP_TABLE: [GapEntry; 256] = {
    let mut table = [gap_entry(0); 256];
    let mut i = 0;
    while i < 256 {
        table[i] = gap_entry(i as u8);
        i += 1;
    }
    table
};

/// Yields maximal runs of received TSNs above the cumulative ack as
/// `(start, end)` offsets relative to it.
pub struct GapScanner<'a> {
    bytes: &'a [u8],
    base_tsn: u32,
    cum_tsn: u32,
    first_byte: usize,
    last_byte: usize,
    byte: usize,
    entry: usize,
    prev_high_edge: bool,
    open: Option<(u32, u32)>,
    finished: bool,
}

impl<'a> GapScanner<'a> {
    pub fn new(bytes: &'a [u8], base_tsn: u32, cum_tsn: u32, highest_tsn: u32) -> Self {
        let first = cum_tsn.wrapping_add(1).wrapping_sub(base_tsn) as usize / 8;
        let finished = !tsn_gt(highest_tsn, cum_tsn);
        let last = highest_tsn.wrapping_sub(base_tsn) as usize / 8;
        Self {
            bytes,
            base_tsn,
            cum_tsn,
            first_byte: first,
            last_byte: last,
            byte: first,
            entry: 0,
            prev_high_edge: false,
            open: None,
            finished,
        }
    }

    fn window(&self, index: usize) -> u8 {
        let mut v = self.bytes.get(index).copied().unwrap_or(0);
        if index == self.first_byte {
            let skip = self.cum_tsn.wrapping_add(1).wrapping_sub(self.base_tsn) % 8;
            v &= 0xFFu8 << skip;
        }
        v
    }

    fn offsets(&self, (start, end): (u32, u32)) -> Option<(u16, u16)> {
        let s = start.wrapping_sub(self.cum_tsn);
        let e = end.wrapping_sub(self.cum_tsn);
        if e > u16::MAX as u32 {
            return None;
        }
        Some((s as u16, e as u16))
    }
}

impl Iterator for GapScanner<'_> {
    type Item = (u16, u16);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.byte > self.last_byte {
                self.finished = true;
                let run = self.open.take()?;
                return self.offsets(run);
            }
            let entry = GAP_TABLE[self.window(self.byte) as usize];
            if self.entry < entry.count as usize {
                let (lo, hi) = entry.runs[self.entry];
                let first_in_byte = self.entry == 0;
                self.entry += 1;
                let at = self.base_tsn.wrapping_add((self.byte * 8) as u32);
                let start = at.wrapping_add(lo as u32);
                let end = at.wrapping_add(hi as u32);
                match self.open {
                    Some((open_start, _))
                        if first_in_byte && entry.low_edge && self.prev_high_edge =>
                    {
                        self.open = Some((open_start, end));
                    }
                    Some(run) => {
                        self.open = Some((start, end));
                        match self.offsets(run) {
                            Some(block) => return Some(block),
                            None => {
                                self.finished = true;
                                return None;
                            }
                        }
                    }
                    None => self.open = Some((start, end)),
                }
            } else {
                self.prev_high_edge = entry.high_edge;
                self.byte += 1;
                self.entry = 0;
            }
        }
    }
}

/// The receive side state the acknowledgment generator reads.
#[derive(Debug)]
pub struct ReceiveMap {
    base_tsn: u32,
    mapping: Vec<u8>,
    nr_mapping: Vec<u8>,
    pub cum_tsn: u32,
    pub highest_tsn: u32,
    pub dups: Vec<u32>,
    pub last_data_from: Option<NetId>,
    pub data_received: bool,
    capacity: u32,
}

impl ReceiveMap {
    pub fn new(peer_initial_tsn: u32, capacity: u32) -> Self {
        let cum = peer_initial_tsn.wrapping_sub(1);
        Self {
            base_tsn: peer_initial_tsn,
            mapping: Vec::new(),
            nr_mapping: Vec::new(),
            cum_tsn: cum,
            highest_tsn: cum,
            dups: Vec::new(),
            last_data_from: None,
            data_received: false,
            capacity,
        }
    }

    fn index(&self, tsn: u32) -> Option<usize> {
        if !tsn_lte(self.base_tsn, tsn) {
            return None;
        }
        let i = tsn.wrapping_sub(self.base_tsn) as usize;
        (i < MAX_MAP_TSNS).then_some(i)
    }

    fn bit(map: &[u8], i: usize) -> bool {
        map.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0)
    }

    pub fn is_received(&self, tsn: u32) -> bool {
        if tsn_lte(tsn, self.cum_tsn) {
            return true;
        }
        self.index(tsn)
            .is_some_and(|i| Self::bit(&self.mapping, i) || Self::bit(&self.nr_mapping, i))
    }

    /// Records arrival of a DATA chunk without advancing the cumulative ack.
    pub(crate) fn mark(&mut self, tsn: u32, non_renegable: bool) -> bool {
        let Some(i) = self.index(tsn) else {
            return false;
        };
        let map = if non_renegable {
            &mut self.nr_mapping
        } else {
            &mut self.mapping
        };
        if map.len() <= i / 8 {
            map.resize(i / 8 + 1, 0);
        }
        map[i / 8] |= 1 << (i % 8);
        if tsn_gt(tsn, self.highest_tsn) {
            self.highest_tsn = tsn;
        }
        self.data_received = true;
        true
    }

    /// Returns false for duplicates and TSNs outside the tracked window.
    pub fn note_received(&mut self, tsn: u32, from: NetId, non_renegable: bool) -> bool {
        self.last_data_from = Some(from);
        if self.is_received(tsn) {
            self.note_duplicate(tsn);
            return false;
        }
        if !self.mark(tsn, non_renegable) {
            return false;
        }
        self.slide();
        true
    }

    pub fn note_duplicate(&mut self, tsn: u32) {
        if self.dups.len() < MAX_DUPS_TRACKED {
            self.dups.push(tsn);
        }
    }

    /// Advances the cumulative ack over contiguous received TSNs and drops
    /// fully acknowledged bytes from the front of the bitmap.
    pub fn slide(&mut self) -> bool {
        let before = self.cum_tsn;
        loop {
            let next = self.cum_tsn.wrapping_add(1);
            match self.index(next) {
                Some(i) if Self::bit(&self.mapping, i) || Self::bit(&self.nr_mapping, i) => {
                    self.cum_tsn = next;
                }
                _ => break,
            }
        }
        if tsn_gt(self.cum_tsn, self.highest_tsn) {
            self.highest_tsn = self.cum_tsn;
        }
        let whole = self.cum_tsn.wrapping_add(1).wrapping_sub(self.base_tsn) as usize / 8;
        if whole > 0 {
            for map in [&mut self.mapping, &mut self.nr_mapping] {
                let n = whole.min(map.len());
                map.drain(..n);
            }
            self.base_tsn = self.base_tsn.wrapping_add((whole * 8) as u32);
        }
        self.cum_tsn != before
    }

    /// Gaps over the renegable bitmap only.
    pub fn gaps(&self) -> GapScanner<'_> {
        GapScanner::new(&self.mapping, self.base_tsn, self.cum_tsn, self.highest_tsn)
    }

    pub fn union_bytes(&self) -> Vec<u8> {
        let len = self.mapping.len().max(self.nr_mapping.len());
        (0..len)
            .map(|i| {
                self.mapping.get(i).copied().unwrap_or(0)
                    | self.nr_mapping.get(i).copied().unwrap_or(0)
            })
            .collect()
    }

    pub fn nr_gaps(&self) -> GapScanner<'_> {
        GapScanner::new(
            &self.nr_mapping,
            self.base_tsn,
            self.cum_tsn,
            self.highest_tsn,
        )
    }

    pub fn base_tsn(&self) -> u32 {
        self.base_tsn
    }

    pub fn advertised_rwnd(&self) -> u32 {
        self.capacity
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Contents of one SACK or NR-SACK chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReport {
    pub cum_tsn: u32,
    pub a_rwnd: u32,
    pub gaps: Vec<(u16, u16)>,
    pub nr_gaps: Vec<(u16, u16)>,
    pub dups: Vec<u32>,
    pub non_renegable: bool,
}

impl AckReport {
    pub fn kind(&self) -> u8 {
        if self.non_renegable {
            CT_NR_SACK
        } else {
            CT_SACK
        }
    }

    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            16 + 4 * (self.gaps.len() + self.nr_gaps.len() + self.dups.len()),
        );
        buf.put_u32(self.cum_tsn);
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.gaps.len() as u16);
        if self.non_renegable {
            buf.put_u16(self.nr_gaps.len() as u16);
        }
        buf.put_u16(self.dups.len() as u16);
        if self.non_renegable {
            buf.put_u16(0);
        }
        for (start, end) in &self.gaps {
            buf.put_u16(*start);
            buf.put_u16(*end);
        }
        for (start, end) in &self.nr_gaps {
            buf.put_u16(*start);
            buf.put_u16(*end);
        }
        for dup in &self.dups {
            buf.put_u32(*dup);
        }
        buf.freeze()
    }
}

impl Association {
    /// Builds the next SACK (or NR-SACK) and queues it, replacing any queued one.
    pub fn build_ack(&mut self) -> Option<AckReport> {
        if !self.recv.data_received {
            return None;
        }
        self.drop_control(|c| c.kind == CT_SACK || c.kind == CT_NR_SACK);
        let dest = self.sack_destination()?;

        if self.recv.slide() {
            debug!("SACK: receive map was not slid, cum ack now {}", self.recv.cum_tsn);
        }

        let non_renegable = self.config.nr_sack && self.caps.nr_sack;
        let fixed = if non_renegable {
            NR_SACK_FIXED_SIZE
        } else {
            SACK_FIXED_SIZE
        };
        let kind = if non_renegable { CT_NR_SACK } else { CT_SACK };
        let mut space = self.destinations.get(dest).map_or(0, |d| {
            d.mtu
                .saturating_sub(self.ip_overhead(dest) + SCTP_COMMON_HEADER_SIZE)
                .saturating_sub(fixed + self.auth_len(kind))
        });

        let mut gaps = Vec::new();
        let mut nr_gaps = Vec::new();
        if non_renegable {
            for block in self.recv.gaps() {
                if space < 4 {
                    break;
                }
                gaps.push(block);
                space -= 4;
            }
            for block in self.recv.nr_gaps() {
                if space < 4 {
                    break;
                }
                nr_gaps.push(block);
                space -= 4;
            }
        } else {
            let union = self.recv.union_bytes();
            let scanner = GapScanner::new(
                &union,
                self.recv.base_tsn(),
                self.recv.cum_tsn,
                self.recv.highest_tsn,
            );
            for block in scanner {
                if space < 4 {
                    break;
                }
                gaps.push(block);
                space -= 4;
            }
        }

        if gaps.is_empty() && nr_gaps.is_empty() && self.recv.highest_tsn != self.recv.cum_tsn {
            self.recv.highest_tsn = self.recv.cum_tsn;
        }

        let room = space / 4;
        let mut dups = std::mem::take(&mut self.recv.dups);
        dups.truncate(room);

        let report = AckReport {
            cum_tsn: self.recv.cum_tsn,
            a_rwnd: self.recv.advertised_rwnd(),
            gaps,
            nr_gaps,
            dups,
            non_renegable,
        };
        trace!(
            "Built {} cum={} gaps={} nr_gaps={} dups={}",
            if non_renegable { "NR-SACK" } else { "SACK" },
            report.cum_tsn,
            report.gaps.len(),
            report.nr_gaps.len(),
            report.dups.len()
        );
        let chunk = ControlChunk::new(report.kind(), 0, report.encode_body(), dest);
        self.push_control(chunk);
        self.sack_pending = false;
        Some(report)
    }

    /// Destination for the next SACK: where data last came from, or an
    /// alternate when duplicates suggest our SACKs are being lost.
    fn sack_destination(&mut self) -> Option<NetId> {
        let last = self
            .recv
            .last_data_from
            .filter(|n| self.destinations.is_live(*n));
        let reachable = |a: &Association, n: NetId| {
            a.destinations
                .get(n)
                .is_some_and(|d| d.state != ReachState::Unreachable)
        };

        let last_ok = last.is_some_and(|n| reachable(self, n));
        if self.recv.dups.is_empty() && last_ok {
            self.used_alt_onsack = 0;
            return last;
        }

        let from = last.or(self.primary)?;
        self.used_alt_onsack += 1;
        if self.used_alt_onsack > self.dest_order.len() && last_ok {
            self.used_alt_onsack = 0;
            return last;
        }
        match self.find_alternate(from) {
            Some(alt) => Some(alt),
            None if last_ok => last,
            None => self.primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::transports::sctp::arena::Arena;
    use crate::transports::sctp::association::AssociationParams;
    use std::time::Instant;

    fn net() -> NetId {
        let mut arena = Arena::new();
        arena.insert(())
    }

    #[test]
    fn test_gap_table_entries() {
        let e = GAP_TABLE[0b1010_0111];
        assert_eq!(e.count, 3);
        assert_eq!(&e.runs[..3], &[(0, 2), (5, 5), (7, 7)]);
        assert!(e.low_edge && e.high_edge);
        assert_eq!(GAP_TABLE[0].count, 0);
        assert_eq!(GAP_TABLE[0xFF].runs[0], (0, 7));
        assert_eq!(GAP_TABLE[0b0101_0101].count, 4);
    }

    #[test]
    fn test_gaps_contiguous_and_isolated() {
        // cum ack 10; 12-13 received and 15 isolated
        let mut map = ReceiveMap::new(1, 65536);
        let n = net();
        for tsn in 1..=10 {
            map.note_received(tsn, n, false);
        }
        for tsn in [12, 13, 15] {
            map.note_received(tsn, n, false);
        }
        assert_eq!(map.cum_tsn, 10);
        let gaps: Vec<_> = GapScanner::new(
            &map.union_bytes(),
            map.base_tsn(),
            map.cum_tsn,
            map.highest_tsn,
        )
        .collect();
        assert_eq!(gaps, vec![(2, 3), (5, 5)]);
    }

    #[test]
    fn test_runs_merge_across_byte_windows() {
        let mut map = ReceiveMap::new(0, 65536);
        let n = net();
        map.note_received(0, n, false);
        // a run crossing two 8 TSN windows, then one crossing three
        for tsn in (5..=11).chain(14..=30) {
            map.note_received(tsn, n, false);
        }
        let gaps: Vec<_> = map.gaps().collect();
        assert_eq!(gaps, vec![(5, 11), (14, 30)]);
    }

    #[test]
    fn test_block_count_matches_runs() {
        let mut map = ReceiveMap::new(100, 65536);
        let n = net();
        // runs: 102, 104-107, 109-124, 130
        for tsn in [102, 104, 105, 106, 107, 130].into_iter().chain(109..=124) {
            map.note_received(tsn, n, false);
        }
        assert_eq!(map.cum_tsn, 99);
        let gaps: Vec<_> = map.gaps().collect();
        assert_eq!(gaps, vec![(3, 3), (5, 8), (10, 25), (31, 31)]);
        for pair in gaps.windows(2) {
            assert!(pair[1].0 > pair[0].1 + 1);
        }
    }

    #[test]
    fn test_slide_drops_whole_bytes() {
        let mut map = ReceiveMap::new(1, 65536);
        let n = net();
        for tsn in 1..=20 {
            assert!(map.note_received(tsn, n, false));
        }
        assert_eq!(map.cum_tsn, 20);
        assert_eq!(map.base_tsn(), 17);
        assert!(!map.note_received(7, n, false));
        assert_eq!(map.dups, vec![7]);
        assert!(map.gaps().next().is_none());
    }

    #[test]
    fn test_nr_bits_tracked_separately() {
        let mut map = ReceiveMap::new(1, 65536);
        let n = net();
        map.note_received(3, n, false);
        map.note_received(5, n, true);
        assert_eq!(map.gaps().collect::<Vec<_>>(), vec![(3, 3)]);
        assert_eq!(map.nr_gaps().collect::<Vec<_>>(), vec![(5, 5)]);
    }

    #[test]
    fn test_nr_sack_body_layout() {
        let report = AckReport {
            cum_tsn: 7,
            a_rwnd: 1000,
            gaps: vec![(2, 3)],
            nr_gaps: vec![(5, 5)],
            dups: vec![4],
            non_renegable: true,
        };
        let body = report.encode_body();
        assert_eq!(report.kind(), CT_NR_SACK);
        assert_eq!(body.len(), 16 + 4 + 4 + 4);
        assert_eq!(&body[8..10], &1u16.to_be_bytes());
        assert_eq!(&body[10..12], &1u16.to_be_bytes());
        assert_eq!(&body[12..14], &1u16.to_be_bytes());
        assert_eq!(&body[20..24], &[0, 5, 0, 5]);
    }

    fn association(nr_sack: bool) -> (Association, NetId) {
        let mut params = AssociationParams::new(2);
        params.capabilities.nr_sack = nr_sack;
        let config = EngineConfig {
            nr_sack,
            ..Default::default()
        };
        let mut a = Association::new(params, config, Instant::now());
        let net = a.add_destination("192.0.2.1:5000".parse().unwrap(), ReachState::Active);
        (a, net)
    }

    fn queued_acks(a: &Association) -> Vec<&ControlChunk> {
        a.control_queue()
            .iter()
            .filter(|c| c.kind == CT_SACK || c.kind == CT_NR_SACK)
            .collect()
    }

    #[test]
    fn test_build_ack_reports_non_renegable_blocks() {
        let (mut a, net) = association(true);
        for tsn in [1, 2, 4] {
            a.note_received(tsn, net, false);
        }
        a.note_received(6, net, true);

        let report = a.build_ack().unwrap();
        assert_eq!(report.kind(), CT_NR_SACK);
        assert_eq!(report.cum_tsn, 2);
        assert_eq!(report.gaps, vec![(2, 2)]);
        assert_eq!(report.nr_gaps, vec![(4, 4)]);
        assert_eq!(report.a_rwnd, a.recv.capacity());

        let queued = queued_acks(&a);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, CT_NR_SACK);
        assert_eq!(queued[0].dest, net);
        assert_eq!(queued[0].body, report.encode_body());
    }

    #[test]
    fn test_nr_sack_needs_both_sides() {
        // configured locally but not negotiated: plain SACK with the union
        let (mut a, net) = association(false);
        a.config.nr_sack = true;
        for tsn in [1, 3] {
            a.note_received(tsn, net, false);
        }
        a.note_received(4, net, true);
        let report = a.build_ack().unwrap();
        assert_eq!(report.kind(), CT_SACK);
        assert_eq!(report.gaps, vec![(2, 3)]);
        assert!(report.nr_gaps.is_empty());
    }

    #[test]
    fn test_later_ack_replaces_queued_one() {
        let (mut a, net) = association(false);
        assert!(a.build_ack().is_none());

        a.note_received(1, net, false);
        a.build_ack().unwrap();
        a.note_received(2, net, false);
        a.note_received(2, net, false);
        let report = a.build_ack().unwrap();

        let queued = queued_acks(&a);
        assert_eq!(queued.len(), 1);
        assert_eq!(&queued[0].body[..4], &2u32.to_be_bytes());
        assert_eq!(report.dups, vec![2]);
        assert!(!a.sack_pending);
    }

    #[test]
    fn test_unslid_cumulative_ack_is_repaired() {
        let (mut a, _) = association(false);
        // arrivals recorded without advancing the cumulative ack
        for tsn in 1..=3 {
            assert!(a.recv.mark(tsn, false));
        }
        a.recv.mark(5, false);
        assert_eq!(a.recv.cum_tsn, 0);

        let report = a.build_ack().unwrap();
        assert_eq!(report.cum_tsn, 3);
        assert_eq!(report.gaps, vec![(2, 2)]);
        assert_eq!(a.recv.cum_tsn, 3);
    }
}
