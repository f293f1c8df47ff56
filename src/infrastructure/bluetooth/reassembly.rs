//! Multi-packet response reassembly.
//!
//! Multi-packet families tag each frame with a marker in payload byte 0:
//!
//! ```text
//! 0x00        : header, payload[1] = total records (header family)
//! 0x01        : timestamp / date packet
//! 0xF0        : init packet, payload[5] = last packet index (init family)
//! 0x02..=0xFE : data packet, the marker is its index
//! 0xFF        : end marker
//! ```
//!
//! Packets may arrive in any order. A lost packet is never recovered here;
//! the buffer simply stays incomplete until the request times out.

use crate::domain::opcode::Opcode;
use crate::infrastructure::bluetooth::protocol::{Frame, Packet};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

const MARKER_HEADER: u8 = 0x00;
const MARKER_TIMESTAMP: u8 = 0x01;
const MARKER_INIT: u8 = 0xF0;
const MARKER_END: u8 = 0xFF;

/// Offset of the last-packet index inside an init payload
const INIT_LAST_INDEX_OFFSET: usize = 5;

/// Size of one record in timestamp-sentinel families (u32 timestamp + 2 values)
const SENTINEL_RECORD_SIZE: usize = 6;
const SENTINEL_TIMESTAMP: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Header,
    Timestamp,
    Init,
    Data(u8),
    End,
}

impl PacketKind {
    pub fn classify(marker: u8) -> Self {
        match marker {
            MARKER_HEADER => Self::Header,
            MARKER_TIMESTAMP => Self::Timestamp,
            MARKER_INIT => Self::Init,
            MARKER_END => Self::End,
            index => Self::Data(index),
        }
    }
}

/// How the buffer knows it has everything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Header family: complete once a data index reaches `total_records - 1`
    Records { total_records: u8 },
    /// Init family: complete once a data index reaches `last_index`
    Packets { last_index: u8 },
}

#[derive(Debug, Clone)]
pub struct PacketBuffer {
    pub opcode: u8,
    packets: BTreeMap<u8, Packet>,
    init: Option<Packet>,
    completion: Option<Completion>,
    complete: bool,
}

impl PacketBuffer {
    fn new(opcode: u8) -> Self {
        Self {
            opcode,
            packets: BTreeMap::new(),
            init: None,
            completion: None,
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    pub fn len(&self) -> usize {
        self.packets.len() + usize::from(self.init.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Init packet first, then header/timestamp/data by index.
    pub fn ordered(&self) -> Vec<Packet> {
        self.init
            .iter()
            .chain(self.packets.values())
            .copied()
            .collect()
    }

    fn highest_data_index(&self) -> Option<u8> {
        self.packets
            .keys()
            .rev()
            .find(|index| **index > MARKER_TIMESTAMP)
            .copied()
    }

    fn threshold_reached(&self) -> bool {
        match self.completion {
            Some(Completion::Records { total_records: 0 }) => true,
            Some(Completion::Records { total_records }) => self
                .highest_data_index()
                .is_some_and(|index| index >= total_records - 1),
            Some(Completion::Packets { last_index }) => self
                .highest_data_index()
                .is_some_and(|index| index >= last_index),
            None => false,
        }
    }
}

/// Per-opcode packet accumulation.
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<u8, PacketBuffer>,
    multi_packet: HashSet<u8>,
    sentinel: HashSet<u8>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(
            Opcode::multi_packet_codes(),
            Opcode::ALL
                .into_iter()
                .filter(|op| op.has_timestamp_sentinel())
                .map(Opcode::code),
        )
    }
}

impl Reassembler {
    /// `multi_packet` lists opcodes whose responses span several frames;
    /// `sentinel` lists those whose records end on a 0xFFFFFFFF timestamp.
    pub fn new(
        multi_packet: impl IntoIterator<Item = u8>,
        sentinel: impl IntoIterator<Item = u8>,
    ) -> Self {
        Self {
            buffers: HashMap::new(),
            multi_packet: multi_packet.into_iter().collect(),
            sentinel: sentinel.into_iter().collect(),
        }
    }

    /// Store a frame's payload.
    ///
    /// Returns `true` while more packets are expected and `false` once the
    /// response for `opcode` is complete.
    pub fn process_packet(&mut self, opcode: u8, frame: &Frame) -> bool {
        let payload = frame.payload();
        let buffer = self
            .buffers
            .entry(opcode)
            .or_insert_with(|| PacketBuffer::new(opcode));

        if buffer.complete {
            return false;
        }

        if !self.multi_packet.contains(&opcode) {
            buffer.packets.insert(0, payload);
            buffer.complete = true;
            return false;
        }

        let kind = PacketKind::classify(payload[0]);
        trace!("opcode {:#04x}: {:?} packet", opcode, kind);

        match kind {
            PacketKind::Header => {
                buffer.completion = Some(Completion::Records {
                    total_records: payload[1],
                });
                buffer.packets.insert(MARKER_HEADER, payload);
            }
            PacketKind::Timestamp => {
                buffer.packets.insert(MARKER_TIMESTAMP, payload);
            }
            PacketKind::Init => {
                buffer.completion = Some(Completion::Packets {
                    last_index: payload[INIT_LAST_INDEX_OFFSET],
                });
                buffer.init = Some(payload);
            }
            PacketKind::Data(index) => {
                buffer.packets.insert(index, payload);
            }
            PacketKind::End => {
                buffer.complete = true;
            }
        }

        if !buffer.complete && self.sentinel.contains(&opcode) && has_sentinel_record(&payload) {
            debug!("opcode {:#04x}: end-of-records timestamp", opcode);
            buffer.complete = true;
        }

        if !buffer.complete && buffer.threshold_reached() {
            buffer.complete = true;
        }

        !buffer.complete
    }

    pub fn buffer(&self, opcode: u8) -> Option<&PacketBuffer> {
        self.buffers.get(&opcode)
    }

    /// Packets for `opcode` sorted by index, whatever the arrival order.
    pub fn ordered_packets(&self, opcode: u8) -> Vec<Packet> {
        self.buffers
            .get(&opcode)
            .map(PacketBuffer::ordered)
            .unwrap_or_default()
    }

    /// Remove and return a completed response.
    pub fn take_complete(&mut self, opcode: u8) -> Option<Vec<Packet>> {
        if !self.buffers.get(&opcode)?.is_complete() {
            return None;
        }
        self.buffers.remove(&opcode).map(|buffer| buffer.ordered())
    }

    pub fn clear_buffer(&mut self, opcode: u8) {
        self.buffers.remove(&opcode);
    }

    pub fn clear_all(&mut self) {
        self.buffers.clear();
    }
}

fn has_sentinel_record(payload: &Packet) -> bool {
    payload
        .chunks_exact(SENTINEL_RECORD_SIZE)
        .any(|record| {
            u32::from_le_bytes([record[0], record[1], record[2], record[3]]) == SENTINEL_TIMESTAMP
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HISTORY: u8 = 0x15;
    const SLEEP: u8 = 0x44;
    const PRESSURE: u8 = 0x14;
    const BATTERY: u8 = 0x03;

    fn frame(opcode: u8, payload: &[u8]) -> Frame {
        Frame::encode(opcode, payload).unwrap()
    }

    #[test]
    fn test_single_packet_completes_immediately() {
        let mut reassembler = Reassembler::default();
        assert!(!reassembler.process_packet(BATTERY, &frame(BATTERY, &[0x55, 0x00])));
        let packets = reassembler.take_complete(BATTERY).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], 0x55);
        assert!(reassembler.buffer(BATTERY).is_none());
    }

    #[test]
    fn test_header_family_in_order() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x00, 0x04])));
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x01, 0x10])));
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x02, 0x48])));
        assert!(!reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x03, 0x50])));

        let markers: Vec<u8> = reassembler
            .ordered_packets(HISTORY)
            .iter()
            .map(|p| p[0])
            .collect();
        assert_eq!(markers, vec![0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_reordered_packets_are_sorted() {
        let mut reassembler = Reassembler::default();
        // total_records = 5 -> complete once index 4 is present
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x00, 0x05])));
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x03, 0xCC])));
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x02, 0xBB])));
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x01, 0xAA])));
        assert!(!reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x04, 0xDD])));

        let second_bytes: Vec<u8> = reassembler
            .take_complete(HISTORY)
            .unwrap()
            .iter()
            .map(|p| p[1])
            .collect();
        assert_eq!(second_bytes, vec![0x05, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_data_before_header_completes_when_header_arrives() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x02, 0x48])));
        assert!(!reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x00, 0x03])));
        let markers: Vec<u8> = reassembler
            .ordered_packets(HISTORY)
            .iter()
            .map(|p| p[0])
            .collect();
        assert_eq!(markers, vec![0x00, 0x02]);
    }

    #[test]
    fn test_missing_packet_never_completes() {
        let mut reassembler = Reassembler::default();
        reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x00, 0x06]));
        for index in [0x02, 0x03, 0x04] {
            assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &[index])));
        }
        assert!(reassembler.take_complete(HISTORY).is_none());
        assert!(!reassembler.buffer(HISTORY).unwrap().is_complete());
    }

    #[test]
    fn test_empty_history_completes_on_header() {
        let mut reassembler = Reassembler::default();
        assert!(!reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x00, 0x00])));
    }

    #[test]
    fn test_init_family_completes_exactly_at_last_index() {
        let mut reassembler = Reassembler::default();
        let init = [0xF0, 0x00, 0x00, 0x00, 0x00, 0x03];
        assert!(reassembler.process_packet(SLEEP, &frame(SLEEP, &init)));
        assert_eq!(
            reassembler.buffer(SLEEP).unwrap().completion(),
            Some(Completion::Packets { last_index: 3 })
        );
        assert!(reassembler.process_packet(SLEEP, &frame(SLEEP, &[0x02, 0x11])));
        assert!(!reassembler.process_packet(SLEEP, &frame(SLEEP, &[0x03, 0x22])));

        let packets = reassembler.take_complete(SLEEP).unwrap();
        assert_eq!(packets[0][0], 0xF0);
        assert_eq!(packets[1][0], 0x02);
        assert_eq!(packets[2][0], 0x03);
    }

    #[test]
    fn test_init_family_last_index_two() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.process_packet(SLEEP, &frame(SLEEP, &[0xF0, 0, 0, 0, 0, 0x02])));
        assert!(reassembler.process_packet(SLEEP, &frame(SLEEP, &[0x01, 0x24, 0x01, 0x15])));
        assert!(!reassembler.process_packet(SLEEP, &frame(SLEEP, &[0x02, 0x33])));
    }

    #[test]
    fn test_end_marker_completes() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.process_packet(SLEEP, &frame(SLEEP, &[0x02, 0x01])));
        assert!(!reassembler.process_packet(SLEEP, &frame(SLEEP, &[0xFF])));
        assert_eq!(reassembler.ordered_packets(SLEEP).len(), 1);
    }

    #[test]
    fn test_pressure_sentinel_timestamp() {
        let mut reassembler = Reassembler::default();
        // record 0: a real reading, record 1: the end-of-records timestamp
        let first = [0x05, 0x10, 0x5E, 0x66, 0x50, 0x78, 0x06, 0x20, 0x5E, 0x66, 0x52, 0x7A];
        let last = [0x07, 0x30, 0x5E, 0x66, 0x51, 0x79, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00];
        assert!(reassembler.process_packet(PRESSURE, &frame(PRESSURE, &first)));
        assert!(!reassembler.process_packet(PRESSURE, &frame(PRESSURE, &last)));
    }

    #[test]
    fn test_sentinel_ignored_for_other_families() {
        let mut reassembler = Reassembler::default();
        let payload = [0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(reassembler.process_packet(HISTORY, &frame(HISTORY, &payload)));
    }

    #[test]
    fn test_clear_buffer_discards_stale_generation() {
        let mut reassembler = Reassembler::default();
        reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x00, 0x09]));
        reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x05, 0x01]));
        reassembler.clear_buffer(HISTORY);
        assert!(reassembler.ordered_packets(HISTORY).is_empty());

        // new generation with its own header
        assert!(!reassembler.process_packet(HISTORY, &frame(HISTORY, &[0x00, 0x00])));
    }
}
