//! Per-process staging area
//!
//! The staging area is the scratch buffer of one weave: inbound events
//! are merged here at ingress, modules read them sequentially with a
//! byte-offset cursor and write tentative static-topic outputs back.
//! Commit drains the outputs into the timeline; discard drops the whole
//! buffer intact. The buffer is re-zeroed at every weave start.

use core_types::{KernelError, MIN_BUS_BYTES};

use crate::event::EventRecord;

/// Where a staged entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedOrigin {
    /// Deposited by the kernel at ingress (or mid-weave kernel replies).
    Inbound,
    /// Written tentatively by a pipeline module.
    Output,
}

#[derive(Debug, Clone)]
struct StagedEntry {
    origin: StagedOrigin,
    record: EventRecord,
    offset: usize,
    frame_len: usize,
}

/// Fixed-capacity scratch buffer of framed events.
#[derive(Debug, Clone)]
pub struct StagingArea {
    buf: Vec<u8>,
    entries: Vec<StagedEntry>,
    capacity: usize,
}

impl StagingArea {
    /// Creates a staging area; capacity is clamped up to the bus floor.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_BUS_BYTES);
        Self { buf: Vec::new(), entries: Vec::new(), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total framed bytes currently staged.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Zeroes the buffer for a new weave.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.entries.clear();
    }

    /// Appends a framed event. A full buffer is an allocation failure.
    pub fn append(&mut self, origin: StagedOrigin, record: EventRecord) -> Result<(), KernelError> {
        let frame_len = record.frame_len();
        if self.buf.len() + frame_len > self.capacity {
            return Err(KernelError::Oom(format!(
                "staging area full: {} of {} bytes used, frame needs {}",
                self.buf.len(),
                self.capacity,
                frame_len
            )));
        }
        let offset = self.buf.len();
        record.encode_frame(0, &mut self.buf);
        self.entries.push(StagedEntry { origin, record, offset, frame_len });
        Ok(())
    }

    /// Sequential cursor read: returns the frame of the first event on
    /// `topic` starting at or after byte offset `start`, copied into
    /// `out`, together with the end offset of that frame. `None` when no
    /// further event matches.
    pub fn read(&self, topic: &str, start: u64, out: &mut Vec<u8>) -> Option<u64> {
        for entry in &self.entries {
            if (entry.offset as u64) < start {
                continue;
            }
            if entry.record.topic.as_str() == topic {
                out.extend_from_slice(&self.buf[entry.offset..entry.offset + entry.frame_len]);
                return Some((entry.offset + entry.frame_len) as u64);
            }
        }
        None
    }

    /// End offset of the last inbound entry; used to judge whether a
    /// parking module left inputs unread.
    pub fn inputs_end(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.origin == StagedOrigin::Inbound)
            .map(|e| (e.offset + e.frame_len) as u64)
            .max()
            .unwrap_or(0)
    }

    /// Tentative outputs in write order, drained at commit.
    pub fn outputs(&self) -> impl Iterator<Item = &EventRecord> {
        self.entries.iter().filter(|e| e.origin == StagedOrigin::Output).map(|e| &e.record)
    }

    /// All staged records in order (inbound and outputs).
    pub fn records(&self) -> impl Iterator<Item = (StagedOrigin, &EventRecord)> {
        self.entries.iter().map(|e| (e.origin, &e.record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use core_types::{Topic, VirtualTime};

    fn record(topic: &str, payload: &[u8]) -> EventRecord {
        EventRecord::new(
            Topic::new(topic).unwrap(),
            payload.to_vec(),
            EventMeta::at(VirtualTime::ZERO),
        )
        .unwrap()
    }

    #[test]
    fn test_capacity_floor() {
        let staging = StagingArea::new(16);
        assert_eq!(staging.capacity(), MIN_BUS_BYTES);
    }

    #[test]
    fn test_sequential_cursor_read() {
        let mut staging = StagingArea::new(0);
        staging.append(StagedOrigin::Inbound, record("a", &[1])).unwrap();
        staging.append(StagedOrigin::Inbound, record("b", &[2])).unwrap();
        staging.append(StagedOrigin::Inbound, record("a", &[3])).unwrap();

        let mut out = Vec::new();
        let first_end = staging.read("a", 0, &mut out).unwrap();
        let frame = abi::decode_event(&out).unwrap();
        assert_eq!(frame.payload, &[1, 0, 0, 0, 0, 0, 0, 0][..frame.header.data_len as usize]);

        out.clear();
        let second_end = staging.read("a", first_end, &mut out).unwrap();
        assert!(second_end > first_end);
        let frame = abi::decode_event(&out).unwrap();
        assert_eq!(&frame.payload[..1], &[3]);

        out.clear();
        assert_eq!(staging.read("a", second_end, &mut out), None);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut staging = StagingArea::new(0);
        staging.append(StagedOrigin::Output, record("x", &[0])).unwrap();
        staging.reset();
        assert!(staging.is_empty());
        assert_eq!(staging.len(), 0);
        assert_eq!(staging.inputs_end(), 0);
    }

    #[test]
    fn test_full_staging_is_oom() {
        let mut staging = StagingArea::new(0);
        let big_payload = vec![0u8; 40_000];
        staging.append(StagedOrigin::Output, record("x", &big_payload)).unwrap();
        let err = staging.append(StagedOrigin::Output, record("x", &big_payload)).unwrap_err();
        assert!(matches!(err, KernelError::Oom(_)));
    }

    #[test]
    fn test_inputs_end_ignores_outputs() {
        let mut staging = StagingArea::new(0);
        staging.append(StagedOrigin::Inbound, record("in", &[1])).unwrap();
        let inputs = staging.inputs_end();
        staging.append(StagedOrigin::Output, record("out", &[2])).unwrap();
        assert_eq!(staging.inputs_end(), inputs);
        assert_eq!(staging.outputs().count(), 1);
    }
}
