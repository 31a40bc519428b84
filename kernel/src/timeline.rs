//! Timeline store and cursors
//!
//! The timeline is the append-only committed event log of one process.
//! Ticks are assigned at commit, strictly monotonic, and never shift:
//! pruning advances a low-watermark without compacting, redaction zeroes
//! payload bytes in place. Retention behavior is the one genuine
//! dynamic-dispatch site here, modeled as a small trait behind a direct
//! call.

use std::collections::HashMap;

use abi::{event_frame_len, EventHeader, EVENT_HEADER_SIZE};
use core_types::{KernelError, ProcessId, Tick};

use crate::event::{CommittedEvent, EventRecord};

/// Mutable state shared by every retention policy.
#[derive(Debug, Default)]
pub struct TimelineState {
    events: Vec<CommittedEvent>,
    next_tick: Tick,
    /// Events with `tick < watermark` are unreadable.
    watermark: Tick,
    topic_index: HashMap<String, Vec<usize>>,
}

/// Retention behavior of a timeline.
pub trait RetentionPolicy: std::fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Advances the unreadable watermark past `upto`.
    fn prune(&self, state: &mut TimelineState, upto: Tick) -> Result<(), KernelError>;

    /// Tombstones one event: payload zeroed, header and id preserved.
    fn redact(&self, state: &mut TimelineState, tick: Tick) -> Result<(), KernelError>;
}

/// Rejects any modification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Strict;

impl RetentionPolicy for Strict {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn prune(&self, _state: &mut TimelineState, _upto: Tick) -> Result<(), KernelError> {
        Err(KernelError::Permission("strict timeline rejects pruning".to_string()))
    }

    fn redact(&self, _state: &mut TimelineState, _tick: Tick) -> Result<(), KernelError> {
        Err(KernelError::Permission("strict timeline rejects redaction".to_string()))
    }
}

/// Maintains a monotonically advancing low-watermark.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prunable;

impl RetentionPolicy for Prunable {
    fn name(&self) -> &'static str {
        "prunable"
    }

    fn prune(&self, state: &mut TimelineState, upto: Tick) -> Result<(), KernelError> {
        let candidate = upto.next();
        if candidate > state.watermark {
            state.watermark = candidate;
        }
        Ok(())
    }

    fn redact(&self, _state: &mut TimelineState, _tick: Tick) -> Result<(), KernelError> {
        Err(KernelError::Permission("prunable timeline rejects redaction".to_string()))
    }
}

/// Supports tombstoning committed events.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutableLog;

impl RetentionPolicy for MutableLog {
    fn name(&self) -> &'static str {
        "mutable"
    }

    fn prune(&self, _state: &mut TimelineState, _upto: Tick) -> Result<(), KernelError> {
        Err(KernelError::Permission("mutable timeline rejects pruning".to_string()))
    }

    fn redact(&self, state: &mut TimelineState, tick: Tick) -> Result<(), KernelError> {
        let event = state
            .events
            .iter_mut()
            .find(|e| e.tick == tick)
            .ok_or_else(|| KernelError::NotFound(format!("no event at {}", tick)))?;
        event.record.payload.fill(0);
        event.redacted = true;
        Ok(())
    }
}

/// Append-only committed event log of one process.
#[derive(Debug)]
pub struct Timeline {
    state: TimelineState,
    policy: Box<dyn RetentionPolicy>,
}

impl Timeline {
    pub fn new(policy: Box<dyn RetentionPolicy>) -> Self {
        Self { state: TimelineState::default(), policy }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Appends a committed record and assigns its tick.
    pub fn append(&mut self, record: EventRecord) -> Tick {
        let tick = self.state.next_tick.next();
        self.state.next_tick = tick;
        let index = self.state.events.len();
        self.state
            .topic_index
            .entry(record.topic.as_str().to_string())
            .or_default()
            .push(index);
        self.state.events.push(CommittedEvent { tick, record, redacted: false });
        tick
    }

    pub fn len(&self) -> usize {
        self.state.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.events.is_empty()
    }

    pub fn last_tick(&self) -> Tick {
        self.state.next_tick
    }

    pub fn watermark(&self) -> Tick {
        self.state.watermark
    }

    pub fn is_readable(&self, tick: Tick) -> bool {
        tick >= self.state.watermark
    }

    pub fn events(&self) -> &[CommittedEvent] {
        &self.state.events
    }

    /// Readable event at an exact tick.
    pub fn get(&self, tick: Tick) -> Option<&CommittedEvent> {
        if !self.is_readable(tick) {
            return None;
        }
        self.state.events.iter().find(|e| e.tick == tick)
    }

    pub fn prune(&mut self, upto: Tick) -> Result<(), KernelError> {
        self.policy.prune(&mut self.state, upto)
    }

    pub fn redact(&mut self, tick: Tick) -> Result<(), KernelError> {
        self.policy.redact(&mut self.state, tick)
    }

    /// Indices of events matching a cursor's filter and bounds, in
    /// iteration order. The per-topic index narrows the candidate set;
    /// indices are never compacted, so they stay valid across prunes.
    fn matching_indices(&self, spec: &CursorSpec) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .state
            .topic_index
            .iter()
            .filter(|(topic, _)| topic.as_bytes().starts_with(spec.topic_prefix.as_bytes()))
            .flat_map(|(_, bucket)| bucket.iter().copied())
            .collect();
        indices.sort_unstable();
        indices.retain(|i| spec.bounds.contains(&self.state.events[*i]));
        if spec.descending {
            indices.reverse();
        }
        indices
    }
}

/// Inclusive-start, exclusive-end cursor bounds, over either the tick
/// order or virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorBounds {
    Ticks { start: Tick, end: Tick },
    VirtualTime { start: core_types::VirtualTime, end: core_types::VirtualTime },
}

impl CursorBounds {
    fn contains(&self, event: &CommittedEvent) -> bool {
        match self {
            CursorBounds::Ticks { start, end } => event.tick >= *start && event.tick < *end,
            CursorBounds::VirtualTime { start, end } => {
                let vt = event.record.meta.virt_time;
                vt >= *start && vt < *end
            }
        }
    }
}

/// Bounds and filter of one cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSpec {
    /// Byte-exact topic prefix; empty matches everything.
    pub topic_prefix: String,
    pub bounds: CursorBounds,
    pub descending: bool,
}

#[derive(Debug)]
struct CursorState {
    pid: ProcessId,
    indices: Vec<usize>,
    pos: usize,
}

/// Open cursors across all processes.
#[derive(Debug, Default)]
pub struct CursorTable {
    cursors: HashMap<u64, CursorState>,
    next: u64,
}

impl CursorTable {
    pub fn new() -> Self {
        Self { next: 1, ..Default::default() }
    }

    /// Opens a cursor over the snapshot of currently committed events.
    pub fn open(&mut self, pid: ProcessId, timeline: &Timeline, spec: &CursorSpec) -> u64 {
        let id = self.next;
        self.next += 1;
        self.cursors.insert(id, CursorState { pid, indices: timeline.matching_indices(spec), pos: 0 });
        id
    }

    pub fn owner(&self, cursor: u64) -> Option<ProcessId> {
        self.cursors.get(&cursor).map(|c| c.pid)
    }

    /// Streams whole relocated frames into `out`, at most `capacity`
    /// bytes. Returns bytes written; 0 signals end of stream. A cursor
    /// whose next event was pruned is invalid and stays so until closed.
    pub fn next(
        &mut self,
        cursor: u64,
        timeline: &Timeline,
        capacity: u64,
        out: &mut Vec<u8>,
    ) -> Result<u64, KernelError> {
        let state = self
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| KernelError::NotFound(format!("no cursor {}", cursor)))?;

        let mut written: u64 = 0;
        while state.pos < state.indices.len() {
            let event = &timeline.events()[state.indices[state.pos]];
            if !timeline.is_readable(event.tick) {
                return Err(KernelError::NotFound(format!(
                    "cursor {} invalidated: {} pruned",
                    cursor, event.tick
                )));
            }
            let record = &event.record;
            let frame_len = record.frame_len() as u64;
            if written + frame_len > capacity {
                if written == 0 {
                    // Never a partial event: nothing fit at all.
                    return Err(KernelError::Oom(format!(
                        "buffer of {} bytes holds no frame of {} bytes",
                        capacity, frame_len
                    )));
                }
                break;
            }
            write_relocated_frame(record, event.tick, written, out)?;
            written += frame_len;
            state.pos += 1;
        }
        Ok(written)
    }

    pub fn close(&mut self, cursor: u64) -> Result<(), KernelError> {
        self.cursors
            .remove(&cursor)
            .map(|_| ())
            .ok_or_else(|| KernelError::NotFound(format!("no cursor {}", cursor)))
    }

    /// Closes every cursor opened by a terminating process.
    pub fn remove_for_process(&mut self, pid: ProcessId) {
        self.cursors.retain(|_, c| c.pid != pid);
    }

    /// Closes a batch of cursors (discard rollback of a weave).
    pub fn remove_batch(&mut self, cursors: &[u64]) {
        for cursor in cursors {
            self.cursors.remove(cursor);
        }
    }

    pub fn count(&self) -> usize {
        self.cursors.len()
    }
}

/// Encodes one frame with the payload relocated so that inner pointers
/// are valid offsets within the destination buffer.
fn write_relocated_frame(
    record: &EventRecord,
    tick: Tick,
    frame_offset: u64,
    out: &mut Vec<u8>,
) -> Result<(), KernelError> {
    let topic = record.topic.as_str().as_bytes();
    let payload = if record.meta.encoding == abi::Encoding::Value && !record.payload.is_empty() {
        let payload_offset =
            frame_offset + (EVENT_HEADER_SIZE + abi::bytes::align8(topic.len())) as u64;
        value::relocate_payload(&record.payload, 0, payload_offset)?
    } else {
        record.payload.clone()
    };
    let header = EventHeader {
        seq: tick.as_u64(),
        wall_ts: record.meta.wall_ts,
        virt_time: record.meta.virt_time.as_nanos(),
        schema_hash: record.meta.schema_hash,
        agent: record.meta.agent.as_bytes(),
        user: record.meta.user.as_bytes(),
        trace: abi::AbiTraceContext::from_trace(&record.meta.trace),
        topic_len: 0,
        data_len: 0,
        encoding: record.meta.encoding.as_u16(),
        flags: record.meta.flags,
    };
    debug_assert_eq!(
        event_frame_len(topic.len(), payload.len()),
        record.frame_len(),
        "relocation must preserve frame length"
    );
    abi::encode_event(&header, topic, &payload, out);
    Ok(())
}
