//! Owned event records
//!
//! `EventRecord` is the kernel-side form of one event: topic, payload
//! bytes, and header metadata. Frames (the wire form) are produced on
//! demand; blob references are extracted once at construction so commit
//! and channel transfer never re-parse payloads.

use abi::{encode_event, DecodedEvent, Encoding, EventHeader};
use core_types::{AgentId, BlobId, KernelError, Tick, Topic, TraceContext, VirtualTime};
use value::Value;

/// Header metadata carried alongside every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    /// Informational wall-clock stamp; never constrained.
    pub wall_ts: u64,
    pub virt_time: VirtualTime,
    /// FNV-1a hash of the schema URI, 0 when unschematized.
    pub schema_hash: u64,
    pub agent: AgentId,
    pub user: AgentId,
    pub trace: TraceContext,
    pub encoding: Encoding,
    pub flags: u16,
}

impl EventMeta {
    /// Metadata with everything defaulted except virtual time.
    pub fn at(virt_time: VirtualTime) -> Self {
        Self {
            wall_ts: 0,
            virt_time,
            schema_hash: 0,
            agent: AgentId::nil(),
            user: AgentId::nil(),
            trace: TraceContext::none(),
            encoding: Encoding::Raw,
            flags: 0,
        }
    }
}

/// One event owned by the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub meta: EventMeta,
    /// Blob handles referenced by the payload, extracted at construction.
    pub blob_refs: Vec<BlobId>,
}

impl EventRecord {
    /// Builds a record from a raw payload. `Encoding::Value` payloads
    /// are parsed to validate structure and extract blob references.
    pub fn new(topic: Topic, payload: Vec<u8>, meta: EventMeta) -> Result<Self, KernelError> {
        let blob_refs = match meta.encoding {
            Encoding::Value => {
                let parsed = value::parse_value(&payload, 0)?;
                parsed.blob_refs()
            }
            Encoding::Raw => Vec::new(),
        };
        Ok(Self { topic, payload, meta, blob_refs })
    }

    /// Builds a value-encoded record from an owned value.
    pub fn from_value(topic: Topic, val: &Value, mut meta: EventMeta) -> Result<Self, KernelError> {
        meta.encoding = Encoding::Value;
        let mut payload = Vec::new();
        value::emit_value(val, 0, &mut payload)?;
        Ok(Self { topic, blob_refs: val.blob_refs(), payload, meta })
    }

    /// Parses the payload as a value (self-contained, base 0).
    pub fn value(&self) -> Result<Value, KernelError> {
        if self.meta.encoding != Encoding::Value {
            return Err(KernelError::Type("payload is not value-encoded".to_string()));
        }
        Ok(value::parse_value(&self.payload, 0)?)
    }

    /// Appends the frame for this record with the given sequence id.
    pub fn encode_frame(&self, seq: u64, out: &mut Vec<u8>) {
        let header = EventHeader {
            seq,
            wall_ts: self.meta.wall_ts,
            virt_time: self.meta.virt_time.as_nanos(),
            schema_hash: self.meta.schema_hash,
            agent: self.meta.agent.as_bytes(),
            user: self.meta.user.as_bytes(),
            trace: abi::AbiTraceContext::from_trace(&self.meta.trace),
            topic_len: 0,
            data_len: 0,
            encoding: self.meta.encoding.as_u16(),
            flags: self.meta.flags,
        };
        encode_event(&header, self.topic.as_str().as_bytes(), &self.payload, out);
    }

    /// Frame length of this record on the wire.
    pub fn frame_len(&self) -> usize {
        abi::event_frame_len(self.topic.as_str().len(), self.payload.len())
    }

    /// Reconstructs a record from a decoded frame.
    pub fn from_frame(frame: &DecodedEvent<'_>) -> Result<Self, KernelError> {
        let topic_str = std::str::from_utf8(frame.topic)
            .map_err(|_| KernelError::Invalid("topic is not valid UTF-8".to_string()))?;
        let topic = Topic::new(topic_str)?;
        let meta = EventMeta {
            wall_ts: frame.header.wall_ts,
            virt_time: VirtualTime::from_nanos(frame.header.virt_time),
            schema_hash: frame.header.schema_hash,
            agent: AgentId::from_bytes(frame.header.agent),
            user: AgentId::from_bytes(frame.header.user),
            trace: frame.header.trace.to_trace(),
            encoding: Encoding::from_u16(frame.header.encoding)?,
            flags: frame.header.flags,
        };
        Self::new(topic, frame.payload.to_vec(), meta)
    }
}

/// One committed event on a timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEvent {
    pub tick: Tick,
    pub record: EventRecord,
    /// Payload zeroed by a mutable-policy redaction; header preserved.
    pub redacted: bool,
}

/// FNV-1a 64-bit hash, used for schema URI hashes in headers.
pub fn schema_hash(uri: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in uri.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
