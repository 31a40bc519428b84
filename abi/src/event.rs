//! Event header and frame layout
//!
//! A framed event is a 128-byte header, the topic bytes padded to 8-byte
//! alignment, then the payload, with the whole frame 8-aligned:
//!
//! ```text
//! +-----------------+----------------+-----------------+
//! | header (128 B)  | topic + pad    | payload + pad   |
//! +-----------------+----------------+-----------------+
//! ```
//!
//! `total_len` is derived from the header's declared lengths; decode
//! rejects frames whose buffer disagrees.

use crate::bytes::{align8, ByteReader, ByteWriter};
use crate::structs::AbiTraceContext;
use crate::AbiError;

/// Size of the fixed event header.
pub const EVENT_HEADER_SIZE: usize = 128;

/// Fixed 128-byte event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    /// Sequence id; on a timeline this is the committed tick.
    pub seq: u64,
    /// Informational wall-clock timestamp; never constrained.
    pub wall_ts: u64,
    /// Virtual time at commit.
    pub virt_time: u64,
    /// Hash of the payload schema URI, 0 when unschematized.
    pub schema_hash: u64,
    /// Source agent identity.
    pub agent: [u8; 16],
    /// Source user identity.
    pub user: [u8; 16],
    /// Trace propagation record.
    pub trace: AbiTraceContext,
    pub topic_len: u32,
    pub data_len: u32,
    /// Payload encoding discriminant.
    pub encoding: u16,
    pub flags: u16,
}

impl EventHeader {
    /// Total frame length implied by the declared topic/payload lengths.
    pub fn total_len(&self) -> usize {
        EVENT_HEADER_SIZE + align8(self.topic_len as usize) + align8(self.data_len as usize)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u64(self.seq);
        w.put_u64(self.wall_ts);
        w.put_u64(self.virt_time);
        w.put_u64(self.schema_hash);
        w.put_bytes(&self.agent);
        w.put_bytes(&self.user);
        drop(w);
        self.trace.encode(out);
        let mut w = ByteWriter::new(out);
        w.put_u32(self.topic_len);
        w.put_u32(self.data_len);
        w.put_u16(self.encoding);
        w.put_u16(self.flags);
        w.put_pad(20);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let seq = r.get_u64()?;
        let wall_ts = r.get_u64()?;
        let virt_time = r.get_u64()?;
        let schema_hash = r.get_u64()?;
        let agent = r.get_array_16()?;
        let user = r.get_array_16()?;
        let trace = AbiTraceContext::decode(r)?;
        let topic_len = r.get_u32()?;
        let data_len = r.get_u32()?;
        let encoding = r.get_u16()?;
        let flags = r.get_u16()?;
        r.skip(20)?;
        Ok(Self {
            seq,
            wall_ts,
            virt_time,
            schema_hash,
            agent,
            user,
            trace,
            topic_len,
            data_len,
            encoding,
            flags,
        })
    }
}

/// Borrowed view of one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEvent<'a> {
    pub header: EventHeader,
    pub topic: &'a [u8],
    pub payload: &'a [u8],
    /// Bytes consumed from the buffer, including padding.
    pub frame_len: usize,
}

/// Frame length for the given topic/payload byte lengths.
pub fn event_frame_len(topic_len: usize, data_len: usize) -> usize {
    EVENT_HEADER_SIZE + align8(topic_len) + align8(data_len)
}

/// Appends a framed event to `out`. The header's declared lengths are
/// overwritten with the actual topic/payload lengths.
pub fn encode_event(header: &EventHeader, topic: &[u8], payload: &[u8], out: &mut Vec<u8>) {
    let mut header = *header;
    header.topic_len = topic.len() as u32;
    header.data_len = payload.len() as u32;
    header.encode(out);
    let mut w = ByteWriter::new(out);
    w.put_bytes(topic);
    w.align_to(8);
    w.put_bytes(payload);
    w.align_to(8);
}

/// Decodes one framed event from the front of `buf`.
pub fn decode_event(buf: &[u8]) -> Result<DecodedEvent<'_>, AbiError> {
    let mut r = ByteReader::new(buf);
    let header = EventHeader::decode(&mut r)?;
    let total = header.total_len();
    if buf.len() < total {
        return Err(AbiError::LengthMismatch(format!(
            "frame declares {} bytes, buffer holds {}",
            total,
            buf.len()
        )));
    }
    let topic = r.get_bytes(header.topic_len as usize)?;
    r.skip(align8(header.topic_len as usize) - header.topic_len as usize)?;
    let payload = r.get_bytes(header.data_len as usize)?;
    Ok(DecodedEvent { header, topic, payload, frame_len: total })
}
