//! Weave transaction state
//!
//! Everything a running weave does is tentative. The journal collects
//! every side effect (staged outputs live in the staging area, the
//! rest lands here) and the kernel applies it at commit or unwinds it
//! at discard. `WeaveHost` is the import surface bound to the active
//! module call; it validates, journals, and never mutates durable state
//! directly.

use abi::Encoding;
use capability::{CapabilitySet, HostFn};
use core_types::{
    BlobId, ChannelId, ExecutionContext, KernelError, ProcessId, RequestId, ResourceLimits,
    ResourceUsage, Tick, Topic, VirtualTime, ERR_NOT_FOUND,
};
use engine::ModuleHost;
use value::Value;

use crate::blob::BlobTable;
use crate::bridge::{HwCommand, IoRequest};
use crate::channel::{ChannelMessage, ChannelRegistry};
use crate::event::{schema_hash, EventMeta, EventRecord};
use crate::kv::{KvStore, KvWriteBuffer};
use crate::process::{InboundEvent, ReservedPool};
use crate::router::{classify_outbound, OutboundRoute, RouterAuditLog, RouterEvent, TOPIC_KV_RESULT};
use crate::spawn::{decode_spawn_args, SpawnRequest};
use crate::staging::{StagedOrigin, StagingArea};
use crate::telemetry::LogRecord;
use crate::timeline::{CursorBounds, CursorSpec, CursorTable, Timeline};

/// A blob allocated during the running weave.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedBlob {
    pub id: BlobId,
    pub billed: u64,
    pub from_system_pool: bool,
}

/// A channel write buffered until commit.
#[derive(Debug)]
pub struct PendingPublish {
    pub channel: ChannelId,
    pub message: ChannelMessage,
}

/// A spawn requested by a module, applied at commit.
#[derive(Debug)]
pub struct PendingSpawn {
    pub pid: ProcessId,
    pub request: SpawnRequest,
    pub requested_by: ProcessId,
}

/// Tentative side effects of one weave.
#[derive(Debug, Default)]
pub struct WeaveJournal {
    pub allocated: Vec<AllocatedBlob>,
    pub retains: Vec<BlobId>,
    pub publishes: Vec<PendingPublish>,
    /// Channel messages consumed this weave, in consumption order, for
    /// front-restoration on discard.
    pub consumed: Vec<(ChannelId, ChannelMessage)>,
    /// Inbound queue entries merged at ingress, restored on discard.
    pub inbound_consumed: Vec<InboundEvent>,
    pub kv: KvWriteBuffer,
    pub timer_targets: Vec<VirtualTime>,
    pub logs: Vec<LogRecord>,
    pub io_requests: Vec<IoRequest>,
    pub hw_commands: Vec<HwCommand>,
    pub spawns: Vec<PendingSpawn>,
    /// (requester, target) termination requests, validated at commit.
    pub terminations: Vec<(ProcessId, ProcessId)>,
    pub cursors_opened: Vec<u64>,
    pub channels_created: Vec<ChannelId>,
    pub panic: Option<String>,
}

impl WeaveJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots already promised to this channel by the running weave.
    pub fn pending_for(&self, channel: ChannelId) -> usize {
        self.publishes.iter().filter(|p| p.channel == channel).count()
    }
}

/// Import surface bound to one module call of one weave.
pub struct WeaveHost<'a> {
    pub pid: ProcessId,
    pub context: ExecutionContext,
    pub virt_time: VirtualTime,
    pub wall_ts: u64,
    pub caps: &'a CapabilitySet,
    pub limits: ResourceLimits,
    pub staging: &'a mut StagingArea,
    pub journal: &'a mut WeaveJournal,
    pub blobs: &'a mut BlobTable,
    pub channels: &'a mut ChannelRegistry,
    pub cursors: &'a mut CursorTable,
    pub timeline: &'a Timeline,
    pub kv: &'a KvStore,
    pub usage: &'a mut ResourceUsage,
    pub system_pool: &'a mut ReservedPool,
    pub owned_channels: &'a [ChannelId],
    pub bound_uris: &'a [String],
    pub audit: &'a mut RouterAuditLog,
    pub next_pid: &'a mut u64,
    pub next_req: &'a mut u64,
    /// Highest staging offset any read of this call reached.
    pub high_water: u64,
    /// Set on any permission failure; forces rollback regardless of the
    /// module's own return value.
    pub abort: Option<KernelError>,
}

impl WeaveHost<'_> {
    fn meta(&self, encoding: Encoding) -> EventMeta {
        let mut meta = EventMeta::at(self.virt_time);
        meta.wall_ts = self.wall_ts;
        meta.encoding = encoding;
        meta
    }

    fn authorize(&self, host_fn: HostFn) -> Result<(), KernelError> {
        if self.caps.allows_host_fn(host_fn) {
            return Ok(());
        }
        Err(KernelError::Permission(format!(
            "host function '{}' not granted",
            host_fn.symbol()
        )))
    }

    fn reject(&mut self, topic: &str, err: KernelError) -> i64 {
        let code = err.code();
        self.audit.record(RouterEvent::Rejected {
            pid: self.pid,
            topic: topic.to_string(),
            code,
        });
        if matches!(err, KernelError::Permission(_)) {
            self.abort = Some(err);
        }
        code
    }

    fn fail(&mut self, err: KernelError) -> i64 {
        let code = err.code();
        if matches!(err, KernelError::Permission(_)) {
            self.abort = Some(err);
        }
        code
    }

    fn may_touch_channel(&self, uri: &str, channel: &crate::channel::Channel, outbound: bool) -> bool {
        if channel.owner == self.pid
            || self.owned_channels.contains(&channel.id)
            || self.journal.channels_created.contains(&channel.id)
            || self.bound_uris.iter().any(|b| b == uri)
        {
            return true;
        }
        if outbound {
            self.caps.find_outbound(uri).is_some()
        } else {
            self.caps.find_inbound(uri).is_some()
        }
    }

    fn read_channel(&mut self, uri: &str, out: &mut Vec<u8>) -> Result<i64, KernelError> {
        let channel = self
            .channels
            .find_uri(uri)
            .ok_or_else(|| KernelError::NotFound(format!("no channel {}", uri)))?;
        if !self.may_touch_channel(uri, &channel, false) {
            return Err(KernelError::Permission(format!("channel {} not readable", uri)));
        }
        match channel.try_pop()? {
            Some(message) => {
                let len = message.frame.len() as i64;
                out.extend_from_slice(&message.frame);
                self.blobs.channel_dequeue(self.pid, &message.blob_refs);
                self.journal.consumed.push((channel.id, message));
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn write_inner(&mut self, topic: &str, payload: &[u8], encoding: Encoding) -> Result<i64, KernelError> {
        self.authorize(HostFn::Write)?;
        core_types::validate_uri(topic)?;
        let route = classify_outbound(topic)?;

        // Channels are permissioned by ownership or binding; everything
        // else needs an outbound grant on the topic.
        if route == OutboundRoute::Channel {
            let channel = self
                .channels
                .find_uri(topic)
                .ok_or_else(|| KernelError::NotFound(format!("no channel {}", topic)))?;
            if !self.may_touch_channel(topic, &channel, true) {
                return Err(KernelError::Permission(format!("channel {} not writable", topic)));
            }
        } else if self.caps.find_outbound(topic).is_none() {
            return Err(KernelError::Permission(format!(
                "outbound topic '{}' not granted",
                topic
            )));
        }

        let status = match route {
            OutboundRoute::Staging => {
                let record =
                    EventRecord::new(Topic::new(topic)?, payload.to_vec(), self.meta(encoding))?;
                self.staging.append(StagedOrigin::Output, record)?;
                0
            }
            OutboundRoute::Channel => self.publish_channel(topic, payload, encoding)?,
            OutboundRoute::TimeSet => {
                let target = parse_time_target(payload, encoding)?;
                self.journal.timer_targets.push(target);
                0
            }
            OutboundRoute::CoreLog => {
                let record = parse_value_payload(payload, encoding)?;
                let log = LogRecord::from_value(self.pid, self.virt_time, &record)?;
                self.journal.logs.push(log);
                0
            }
            OutboundRoute::CorePanic => {
                self.journal.panic = Some(parse_panic_message(payload, encoding));
                0
            }
            OutboundRoute::KvSet => {
                let (key, value) = parse_kv_set(payload, encoding)?;
                self.journal.kv.set(key, value);
                0
            }
            OutboundRoute::KvGet => {
                let key = parse_kv_key(payload, encoding)?;
                let reply = kv_reply(&key, self.kv.get(&key), self.meta(Encoding::Value))?;
                self.staging.append(StagedOrigin::Inbound, reply)?;
                0
            }
            OutboundRoute::AsyncIo => {
                let req_id = RequestId::from_raw(*self.next_req);
                *self.next_req += 1;
                self.journal.io_requests.push(IoRequest {
                    pid: self.pid,
                    topic: topic.to_string(),
                    req_id,
                    payload: payload.to_vec(),
                });
                req_id.as_u64() as i64
            }
            OutboundRoute::Hardware => {
                self.journal.hw_commands.push(HwCommand {
                    pid: self.pid,
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
                0
            }
        };
        self.audit.record(RouterEvent::Routed { pid: self.pid, topic: topic.to_string(), route });
        Ok(status)
    }

    fn publish_channel(&mut self, uri: &str, payload: &[u8], encoding: Encoding) -> Result<i64, KernelError> {
        let channel = self
            .channels
            .find_uri(uri)
            .ok_or_else(|| KernelError::NotFound(format!("no channel {}", uri)))?;
        if payload.len() > channel.msg_size {
            return Err(KernelError::Invalid(format!(
                "payload of {} bytes exceeds slot size {}",
                payload.len(),
                channel.msg_size
            )));
        }
        if encoding != Encoding::Value {
            return Err(KernelError::Type(format!(
                "channel {} carries typed values, not raw bytes",
                uri
            )));
        }
        let mut meta = self.meta(encoding);
        meta.schema_hash = schema_hash(&channel.schema_uri);
        let record = EventRecord::new(Topic::new(uri)?, payload.to_vec(), meta)?;
        record.value()?.expect_root(channel.root_type)?;

        // Non-blocking backpressure, counting this weave's own pending
        // publishes against the capacity.
        let pending = self.journal.pending_for(channel.id);
        channel.can_accept(pending + 1)?;

        let mut frame = Vec::with_capacity(record.frame_len());
        record.encode_frame(0, &mut frame);
        self.journal.publishes.push(PendingPublish {
            channel: channel.id,
            message: ChannelMessage { frame, blob_refs: record.blob_refs.clone() },
        });
        Ok(0)
    }
}

impl ModuleHost for WeaveHost<'_> {
    fn read(&mut self, topic: &str, start: u64, out: &mut Vec<u8>) -> i64 {
        if let Err(err) = self.authorize(HostFn::Read) {
            return self.fail(err);
        }
        if topic.starts_with(crate::channel::CHANNEL_NAMESPACE) {
            return match self.read_channel(topic, out) {
                Ok(len) => len,
                Err(err) => self.fail(err),
            };
        }
        match self.staging.read(topic, start, out) {
            Some(end) => {
                self.high_water = self.high_water.max(end);
                end as i64
            }
            None => {
                self.high_water = self.high_water.max(self.staging.inputs_end());
                0
            }
        }
    }

    fn write(&mut self, topic: &str, payload: &[u8], encoding: Encoding) -> i64 {
        match self.write_inner(topic, payload, encoding) {
            Ok(status) => status,
            Err(err) => self.reject(topic, err),
        }
    }

    fn blob_alloc(&mut self, size: u64, flags: u32) -> i64 {
        if let Err(err) = self.authorize(HostFn::BlobAlloc) {
            return self.fail(err);
        }
        let billed = BlobTable::billed_size(size);
        let from_system_pool = self.context == ExecutionContext::System;
        if from_system_pool {
            // System context never touches the host heap on the hot
            // path; allocation comes from the pre-reserved pool.
            if let Err(err) = self.system_pool.take(billed) {
                return self.fail(err);
            }
        } else if let Err(err) = self.usage.charge_memory(core_types::MemoryBytes(billed), &self.limits)
        {
            return self.fail(err);
        }
        match self.blobs.alloc(self.pid, size, flags) {
            Ok(id) => {
                self.journal.allocated.push(AllocatedBlob { id, billed, from_system_pool });
                id.as_u64() as i64
            }
            Err(err) => {
                if from_system_pool {
                    self.system_pool.give_back(billed);
                } else {
                    self.usage.credit_memory(core_types::MemoryBytes(billed));
                }
                self.fail(err)
            }
        }
    }

    fn blob_map(&mut self, id: u64, perms: u32) -> i64 {
        if let Err(err) = self.authorize(HostFn::BlobMap) {
            return self.fail(err);
        }
        match self.blobs.check_map(self.pid, BlobId::from_raw(id), perms) {
            Ok(()) => 0,
            Err(err) => self.fail(err),
        }
    }

    fn blob_retain(&mut self, id: u64) -> i64 {
        if let Err(err) = self.authorize(HostFn::BlobRetain) {
            return self.fail(err);
        }
        let id = BlobId::from_raw(id);
        if self.blobs.get(id).is_none() {
            return ERR_NOT_FOUND;
        }
        // Provisional: applied at commit, reverted (never applied) on
        // discard.
        self.journal.retains.push(id);
        0
    }

    fn blob_bytes(&mut self, id: u64) -> Option<&mut Vec<u8>> {
        let id = BlobId::from_raw(id);
        self.blobs.check_map(self.pid, id, crate::blob::PERM_READ).ok()?;
        self.blobs.bytes_mut(id)
    }

    fn tl_open(
        &mut self,
        topic_prefix: &str,
        start: u64,
        end: u64,
        descending: bool,
        by_virtual_time: bool,
    ) -> i64 {
        if let Err(err) = self.authorize(HostFn::TlOpen) {
            return self.fail(err);
        }
        let bounds = if by_virtual_time {
            CursorBounds::VirtualTime {
                start: VirtualTime::from_nanos(start),
                end: VirtualTime::from_nanos(end),
            }
        } else {
            CursorBounds::Ticks { start: Tick::from_raw(start), end: Tick::from_raw(end) }
        };
        let spec = CursorSpec { topic_prefix: topic_prefix.to_string(), bounds, descending };
        let cursor = self.cursors.open(self.pid, self.timeline, &spec);
        self.journal.cursors_opened.push(cursor);
        cursor as i64
    }

    fn tl_next(&mut self, cursor: u64, capacity: u64, out: &mut Vec<u8>) -> i64 {
        if let Err(err) = self.authorize(HostFn::TlNext) {
            return self.fail(err);
        }
        if self.cursors.owner(cursor) != Some(self.pid) {
            return self.fail(KernelError::Permission(format!("cursor {} not owned", cursor)));
        }
        match self.cursors.next(cursor, self.timeline, capacity, out) {
            Ok(written) => written as i64,
            Err(err) => self.fail(err),
        }
    }

    fn tl_close(&mut self, cursor: u64) -> i64 {
        if let Err(err) = self.authorize(HostFn::TlClose) {
            return self.fail(err);
        }
        if self.cursors.owner(cursor) != Some(self.pid) {
            return self.fail(KernelError::Permission(format!("cursor {} not owned", cursor)));
        }
        match self.cursors.close(cursor) {
            Ok(()) => 0,
            Err(err) => self.fail(err),
        }
    }

    fn channel_create(
        &mut self,
        schema_uri: &str,
        capacity: u32,
        msg_size: u32,
        direction: u32,
        root_type: u32,
        uri_out: &mut String,
    ) -> i64 {
        if let Err(err) = self.authorize(HostFn::ChannelCreate) {
            return self.fail(err);
        }
        let direction = match abi::ChannelDirection::from_u32(direction) {
            Ok(d) => d,
            Err(e) => return self.fail(e.into()),
        };
        let root_type = match abi::ValueTag::from_u32(root_type) {
            Ok(t) => t,
            Err(e) => return self.fail(e.into()),
        };
        let billed = (capacity as u64) * (msg_size as u64);
        if let Err(err) = self.usage.charge_memory(core_types::MemoryBytes(billed), &self.limits) {
            return self.fail(err);
        }
        match self.channels.create(self.pid, schema_uri, capacity, msg_size, direction, root_type) {
            Ok(channel) => {
                self.journal.channels_created.push(channel.id);
                *uri_out = channel.uri.clone();
                channel.id.as_u64() as i64
            }
            Err(err) => {
                self.usage.credit_memory(core_types::MemoryBytes(billed));
                self.fail(err)
            }
        }
    }

    fn process_spawn(&mut self, args: &[u8]) -> i64 {
        if let Err(err) = self.authorize(HostFn::ProcessSpawn) {
            return self.fail(err);
        }
        let request = match decode_spawn_args(args) {
            Ok(request) => request,
            Err(err) => return self.fail(err),
        };
        let pid = ProcessId::from_raw(*self.next_pid);
        *self.next_pid += 1;
        self.journal.spawns.push(PendingSpawn { pid, request, requested_by: self.pid });
        pid.as_u64() as i64
    }

    fn process_terminate(&mut self, pid: u64) -> i64 {
        if let Err(err) = self.authorize(HostFn::ProcessTerminate) {
            return self.fail(err);
        }
        self.journal.terminations.push((self.pid, ProcessId::from_raw(pid)));
        0
    }
}

fn parse_value_payload(payload: &[u8], encoding: Encoding) -> Result<Value, KernelError> {
    if encoding != Encoding::Value {
        return Err(KernelError::Type("payload must be value-encoded".to_string()));
    }
    Ok(value::parse_value(payload, 0)?)
}

fn parse_time_target(payload: &[u8], encoding: Encoding) -> Result<VirtualTime, KernelError> {
    let parsed = parse_value_payload(payload, encoding)?;
    match parsed {
        Value::U64(nanos) => Ok(VirtualTime::from_nanos(nanos)),
        Value::Map(pairs) => pairs
            .iter()
            .find_map(|(k, v)| match (k.as_str(), v) {
                ("target", Value::U64(nanos)) => Some(VirtualTime::from_nanos(*nanos)),
                _ => None,
            })
            .ok_or_else(|| KernelError::Invalid("timer payload missing 'target'".to_string())),
        _ => Err(KernelError::Invalid("timer payload must be u64 or map".to_string())),
    }
}

fn parse_panic_message(payload: &[u8], encoding: Encoding) -> String {
    match parse_value_payload(payload, encoding) {
        Ok(Value::String(text)) => text,
        Ok(Value::Map(pairs)) => pairs
            .into_iter()
            .find_map(|(k, v)| match (k.as_str(), v) {
                ("message", Value::String(text)) => Some(text),
                _ => None,
            })
            .unwrap_or_else(|| "module panic".to_string()),
        _ => "module panic".to_string(),
    }
}

fn parse_kv_set(payload: &[u8], encoding: Encoding) -> Result<(String, Vec<u8>), KernelError> {
    let parsed = parse_value_payload(payload, encoding)?;
    let pairs = match parsed {
        Value::Map(pairs) => pairs,
        _ => return Err(KernelError::Invalid("kv set payload must be a map".to_string())),
    };
    let mut key = None;
    let mut data = None;
    for (k, v) in pairs {
        match (k.as_str(), v) {
            ("key", Value::String(text)) => key = Some(text),
            ("value", Value::Bytes(bytes)) => data = Some(bytes),
            ("value", Value::String(text)) => data = Some(text.into_bytes()),
            _ => {}
        }
    }
    match (key, data) {
        (Some(key), Some(data)) => Ok((key, data)),
        _ => Err(KernelError::Invalid("kv set needs 'key' and 'value'".to_string())),
    }
}

fn parse_kv_key(payload: &[u8], encoding: Encoding) -> Result<String, KernelError> {
    let parsed = parse_value_payload(payload, encoding)?;
    match parsed {
        Value::String(key) => Ok(key),
        Value::Map(pairs) => pairs
            .into_iter()
            .find_map(|(k, v)| match (k.as_str(), v) {
                ("key", Value::String(text)) => Some(text),
                _ => None,
            })
            .ok_or_else(|| KernelError::Invalid("kv get payload missing 'key'".to_string())),
        _ => Err(KernelError::Invalid("kv get payload must be string or map".to_string())),
    }
}

/// Builds the snapshot-read reply deposited into staging.
fn kv_reply(key: &str, found: Option<&[u8]>, meta: EventMeta) -> Result<EventRecord, KernelError> {
    let reply = Value::Map(vec![
        ("key".to_string(), Value::String(key.to_string())),
        ("found".to_string(), Value::Bool(found.is_some())),
        ("value".to_string(), Value::Bytes(found.unwrap_or_default().to_vec())),
    ]);
    EventRecord::from_value(Topic::new(TOPIC_KV_RESULT)?, &reply, meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_target_forms() {
        let mut buf = Vec::new();
        value::emit_value(&Value::U64(500), 0, &mut buf).unwrap();
        assert_eq!(parse_time_target(&buf, Encoding::Value).unwrap(), VirtualTime::from_nanos(500));

        let mut buf = Vec::new();
        value::emit_value(
            &Value::Map(vec![("target".to_string(), Value::U64(900))]),
            0,
            &mut buf,
        )
        .unwrap();
        assert_eq!(parse_time_target(&buf, Encoding::Value).unwrap(), VirtualTime::from_nanos(900));

        let mut buf = Vec::new();
        value::emit_value(&Value::Bool(true), 0, &mut buf).unwrap();
        assert!(parse_time_target(&buf, Encoding::Value).is_err());
        assert!(parse_time_target(&buf, Encoding::Raw).is_err());
    }

    #[test]
    fn test_parse_kv_payloads() {
        let mut buf = Vec::new();
        value::emit_value(
            &Value::Map(vec![
                ("key".to_string(), Value::String("x".to_string())),
                ("value".to_string(), Value::Bytes(vec![1, 2])),
            ]),
            0,
            &mut buf,
        )
        .unwrap();
        assert_eq!(parse_kv_set(&buf, Encoding::Value).unwrap(), ("x".to_string(), vec![1, 2]));

        let mut buf = Vec::new();
        value::emit_value(&Value::String("x".to_string()), 0, &mut buf).unwrap();
        assert_eq!(parse_kv_key(&buf, Encoding::Value).unwrap(), "x");
    }

    #[test]
    fn test_kv_reply_shape() {
        let reply = kv_reply("x", Some(&[9]), EventMeta::at(VirtualTime::ZERO)).unwrap();
        assert_eq!(reply.topic.as_str(), TOPIC_KV_RESULT);
        match reply.value().unwrap() {
            Value::Map(pairs) => {
                assert!(pairs.iter().any(|(k, v)| k == "found" && *v == Value::Bool(true)));
                assert!(pairs.iter().any(|(k, v)| k == "value" && *v == Value::Bytes(vec![9])));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_journal_pending_counts() {
        let mut journal = WeaveJournal::new();
        let msg = || ChannelMessage { frame: vec![0; 8], blob_refs: Vec::new() };
        journal.publishes.push(PendingPublish { channel: ChannelId::from_raw(1), message: msg() });
        journal.publishes.push(PendingPublish { channel: ChannelId::from_raw(1), message: msg() });
        journal.publishes.push(PendingPublish { channel: ChannelId::from_raw(2), message: msg() });
        assert_eq!(journal.pending_for(ChannelId::from_raw(1)), 2);
        assert_eq!(journal.pending_for(ChannelId::from_raw(2)), 1);
        assert_eq!(journal.pending_for(ChannelId::from_raw(3)), 0);
    }
}
