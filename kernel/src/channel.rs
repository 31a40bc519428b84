//! Dynamic typed channels
//!
//! Fixed-capacity rings of framed events keyed by auto-generated URIs
//! under the reserved `filament/chan/` namespace. Writes are
//! non-blocking (a full ring is an I/O error), reads are destructive and
//! FIFO. Rings are the only cross-process mutable shared state, so they
//! carry their own synchronization; everything else in the kernel is
//! single-writer.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use abi::{ChannelDirection, ValueTag};
use core_types::{validate_uri, BlobId, ChannelId, KernelError, ProcessId};

/// Reserved namespace prefix for channel URIs.
pub const CHANNEL_NAMESPACE: &str = "filament/chan/";

/// One enqueued message: the encoded frame plus the blob handles whose
/// references were transferred at enqueue.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub frame: Vec<u8>,
    pub blob_refs: Vec<BlobId>,
}

#[derive(Debug, Default)]
struct RingState {
    queue: VecDeque<ChannelMessage>,
    destroyed: bool,
}

/// A fixed-capacity MPMC ring.
#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub uri: String,
    pub schema_uri: String,
    pub root_type: ValueTag,
    pub direction: ChannelDirection,
    pub owner: ProcessId,
    pub capacity: usize,
    pub msg_size: usize,
    state: Mutex<RingState>,
    readers: Condvar,
}

impl Channel {
    /// Ring bytes billed to the owner's memory quota.
    pub fn billed_bytes(&self) -> u64 {
        (self.capacity * self.msg_size) as u64
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("channel lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking push. `pending` is the number of slots already
    /// promised to un-committed writes of the running weave.
    pub fn try_push(&self, message: ChannelMessage, pending: usize) -> Result<(), KernelError> {
        let mut state = self.state.lock().expect("channel lock poisoned");
        if state.destroyed {
            return Err(KernelError::NotFound(format!("channel {} destroyed", self.uri)));
        }
        if state.queue.len() + pending >= self.capacity {
            return Err(KernelError::Io(format!(
                "channel {} full ({} of {} slots)",
                self.uri,
                state.queue.len() + pending,
                self.capacity
            )));
        }
        state.queue.push_back(message);
        self.readers.notify_one();
        Ok(())
    }

    /// Capacity check without pushing, for commit-time validation of
    /// pending publishes.
    pub fn can_accept(&self, pending: usize) -> Result<(), KernelError> {
        let state = self.state.lock().expect("channel lock poisoned");
        if state.destroyed {
            return Err(KernelError::NotFound(format!("channel {} destroyed", self.uri)));
        }
        if state.queue.len() + pending > self.capacity {
            return Err(KernelError::Io(format!("channel {} full", self.uri)));
        }
        Ok(())
    }

    /// Destructive non-blocking read, oldest first.
    pub fn try_pop(&self) -> Result<Option<ChannelMessage>, KernelError> {
        let mut state = self.state.lock().expect("channel lock poisoned");
        if state.destroyed {
            return Err(KernelError::NotFound(format!("channel {} destroyed", self.uri)));
        }
        Ok(state.queue.pop_front())
    }

    /// Blocking read for dedicated workers. Wakes with `NotFound` when
    /// the channel is destroyed under the waiter.
    pub fn pop_blocking(&self, timeout: Duration) -> Result<ChannelMessage, KernelError> {
        let mut state = self.state.lock().expect("channel lock poisoned");
        loop {
            if state.destroyed {
                return Err(KernelError::NotFound(format!("channel {} destroyed", self.uri)));
            }
            if let Some(message) = state.queue.pop_front() {
                return Ok(message);
            }
            let (next, result) = self
                .readers
                .wait_timeout(state, timeout)
                .expect("channel lock poisoned");
            state = next;
            if result.timed_out() && state.queue.is_empty() && !state.destroyed {
                return Err(KernelError::Timeout(format!("read on {} timed out", self.uri)));
            }
        }
    }

    /// Restores messages consumed by a discarded weave, preserving the
    /// original order at the ring front.
    pub fn restore_front(&self, messages: Vec<ChannelMessage>) {
        let mut state = self.state.lock().expect("channel lock poisoned");
        for message in messages.into_iter().rev() {
            state.queue.push_front(message);
        }
    }

    /// Destroys the ring: drains pending messages for blob release and
    /// wakes every blocked reader.
    pub fn destroy(&self) -> Vec<ChannelMessage> {
        let mut state = self.state.lock().expect("channel lock poisoned");
        state.destroyed = true;
        let drained = state.queue.drain(..).collect();
        self.readers.notify_all();
        drained
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().expect("channel lock poisoned").destroyed
    }
}

/// Registry of live channels, keyed by id and by URI.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<u64, Arc<Channel>>,
    by_uri: HashMap<String, u64>,
    next: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { next: 1, ..Default::default() }
    }

    /// Creates a channel and returns it with its auto-generated URI.
    pub fn create(
        &mut self,
        owner: ProcessId,
        schema_uri: &str,
        capacity: u32,
        msg_size: u32,
        direction: ChannelDirection,
        root_type: ValueTag,
    ) -> Result<Arc<Channel>, KernelError> {
        validate_uri(schema_uri)?;
        if capacity == 0 || msg_size == 0 {
            return Err(KernelError::Invalid(format!(
                "channel needs nonzero capacity and msg_size (got {} x {})",
                capacity, msg_size
            )));
        }
        let id = self.next;
        self.next += 1;
        let uri = format!("{}{}", CHANNEL_NAMESPACE, id);
        let channel = Arc::new(Channel {
            id: ChannelId::from_raw(id),
            uri: uri.clone(),
            schema_uri: schema_uri.to_string(),
            root_type,
            direction,
            owner,
            capacity: capacity as usize,
            msg_size: msg_size as usize,
            state: Mutex::new(RingState::default()),
            readers: Condvar::new(),
        });
        self.channels.insert(id, Arc::clone(&channel));
        self.by_uri.insert(uri, id);
        Ok(channel)
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id.as_u64()).cloned()
    }

    pub fn find_uri(&self, uri: &str) -> Option<Arc<Channel>> {
        self.by_uri.get(uri).and_then(|id| self.channels.get(id)).cloned()
    }

    /// Unregisters a channel; the caller destroys the ring.
    pub fn remove(&mut self, id: ChannelId) -> Option<Arc<Channel>> {
        let channel = self.channels.remove(&id.as_u64())?;
        self.by_uri.remove(&channel.uri);
        Some(channel)
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }
}
