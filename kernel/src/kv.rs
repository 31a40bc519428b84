//! Key-value store with weave-scoped transactions
//!
//! Reads are snapshot-isolated as of weave start: since every write of
//! the running weave is buffered, the committed map simply never changes
//! mid-weave, and a module's own writes stay invisible to its reads.
//! The buffer applies atomically at commit, last-write-wins per key; a
//! discarded weave drops it wholesale.

use std::collections::HashMap;

/// Committed key-value state.
#[derive(Debug, Default)]
pub struct KvStore {
    map: HashMap<String, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot read against committed state.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.map.get(key).map(|v| v.as_slice())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Applies a weave's write buffer atomically.
    pub fn apply(&mut self, buffer: KvWriteBuffer) {
        for (key, value) in buffer.writes {
            self.map.insert(key, value);
        }
    }
}

/// Buffered writes of one weave.
#[derive(Debug, Default)]
pub struct KvWriteBuffer {
    writes: HashMap<String, Vec<u8>>,
}

impl KvWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a write; a later write to the same key wins.
    pub fn set(&mut self, key: String, value: Vec<u8>) {
        self.writes.insert(key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}
