//! Blob subsystem
//!
//! Kernel-managed buffers addressed by opaque 64-bit handles. Blobs are
//! the zero-copy transfer unit: payloads carry handles, never bytes.
//! A blob allocated during a weave is ephemeral; it survives only if it
//! was explicitly retained or its handle appears in a committed event.
//! Refcount mutations inside a weave are journaled by the transaction
//! and applied at commit.
//!
//! DMA allocations come from a fixed pre-reserved pool. A DMA-required
//! request the pool cannot satisfy fails; a DMA-optional request falls
//! back to standard memory. Both bits set are treated as optional.

use std::collections::HashMap;

use core_types::{BlobId, KernelError, ProcessId, MIN_BLOB_BYTES};

/// Allocation flag: the buffer must come from the DMA pool.
pub const DMA_REQUIRED: u32 = 1;
/// Allocation flag: prefer the DMA pool, fall back to standard memory.
pub const DMA_OPTIONAL: u32 = 2;

/// Reference permission bit: read.
pub const PERM_READ: u32 = 1;
/// Reference permission bit: write.
pub const PERM_WRITE: u32 = 2;
/// Reference permission bit: execute.
pub const PERM_EXEC: u32 = 4;

/// Fixed pre-reserved DMA byte budget.
#[derive(Debug, Clone, Default)]
pub struct DmaPool {
    capacity: u64,
    used: u64,
}

impl DmaPool {
    pub fn new(capacity: u64) -> Self {
        Self { capacity, used: 0 }
    }

    fn try_reserve(&mut self, bytes: u64) -> bool {
        if self.used.saturating_add(bytes) > self.capacity {
            return false;
        }
        self.used += bytes;
        true
    }

    fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }

    pub fn available(&self) -> u64 {
        self.capacity - self.used
    }
}

/// One kernel blob.
#[derive(Debug)]
pub struct BlobEntry {
    pub owner: ProcessId,
    pub data: Vec<u8>,
    /// Outstanding references: the owner's implicit reference plus any
    /// channel transfers and retains.
    pub refcount: u32,
    pub retained: bool,
    /// Handle appeared in a committed event or channel message.
    pub committed: bool,
    pub dma: bool,
    /// Billed size (request rounded up to the blob floor).
    pub size: u64,
}

/// Table of all live blobs plus per-process reference grants.
#[derive(Debug, Default)]
pub struct BlobTable {
    entries: HashMap<u64, BlobEntry>,
    /// (process, blob) -> permission bits of that process's reference.
    grants: HashMap<(u64, u64), u32>,
    next: u64,
    dma_pool: DmaPool,
}

impl BlobTable {
    pub fn new(dma_capacity: u64) -> Self {
        Self { dma_pool: DmaPool::new(dma_capacity), next: 1, ..Default::default() }
    }

    /// Billable size of an allocation request.
    pub fn billed_size(size: u64) -> u64 {
        size.max(MIN_BLOB_BYTES)
    }

    /// Allocates a blob. The caller has already charged the owner's
    /// quota for `billed_size(size)`.
    pub fn alloc(&mut self, owner: ProcessId, size: u64, dma_flags: u32) -> Result<BlobId, KernelError> {
        let billed = Self::billed_size(size);
        let wants_dma = dma_flags & (DMA_REQUIRED | DMA_OPTIONAL) != 0;
        let dma_optional = dma_flags & DMA_OPTIONAL != 0;
        let dma = if wants_dma {
            if self.dma_pool.try_reserve(billed) {
                true
            } else if dma_optional {
                false
            } else {
                return Err(KernelError::Oom(format!(
                    "DMA pool cannot satisfy {} bytes ({} available)",
                    billed,
                    self.dma_pool.available()
                )));
            }
        } else {
            false
        };

        let id = self.next;
        self.next += 1;
        self.entries.insert(
            id,
            BlobEntry {
                owner,
                data: vec![0; size as usize],
                refcount: 1,
                retained: false,
                committed: false,
                dma,
                size: billed,
            },
        );
        self.grants.insert((owner.as_u64(), id), PERM_READ | PERM_WRITE);
        Ok(BlobId::from_raw(id))
    }

    pub fn get(&self, id: BlobId) -> Option<&BlobEntry> {
        self.entries.get(&id.as_u64())
    }

    /// Verifies a map request: the caller must hold a reference and ask
    /// for no more than that reference grants.
    pub fn check_map(&self, pid: ProcessId, id: BlobId, perms: u32) -> Result<(), KernelError> {
        if !self.entries.contains_key(&id.as_u64()) {
            return Err(KernelError::NotFound(format!("no blob {}", id)));
        }
        let granted = self
            .grants
            .get(&(pid.as_u64(), id.as_u64()))
            .copied()
            .ok_or_else(|| KernelError::Permission(format!("{} holds no reference to {}", pid, id)))?;
        if perms & !granted != 0 {
            return Err(KernelError::Permission(format!(
                "requested perms {:#x} exceed granted {:#x} on {}",
                perms, granted, id
            )));
        }
        Ok(())
    }

    /// Direct access to blob bytes (zero-copy map path).
    pub fn bytes_mut(&mut self, id: BlobId) -> Option<&mut Vec<u8>> {
        self.entries.get_mut(&id.as_u64()).map(|e| &mut e.data)
    }

    /// Grants a reference with the given permissions.
    pub fn grant(&mut self, pid: ProcessId, id: BlobId, perms: u32) {
        self.grants.insert((pid.as_u64(), id.as_u64()), perms);
    }

    /// Applies a committed retain: the blob becomes long-lived.
    pub fn apply_retain(&mut self, id: BlobId) -> Result<(), KernelError> {
        let entry = self
            .entries
            .get_mut(&id.as_u64())
            .ok_or_else(|| KernelError::NotFound(format!("no blob {}", id)))?;
        entry.retained = true;
        entry.refcount += 1;
        Ok(())
    }

    /// Applies a committed release. Returns `(owner, billed_size)` when
    /// the blob was freed, for quota credit.
    pub fn apply_release(&mut self, id: BlobId) -> Option<(ProcessId, u64)> {
        let entry = self.entries.get_mut(&id.as_u64())?;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            return self.free(id);
        }
        None
    }

    /// Marks a handle as having appeared in a committed event.
    pub fn mark_committed(&mut self, id: BlobId) {
        if let Some(entry) = self.entries.get_mut(&id.as_u64()) {
            entry.committed = true;
        }
    }

    /// Refcount transfer at channel enqueue: one reference per handle.
    pub fn channel_enqueue(&mut self, ids: &[BlobId]) {
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id.as_u64()) {
                entry.refcount += 1;
                entry.committed = true;
            }
        }
    }

    /// Grants the dequeuing process read access to transferred handles.
    pub fn channel_dequeue(&mut self, pid: ProcessId, ids: &[BlobId]) {
        for id in ids {
            if self.entries.contains_key(&id.as_u64()) {
                self.grants.entry((pid.as_u64(), id.as_u64())).or_insert(PERM_READ);
            }
        }
    }

    /// Releases the references held by pending channel messages at
    /// channel destruction. Returns quota credits.
    pub fn channel_release(&mut self, ids: &[BlobId]) -> Vec<(ProcessId, u64)> {
        ids.iter().filter_map(|id| self.apply_release(*id)).collect()
    }

    /// Frees a blob outright. Returns `(owner, billed_size)`.
    pub fn free(&mut self, id: BlobId) -> Option<(ProcessId, u64)> {
        let entry = self.entries.remove(&id.as_u64())?;
        if entry.dma {
            self.dma_pool.release(entry.size);
        }
        self.grants.retain(|(_, blob), _| *blob != id.as_u64());
        Some((entry.owner, entry.size))
    }

    /// Drops every weave-ephemeral blob in `allocated` that ended the
    /// weave neither retained nor committed. Returns quota credits.
    pub fn drop_ephemerals(&mut self, allocated: &[BlobId]) -> Vec<(ProcessId, u64)> {
        let mut credits = Vec::new();
        for id in allocated {
            let drop_it = match self.entries.get(&id.as_u64()) {
                Some(entry) => !entry.retained && !entry.committed,
                None => false,
            };
            if drop_it {
                if let Some(credit) = self.free(*id) {
                    credits.push(credit);
                }
            }
        }
        credits
    }

    /// Frees every blob owned by a terminating process. Returns the
    /// total billed bytes released.
    pub fn release_process(&mut self, pid: ProcessId) -> u64 {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == pid)
            .map(|(id, _)| *id)
            .collect();
        let mut total = 0;
        for id in ids {
            if let Some((_, size)) = self.free(BlobId::from_raw(id)) {
                total += size;
            }
        }
        self.grants.retain(|(p, _), _| *p != pid.as_u64());
        total
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u64) -> ProcessId {
        ProcessId::from_raw(n)
    }

    #[test]
    fn test_alloc_grants_owner_rw() {
        let mut table = BlobTable::new(0);
        let id = table.alloc(pid(1), 256, 0).unwrap();
        assert!(table.check_map(pid(1), id, PERM_READ | PERM_WRITE).is_ok());
        assert!(matches!(
            table.check_map(pid(1), id, PERM_READ | PERM_EXEC),
            Err(KernelError::Permission(_))
        ));
        assert!(matches!(
            table.check_map(pid(2), id, PERM_READ),
            Err(KernelError::Permission(_))
        ));
    }

    #[test]
    fn test_billed_size_floor() {
        assert_eq!(BlobTable::billed_size(1), MIN_BLOB_BYTES);
        assert_eq!(BlobTable::billed_size(4_096), 4_096);
    }

    #[test]
    fn test_dma_required_fails_without_pool() {
        let mut table = BlobTable::new(0);
        let err = table.alloc(pid(1), 1 << 20, DMA_REQUIRED).unwrap_err();
        assert!(matches!(err, KernelError::Oom(_)));
    }

    #[test]
    fn test_dma_optional_falls_back() {
        let mut table = BlobTable::new(0);
        let id = table.alloc(pid(1), 1 << 20, DMA_OPTIONAL).unwrap();
        assert!(!table.get(id).unwrap().dma);
        // Both bits set: treated as optional.
        let id = table.alloc(pid(1), 1 << 20, DMA_REQUIRED | DMA_OPTIONAL).unwrap();
        assert!(!table.get(id).unwrap().dma);
    }

    #[test]
    fn test_dma_pool_accounting() {
        let mut table = BlobTable::new(1_024);
        let id = table.alloc(pid(1), 512, DMA_REQUIRED).unwrap();
        assert!(table.get(id).unwrap().dma);
        assert!(table.alloc(pid(1), 1_024, DMA_REQUIRED).is_err());
        table.free(id);
        assert!(table.alloc(pid(1), 1_024, DMA_REQUIRED).is_ok());
    }

    #[test]
    fn test_ephemeral_drop_spares_retained_and_committed() {
        let mut table = BlobTable::new(0);
        let kept = table.alloc(pid(1), 256, 0).unwrap();
        let committed = table.alloc(pid(1), 256, 0).unwrap();
        let dropped = table.alloc(pid(1), 256, 0).unwrap();

        table.apply_retain(kept).unwrap();
        table.mark_committed(committed);

        let credits = table.drop_ephemerals(&[kept, committed, dropped]);
        assert_eq!(credits, vec![(pid(1), 256)]);
        assert!(table.get(kept).is_some());
        assert!(table.get(committed).is_some());
        assert!(table.get(dropped).is_none());
    }

    #[test]
    fn test_channel_transfer_refcounts() {
        let mut table = BlobTable::new(0);
        let id = table.alloc(pid(1), 256, 0).unwrap();
        table.channel_enqueue(&[id]);
        assert_eq!(table.get(id).unwrap().refcount, 2);

        table.channel_dequeue(pid(2), &[id]);
        assert!(table.check_map(pid(2), id, PERM_READ).is_ok());
        assert!(table.check_map(pid(2), id, PERM_WRITE).is_err());

        // Consumer releases its transferred reference, owner still holds one.
        assert!(table.apply_release(id).is_none());
        assert_eq!(table.get(id).unwrap().refcount, 1);
        let freed = table.apply_release(id).unwrap();
        assert_eq!(freed, (pid(1), 256));
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_release_process_frees_everything() {
        let mut table = BlobTable::new(0);
        table.alloc(pid(1), 256, 0).unwrap();
        table.alloc(pid(1), 512, 0).unwrap();
        table.alloc(pid(2), 256, 0).unwrap();
        assert_eq!(table.release_process(pid(1)), 768);
        assert_eq!(table.count(), 1);
    }
}
