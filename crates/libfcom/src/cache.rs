//! Subscription cache: per-ID slot descriptors and the reference-counted
//! most-recent-value store.
//!
//! A subscribed ID owns one `Slot`: nest count, update count, the optional
//! sync-get condition variable, the optional blob-set node, and the current
//! value. The value is an `Arc<BlobValue>`; the cache holds the owning
//! clone, readers get their own clone, and the final drop returns the
//! payload storage to the buffer pool. All slot and pool state is guarded
//! by the one cache mutex in `RuntimeShared`.
//!
//! Dropping a `BlobValue` takes the cache lock to reclaim its storage.
//! Internal code must therefore never drop a value clone while holding the
//! lock; displaced clones are pushed into a `Garbage` carrier and dropped
//! by the caller after unlocking.

use std::fmt;
use std::sync::{Arc, Weak};

use fcom_core::blob::{BlobHeader, ElementType, PayloadRef};
use fcom_core::error::{FcomError, FcomResult};
use fcom_core::id::BlobId;
use zerocopy::FromBytes;

use crate::pool::{BufferPool, Storage};
use crate::sets::{self, NodeIdx, NodeTable, SetArena};
use crate::table::IdTable;
use crate::RuntimeShared;

// ── Values ───────────────────────────────────────────────────────────────────

/// One received blob: decoded header plus pooled payload storage.
pub(crate) struct BlobValue {
    pub hdr: BlobHeader,
    /// Payload length in bytes (the storage may be larger).
    len: usize,
    /// Taken back by Drop; always present before that.
    storage: Option<Storage>,
    rt: Weak<RuntimeShared>,
}

impl BlobValue {
    pub fn new(hdr: BlobHeader, storage: Storage, rt: Weak<RuntimeShared>) -> BlobValue {
        let len = hdr.payload_bytes();
        debug_assert!(len <= storage.len());
        BlobValue {
            hdr,
            len,
            storage: Some(storage),
            rt,
        }
    }

    fn payload_bytes(&self) -> &[u8] {
        let storage = self
            .storage
            .as_ref()
            .expect("payload storage present until drop");
        &storage.bytes()[..self.len]
    }
}

impl Drop for BlobValue {
    fn drop(&mut self) {
        // Last reference gone: hand the payload storage back to its size
        // class. After runtime teardown the storage is simply freed.
        if let Some(storage) = self.storage.take() {
            if let Some(rt) = self.rt.upgrade() {
                rt.lock_cache().pool.release(storage);
            }
        }
    }
}

/// Carrier for value clones displaced under the cache lock. The caller
/// drops it after unlocking, which is when the pool reclaim (and any
/// condvar teardown) actually runs.
#[derive(Default)]
pub(crate) struct Garbage(Vec<Arc<BlobValue>>);

impl Garbage {
    pub fn push(&mut self, value: Arc<BlobValue>) {
        self.0.push(value);
    }
}

// ── The user-facing handle ───────────────────────────────────────────────────

/// A read-only reference to one received blob.
///
/// The referenced buffer is immutable and survives until every reference
/// is dropped; a newer arrival replaces the cache slot but never touches
/// buffers already handed out. Dropping the handle releases the
/// reference (`release` is the same thing, spelled out).
pub struct Blob {
    value: Arc<BlobValue>,
}

impl Blob {
    pub(crate) fn from_value(value: Arc<BlobValue>) -> Blob {
        Blob { value }
    }

    pub fn header(&self) -> &BlobHeader {
        &self.value.hdr
    }

    pub fn id(&self) -> BlobId {
        self.value.hdr.id
    }

    pub fn elem_type(&self) -> ElementType {
        self.value.hdr.elem_type
    }

    pub fn count(&self) -> u16 {
        self.value.hdr.count
    }

    pub fn timestamp(&self) -> (u32, u32) {
        (self.value.hdr.ts_hi, self.value.hdr.ts_lo)
    }

    pub fn status(&self) -> u32 {
        self.value.hdr.status
    }

    /// Typed view of the payload.
    pub fn payload(&self) -> PayloadRef<'_> {
        let bytes = self.value.payload_bytes();
        match self.value.hdr.elem_type {
            ElementType::Float32 => PayloadRef::Float32(cast_payload(bytes)),
            ElementType::Float64 => PayloadRef::Float64(cast_payload(bytes)),
            ElementType::Uint32 => PayloadRef::Uint32(cast_payload(bytes)),
            ElementType::Int32 => PayloadRef::Int32(cast_payload(bytes)),
            ElementType::Int8 => PayloadRef::Int8(cast_payload(bytes)),
            ElementType::None => PayloadRef::None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self.payload() {
            PayloadRef::Float32(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self.payload() {
            PayloadRef::Float64(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<&[u32]> {
        match self.payload() {
            PayloadRef::Uint32(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self.payload() {
            PayloadRef::Int32(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match self.payload() {
            PayloadRef::Int8(s) => Some(s),
            _ => None,
        }
    }

    /// Release the reference. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.value.hdr;
        f.debug_struct("Blob")
            .field("id", &h.id)
            .field("type", &h.elem_type)
            .field("count", &h.count)
            .field("ts", &(h.ts_hi, h.ts_lo))
            .field("status", &h.status)
            .finish()
    }
}

/// Payload bytes are 16-byte aligned and sized at decode time, so the
/// reinterpretation cannot fail; if it ever does, internal state is
/// corrupt and continuing would be worse than stopping.
fn cast_payload<T: FromBytes>(bytes: &[u8]) -> &[T] {
    zerocopy::Ref::<_, [T]>::new_slice(bytes)
        .expect("payload alignment and size established at decode")
        .into_slice()
}

// ── Slots ────────────────────────────────────────────────────────────────────

/// Per-ID subscription state. Lives as long as the nest count is nonzero.
pub(crate) struct Slot {
    pub id: BlobId,
    /// Subscription nest count.
    pub sub_cnt: u32,
    /// Received updates for this ID; lets sync-getters detect fresh data.
    pub upd_cnt: u32,
    /// Threads currently blocked in a sync get. The final unsubscribe
    /// fails busy while this is nonzero.
    pub sync_waiters: u32,
    /// Present iff any nested subscribe asked for sync gets. One condvar
    /// serves all nested subscribers of the ID.
    pub cond: Option<Arc<std::sync::Condvar>>,
    /// Blob-set node for this ID, if it is a member of any set.
    pub node: Option<NodeIdx>,
    /// Most recent value; `None` until the first arrival.
    pub value: Option<Arc<BlobValue>>,
}

impl Slot {
    fn new(id: BlobId) -> Slot {
        Slot {
            id,
            sub_cnt: 0,
            upd_cnt: 0,
            sync_waiters: 0,
            cond: None,
            node: None,
            value: None,
        }
    }
}

/// Dense slot arena; freed indices are reused LIFO.
pub(crate) struct SlotArena {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl SlotArena {
    fn new() -> SlotArena {
        SlotArena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, slot: Slot) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn take(&mut self, idx: u32) -> Slot {
        let slot = self.slots[idx as usize]
            .take()
            .expect("slot index refers to a live slot");
        self.free.push(idx);
        slot
    }

    pub fn get(&self, idx: u32) -> &Slot {
        self.slots[idx as usize]
            .as_ref()
            .expect("slot index refers to a live slot")
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut Slot {
        self.slots[idx as usize]
            .as_mut()
            .expect("slot index refers to a live slot")
    }
}

// ── Cache state ──────────────────────────────────────────────────────────────

/// Everything the cache lock guards.
pub(crate) struct CacheState {
    pub table: IdTable<u32>,
    pub arena: SlotArena,
    pub pool: BufferPool,
    pub sets: SetArena,
    pub nodes: NodeTable,
}

impl CacheState {
    pub fn new(n_bufs: u32) -> FcomResult<CacheState> {
        // 4x the buffer budget keeps the load factor at or below 0.25
        let hint = if n_bufs == 0 { 8 } else { 4 * n_bufs as usize };
        let table = IdTable::with_capacity(hint).map_err(|_| FcomError::NoMemory)?;
        Ok(CacheState {
            table,
            arena: SlotArena::new(),
            pool: BufferPool::with_budget(n_bufs),
            sets: SetArena::new(),
            nodes: NodeTable::new(),
        })
    }

    pub fn find_slot(&self, id: BlobId) -> Option<u32> {
        self.table.find(id.raw()).copied()
    }

    pub fn slot(&self, idx: u32) -> &Slot {
        self.arena.get(idx)
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut Slot {
        self.arena.get_mut(idx)
    }

    /// Create a fresh slot for `id`. Fails `NoMemory` when the table
    /// cannot take another entry.
    pub fn create_slot(&mut self, id: BlobId) -> FcomResult<u32> {
        let idx = self.arena.insert(Slot::new(id));
        match self.table.add(id.raw(), idx) {
            Ok(()) => Ok(idx),
            Err(_) => {
                self.arena.take(idx);
                Err(FcomError::NoMemory)
            }
        }
    }

    /// Free a slot by index, returning its contents. Teardown path.
    pub fn take_slot(&mut self, idx: u32) -> Slot {
        self.arena.take(idx)
    }

    /// Undo one level of subscription, removing the slot when the nest
    /// count reaches zero. Used to roll back a failed multicast join.
    pub fn undo_subscribe(&mut self, id: BlobId, garbage: &mut Garbage) {
        if let Some(idx) = self.find_slot(id) {
            let slot = self.arena.get_mut(idx);
            slot.sub_cnt = slot.sub_cnt.saturating_sub(1);
            if slot.sub_cnt == 0 {
                let _ = self.table.remove(id.raw());
                let slot = self.arena.take(idx);
                if let Some(v) = slot.value {
                    garbage.push(v);
                }
            }
        }
    }

    /// Unnest one subscription. Returns whether this was the final level
    /// (caller then releases the GID's multicast reference).
    pub fn remove_subscription(&mut self, id: BlobId, garbage: &mut Garbage) -> FcomResult<bool> {
        let idx = self.find_slot(id).ok_or(FcomError::InvalidId)?;
        let slot = self.arena.get_mut(idx);
        if slot.sub_cnt > 1 {
            slot.sub_cnt -= 1;
            return Ok(false);
        }

        // final unsubscribe: the ID must not be pinned
        if slot.node.is_some() {
            return Err(FcomError::IdInUse);
        }
        if slot.sync_waiters > 0 {
            // a thread is blocked in a sync get on this ID
            return Err(FcomError::Sys(libc::EBUSY));
        }

        self.table
            .remove(id.raw())
            .expect("cache table entry present for a live slot");
        let slot = self.arena.take(idx);
        if let Some(v) = slot.value {
            garbage.push(v);
        }
        Ok(true)
    }
}

/// Install a freshly decoded buffer as the current value of its ID.
///
/// Runs under the cache lock. Wakes sync-getters first, then applies
/// blob-set effects. Returns false when the ID was unsubscribed while the
/// payload was being decoded (the storage goes straight back to the
/// pool and nothing else happens).
pub(crate) fn install_update(
    st: &mut CacheState,
    rt: Weak<RuntimeShared>,
    hdr: BlobHeader,
    storage: Storage,
    garbage: &mut Garbage,
) -> bool {
    let Some(idx) = st.find_slot(hdr.id) else {
        st.pool.release(storage);
        return false;
    };

    let value = Arc::new(BlobValue::new(hdr, storage, rt));
    let slot = st.arena.get_mut(idx);
    let old = slot.value.replace(value.clone());
    slot.upd_cnt = slot.upd_cnt.wrapping_add(1);
    if let Some(cond) = &slot.cond {
        cond.notify_all();
    }
    let node = slot.node;
    if let Some(old) = old {
        garbage.push(old);
    }
    if let Some(node) = node {
        sets::on_update(st, node, &value, garbage);
    }
    true
}
