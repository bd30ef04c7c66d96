//! Blob sets: multi-ID rendezvous with ANY/ALL completion.
//!
//! A set is allocated over already-subscribed IDs and lets one thread
//! block until any or all of them receive fresh data. Membership is
//! tracked through a small fixed node table: each participating ID owns
//! one node listing every (set, member-position) pair that references it,
//! so the receive path can fan an update out to all interested sets with
//! one indexed lookup. Holding a node pins the ID: the final
//! unsubscribe fails `IdInUse` until the last set releases it.
//!
//! Sets are single-waiter. `BlobSet::wait` takes `&mut self`, so a second
//! concurrent wait on the same set is a compile error rather than the
//! undefined behavior the C API warned about.

use std::sync::{Arc, Condvar};
use std::time::{Duration, Instant};

use fcom_core::error::{FcomError, FcomResult};
use fcom_core::id::BlobId;

use crate::cache::{Blob, BlobValue, CacheState, Garbage};
use crate::RuntimeShared;

/// Most members a single set can hold (one bit per member).
pub const MAX_SET_MEMBERS: usize = 32;

/// Capacity of the global set-node table.
pub(crate) const NODE_SLOTS: usize = 255;

pub(crate) type NodeIdx = u8;

/// Wait mode: return on the first update, or only when every requested
/// member has been updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Any,
    All,
}

/// Outcome of a set wait. Both variants carry the result mask; on a
/// timeout some members may nevertheless have been updated, and their
/// bits are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetWait {
    Complete(u32),
    TimedOut(u32),
}

// ── Node table ───────────────────────────────────────────────────────────────

struct Node {
    /// (set index, member position) pairs referencing this ID.
    refs: Vec<(u32, u8)>,
}

/// Fixed-capacity table of per-ID set nodes.
pub(crate) struct NodeTable {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeIdx>,
}

impl NodeTable {
    pub fn new() -> NodeTable {
        NodeTable {
            nodes: (0..NODE_SLOTS).map(|_| None).collect(),
            free: (0..NODE_SLOTS as u8).rev().collect(),
        }
    }

    /// Reserve a node. `None` when all slots are taken.
    pub fn alloc(&mut self) -> Option<NodeIdx> {
        let idx = self.free.pop()?;
        self.nodes[idx as usize] = Some(Node { refs: Vec::new() });
        Some(idx)
    }

    pub fn add_ref(&mut self, idx: NodeIdx, set: u32, memb: u8) {
        self.node_mut(idx).refs.push((set, memb));
    }

    pub fn refs(&self, idx: NodeIdx) -> &[(u32, u8)] {
        self.nodes[idx as usize]
            .as_ref()
            .expect("node index refers to a live node")
            .refs
            .as_slice()
    }

    /// Drop every reference a set holds on this node. Returns true when
    /// the node emptied and was returned to the free list.
    pub fn remove_set(&mut self, idx: NodeIdx, set: u32) -> bool {
        let node = self.node_mut(idx);
        node.refs.retain(|&(s, _)| s != set);
        if node.refs.is_empty() {
            self.nodes[idx as usize] = None;
            self.free.push(idx);
            true
        } else {
            false
        }
    }

    fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        self.nodes[idx as usize]
            .as_mut()
            .expect("node index refers to a live node")
    }
}

// ── Set state ────────────────────────────────────────────────────────────────

pub(crate) struct SetMember {
    pub id: BlobId,
    /// Reference attached by the most recent matching update.
    pub blob: Option<Arc<BlobValue>>,
}

pub(crate) struct SetState {
    cond: Arc<Condvar>,
    /// Bits the current wait still cares about; cleared on completion so
    /// late updates cannot re-trigger the waiter.
    waitfor: u32,
    got: u32,
    wait_all: bool,
    /// A wait is in flight; freeing state guarded against this.
    pub waiting: bool,
    pub members: Vec<SetMember>,
}

/// Arena of live sets; freed indices are reused LIFO.
pub(crate) struct SetArena {
    sets: Vec<Option<SetState>>,
    free: Vec<u32>,
}

impl SetArena {
    pub fn new() -> SetArena {
        SetArena {
            sets: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, set: SetState) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.sets[idx as usize] = Some(set);
                idx
            }
            None => {
                self.sets.push(Some(set));
                (self.sets.len() - 1) as u32
            }
        }
    }

    pub fn get(&self, idx: u32) -> &SetState {
        self.sets[idx as usize]
            .as_ref()
            .expect("set index refers to a live set")
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut SetState {
        self.sets[idx as usize]
            .as_mut()
            .expect("set index refers to a live set")
    }

    fn take(&mut self, idx: u32) -> SetState {
        let set = self.sets[idx as usize]
            .take()
            .expect("set index refers to a live set");
        self.free.push(idx);
        set
    }
}

// ── Receive-path fan-out ─────────────────────────────────────────────────────

/// Apply a just-installed value to every set referencing its ID. Runs
/// under the cache lock, after the per-ID condvar broadcast.
pub(crate) fn on_update(
    st: &mut CacheState,
    node: NodeIdx,
    value: &Arc<BlobValue>,
    garbage: &mut Garbage,
) {
    // the ref list is tiny; clone it so the node borrow ends here
    let refs: Vec<(u32, u8)> = st.nodes.refs(node).to_vec();
    for (set_idx, memb) in refs {
        let set = st.sets.get_mut(set_idx);
        let bit = 1u32 << memb;
        if set.waitfor & bit == 0 {
            continue;
        }
        if let Some(old) = set.members[memb as usize].blob.replace(value.clone()) {
            garbage.push(old);
        }
        set.got |= bit;
        let complete = if set.wait_all {
            set.got & set.waitfor == set.waitfor
        } else {
            true
        };
        if complete {
            set.cond.notify_all();
            set.waitfor = 0;
        }
    }
}

// ── Allocation / teardown plumbing ───────────────────────────────────────────

/// Build the set and wire the member back-references. Caller holds both
/// the subscription and cache locks and has validated the ID list.
pub(crate) fn alloc_in_state(st: &mut CacheState, ids: &[BlobId]) -> FcomResult<u32> {
    let mut slot_idxs = Vec::with_capacity(ids.len());
    for id in ids {
        slot_idxs.push(st.find_slot(*id).ok_or(FcomError::NotSubscribed)?);
    }

    let members = ids
        .iter()
        .map(|&id| SetMember { id, blob: None })
        .collect();
    let set_idx = st.sets.insert(SetState {
        cond: Arc::new(Condvar::new()),
        waitfor: 0,
        got: 0,
        wait_all: false,
        waiting: false,
        members,
    });

    for (pos, &slot_idx) in slot_idxs.iter().enumerate() {
        let node = match st.slot(slot_idx).node {
            Some(n) => n,
            None => match st.nodes.alloc() {
                Some(n) => {
                    st.slot_mut(slot_idx).node = Some(n);
                    n
                }
                None => {
                    // node table exhausted: unwind what we wired so far
                    let mut garbage = Garbage::default();
                    unlink_set(st, set_idx, &mut garbage);
                    // nothing attached yet, so the garbage stays empty
                    return Err(FcomError::NoSpace);
                }
            },
        };
        st.nodes.add_ref(node, set_idx, pos as u8);
    }

    Ok(set_idx)
}

/// Detach a set from every member ID and free it. Attached blob
/// references land in `garbage`; node slots whose last set vanished are
/// unpinned for unsubscribe.
pub(crate) fn unlink_set(st: &mut CacheState, set_idx: u32, garbage: &mut Garbage) {
    let set = st.sets.take(set_idx);
    // a wait in flight here means the set state is corrupt
    assert!(!set.waiting, "blob set freed while a wait is in flight");
    for member in set.members {
        if let Some(v) = member.blob {
            garbage.push(v);
        }
        if let Some(slot_idx) = st.find_slot(member.id) {
            if let Some(node) = st.slot(slot_idx).node {
                if st.nodes.remove_set(node, set_idx) {
                    st.slot_mut(slot_idx).node = None;
                }
            }
        }
    }
}

// ── The user-facing handle ───────────────────────────────────────────────────

/// A rendezvous over a fixed list of subscribed IDs.
///
/// Dropping the set releases all attached blob references and unpins the
/// member IDs.
pub struct BlobSet {
    sh: Arc<RuntimeShared>,
    idx: u32,
    len: usize,
}

impl BlobSet {
    pub(crate) fn new(sh: Arc<RuntimeShared>, idx: u32, len: usize) -> BlobSet {
        BlobSet { sh, idx, len }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// ID of member `i`.
    pub fn member_id(&self, i: usize) -> Option<BlobId> {
        if i >= self.len {
            return None;
        }
        let st = self.sh.lock_cache();
        Some(st.sets.get(self.idx).members[i].id)
    }

    /// The blob attached to member `i` by the most recent matching
    /// update, if any. The returned handle is an independent reference.
    pub fn member_blob(&self, i: usize) -> Option<Blob> {
        if i >= self.len {
            return None;
        }
        let st = self.sh.lock_cache();
        st.sets.get(self.idx).members[i]
            .blob
            .clone()
            .map(Blob::from_value)
    }

    /// Detach and return member `i`'s blob, leaving the slot empty. Use
    /// this to keep a reference past the next wait.
    pub fn take_member_blob(&mut self, i: usize) -> Option<Blob> {
        if i >= self.len {
            return None;
        }
        let mut st = self.sh.lock_cache();
        st.sets.get_mut(self.idx).members[i]
            .blob
            .take()
            .map(Blob::from_value)
    }

    /// Block until the members selected by `waitfor` are updated (any
    /// one of them for `SetMode::Any`, all of them for `SetMode::All`)
    /// or the timeout expires.
    ///
    /// Bits beyond the member count are ignored; an effectively empty
    /// mask is `InvalidArg`. Updates that arrived before the call do not
    /// count.
    pub fn wait(&mut self, waitfor: u32, mode: SetMode, timeout_ms: u32) -> FcomResult<SetWait> {
        let full = if self.len >= 32 {
            u32::MAX
        } else {
            (1u32 << self.len) - 1
        };
        let mask = waitfor & full;
        if mask == 0 {
            return Err(FcomError::InvalidArg);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut st = self.sh.lock_cache();
        let cond = {
            let set = st.sets.get_mut(self.idx);
            set.waitfor = mask;
            set.got = 0;
            set.wait_all = mode == SetMode::All;
            set.waiting = true;
            set.cond.clone()
        };

        let timed_out = loop {
            if st.sets.get(self.idx).waitfor == 0 {
                break false;
            }
            let now = Instant::now();
            if now >= deadline {
                break true;
            }
            let (guard, _) = cond
                .wait_timeout(st, deadline - now)
                .expect("FCOM cache lock poisoned");
            st = guard;
        };

        let set = st.sets.get_mut(self.idx);
        // suppress any late completion
        set.waitfor = 0;
        set.waiting = false;
        let got = set.got;
        drop(st);

        if timed_out {
            Ok(SetWait::TimedOut(got))
        } else {
            Ok(SetWait::Complete(got))
        }
    }

    /// Destroy the set, releasing attached references and unpinning the
    /// member IDs. Equivalent to dropping the handle; a wait cannot be in
    /// flight because `wait` borrows the set exclusively.
    pub fn free(self) {}
}

impl Drop for BlobSet {
    fn drop(&mut self) {
        let mut garbage = Garbage::default();
        {
            let _sub = self.sh.lock_sub();
            let mut st = self.sh.lock_cache();
            unlink_set(&mut st, self.idx, &mut garbage);
        }
        // attached references (and their storage) released here
        drop(garbage);
    }
}
