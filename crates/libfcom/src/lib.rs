//! libfcom: the runtime of the FCOM fast-feedback pub/sub fabric.
//!
//! Producers publish tagged arrays of samples ("blobs") onto IPv4
//! multicast groups; consumers subscribe by blob ID and read the most
//! recent value, optionally blocking until fresh data arrive, singly or
//! as a multi-ID rendezvous (blob sets). Delivery is best-effort with
//! bounded producer-to-consumer latency; there is no broker, no
//! persistence and no retransmission.
//!
//! All state lives in a runtime context created by [`Fcom::init`] and
//! captured by the handles it returns; there is no process-global
//! singleton. One dedicated receiver thread at (best-effort) real-time
//! priority ingests packets; user threads call the API directly.
//!
//! ```no_run
//! use libfcom::{BlobDesc, BlobId, Fcom, GetMode, PayloadRef};
//!
//! let fcom = Fcom::init("239.255.0.0:4586", 100)?;
//! let id = BlobId::new(8, 8);
//!
//! fcom.subscribe(id, GetMode::Sync)?;
//! fcom.put_blob(&BlobDesc::new(id, PayloadRef::Uint32(&[42])))?;
//!
//! let blob = fcom.get_blob(id, 100)?;
//! assert_eq!(blob.as_u32(), Some(&[42][..]));
//! drop(blob);
//! # Ok::<(), libfcom::FcomError>(())
//! ```

mod cache;
mod pool;
mod receiver;
mod rt;
mod sender;
mod sets;
mod sock;
pub mod stats;
mod table;


use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fcom_core::addr::McastPrefix;
use fcom_core::id::GID_MAX;

pub use fcom_core::blob::{BlobDesc, BlobHeader, ElementType, PayloadRef};
pub use fcom_core::config::FcomConfig;
pub use fcom_core::error::{FcomError, FcomResult};
pub use fcom_core::id::BlobId;

pub use cache::Blob;
pub use sender::Group;
pub use sets::{BlobSet, SetMode, SetWait, MAX_SET_MEMBERS};

use cache::{CacheState, Garbage};
use sock::{RxSocket, TxSocket};
use stats::{keys, RxStats, TxStats};

/// Subscription flavor: `Sync` attaches a condition variable so
/// [`Fcom::get_blob`] can block for fresh data; `Async` reads the cache
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    Sync,
    Async,
}

/// Per-ID diagnostic snapshot.
#[derive(Debug, Clone, Copy)]
pub struct IdStats {
    /// Subscription nest count.
    pub sub_count: u32,
    /// Updates received since subscription.
    pub update_count: u32,
    /// A sync-get condition variable is attached.
    pub sync_capable: bool,
    /// The ID is a member of at least one blob set.
    pub in_set: bool,
}

// ── Shared runtime state ─────────────────────────────────────────────────────

/// State shared between the API handles and the receiver thread.
///
/// Exactly two locks, acquired in this order where both are needed:
/// `sub` (serializes subscribe/unsubscribe/set lifecycle, never on the
/// receive hot path) before `cache` (the hot-path lock guarding the
/// table, slots, pool, sets and nodes).
pub(crate) struct RuntimeShared {
    cache: Mutex<CacheState>,
    sub: Mutex<SubState>,
    pub(crate) rx: RxStats,
    pub(crate) tx: TxStats,
    pub(crate) running: AtomicBool,
    pub(crate) prefix: McastPrefix,
    rx_enabled: bool,
    pub(crate) rx_sock: Option<RxSocket>,
    pub(crate) tx_sock: Option<TxSocket>,
}

/// Guarded by the subscription lock: per-GID count of subscribed IDs.
/// Join multicast on 0 -> 1, leave on 1 -> 0.
struct SubState {
    gid_refs: Box<[u16]>,
}

impl SubState {
    fn new() -> SubState {
        SubState {
            gid_refs: vec![0u16; GID_MAX as usize + 1].into_boxed_slice(),
        }
    }
}

impl RuntimeShared {
    pub(crate) fn lock_cache(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().expect("FCOM cache lock poisoned")
    }

    pub(crate) fn lock_sub(&self) -> MutexGuard<'_, SubState> {
        self.sub.lock().expect("FCOM subscription lock poisoned")
    }

    fn require_rx(&self) -> FcomResult<()> {
        if self.rx_enabled {
            Ok(())
        } else {
            // initialized send-only (n_bufs == 0)
            Err(FcomError::Unsupp)
        }
    }

    fn join_mcast(&self, gid: u16) -> FcomResult<()> {
        if let Some(rx) = &self.rx_sock {
            let group = self.prefix.group_for_gid(gid);
            rx.join(group).map_err(|e| {
                tracing::warn!(%group, error = %e, "multicast join failed");
                FcomError::from(e)
            })?;
            tracing::debug!(%group, gid, "joined multicast group");
        }
        Ok(())
    }

    fn leave_mcast(&self, gid: u16) -> FcomResult<()> {
        if let Some(rx) = &self.rx_sock {
            let group = self.prefix.group_for_gid(gid);
            rx.leave(group).map_err(|e| {
                tracing::warn!(%group, error = %e, "multicast leave failed");
                FcomError::from(e)
            })?;
            tracing::debug!(%group, gid, "left multicast group");
        }
        Ok(())
    }
}

// ── The runtime handle ───────────────────────────────────────────────────────

/// An FCOM runtime instance.
///
/// Created once by [`Fcom::init`]; dropping it (or calling
/// [`Fcom::shutdown`]) stops the receiver thread. Handles returned by
/// the API ([`Blob`], [`BlobSet`]) may outlive the runtime; their
/// buffers are then freed directly instead of returning to the pool.
pub struct Fcom {
    shared: Arc<RuntimeShared>,
    rx_thread: Option<JoinHandle<()>>,
}

impl Fcom {
    /// Initialize a runtime: `prefix` is `"<mcast-ip>[:<port>]"`,
    /// `n_bufs` the receive buffer budget. `n_bufs == 0` creates a
    /// send-only instance without a receive runtime.
    ///
    /// Not idempotent in the facility sense: the receive port can be
    /// bound by one process per host.
    pub fn init(prefix: &str, n_bufs: u32) -> FcomResult<Fcom> {
        let cfg = FcomConfig {
            mc_prefix: prefix.to_string(),
            n_bufs,
            ..FcomConfig::default()
        };
        Fcom::with_config(&cfg)
    }

    /// Initialize from a full configuration (see [`FcomConfig::load`]).
    pub fn with_config(cfg: &FcomConfig) -> FcomResult<Fcom> {
        let prefix = McastPrefix::parse(&cfg.mc_prefix)?;
        let mcast_if = if cfg.mc_interface.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            cfg.mc_interface
                .parse()
                .map_err(|_| FcomError::InvalidArg)?
        };
        let rx_enabled = cfg.n_bufs > 0;

        // RX socket first: claim the well-known port before the
        // ephemeral TX bind can race it.
        let rx_sock = if rx_enabled {
            Some(RxSocket::open(
                prefix.port(),
                mcast_if,
                Duration::from_millis(cfg.rx_poll_ms.max(1) as u64),
            )?)
        } else {
            None
        };
        let tx_sock = Some(TxSocket::open(
            (mcast_if != Ipv4Addr::UNSPECIFIED).then_some(mcast_if),
        )?);

        let shared = Arc::new(RuntimeShared {
            cache: Mutex::new(CacheState::new(cfg.n_bufs)?),
            sub: Mutex::new(SubState::new()),
            rx: RxStats::default(),
            tx: TxStats::default(),
            running: AtomicBool::new(true),
            prefix,
            rx_enabled,
            rx_sock,
            tx_sock,
        });

        let rx_thread = if rx_enabled {
            let sh = shared.clone();
            let pct = cfg.rx_priority_percent;
            let handle = std::thread::Builder::new()
                .name("fcom-rx".into())
                .spawn(move || receiver::rx_loop(sh, pct))
                .map_err(FcomError::from)?;
            Some(handle)
        } else {
            None
        };

        tracing::info!(prefix = %shared.prefix, n_bufs = cfg.n_bufs, "FCOM initialized");
        Ok(Fcom {
            shared,
            rx_thread,
        })
    }

    // ── Subscription ─────────────────────────────────────────────────────────

    /// Subscribe to `id`. Subscriptions nest: each call must eventually
    /// be matched by [`Fcom::unsubscribe`]. The first subscription of a
    /// GID joins its multicast group.
    pub fn subscribe(&self, id: BlobId, mode: GetMode) -> FcomResult<()> {
        id.validate()?;
        self.shared.require_rx()?;
        let sh = &self.shared;
        let gid = id.gid();
        let mut sub = sh.lock_sub();

        // Condvar allocated outside the cache lock, attached under it;
        // one condvar serves all nested subscribers of the ID.
        let new_cond = match mode {
            GetMode::Sync => Some(Arc::new(Condvar::new())),
            GetMode::Async => None,
        };

        let mut created = false;
        {
            let mut st = sh.lock_cache();
            let idx = match st.find_slot(id) {
                Some(i) => {
                    // a cache-resident slot always carries a subscription
                    assert!(st.slot(i).sub_cnt > 0, "subscribed slot with zero nest count");
                    i
                }
                None => {
                    created = true;
                    st.create_slot(id)?
                }
            };
            let slot = st.slot_mut(idx);
            slot.sub_cnt += 1;
            if let Some(cond) = new_cond {
                if slot.cond.is_none() {
                    slot.cond = Some(cond);
                }
            }
        }

        // each distinct subscribed ID holds one reference on its GID;
        // the first one joins the multicast group
        if created {
            if sub.gid_refs[gid as usize] == 0 {
                if let Err(e) = sh.join_mcast(gid) {
                    let mut garbage = Garbage::default();
                    {
                        let mut st = sh.lock_cache();
                        st.undo_subscribe(id, &mut garbage);
                    }
                    drop(garbage);
                    return Err(e);
                }
            }
            sub.gid_refs[gid as usize] += 1;
        }
        Ok(())
    }

    /// Cancel one level of subscription. The final unsubscribe removes
    /// the cache entry and, for the GID's last ID, leaves the multicast
    /// group. It fails `IdInUse` while the ID is a blob-set member, and
    /// busy (`Sys(EBUSY)`) while a thread is blocked in a sync get.
    pub fn unsubscribe(&self, id: BlobId) -> FcomResult<()> {
        id.validate()?;
        self.shared.require_rx()?;
        let sh = &self.shared;
        let gid = id.gid();
        let mut sub = sh.lock_sub();
        let mut garbage = Garbage::default();

        let removed = {
            let mut st = sh.lock_cache();
            st.remove_subscription(id, &mut garbage)?
        };

        if removed && sub.gid_refs[gid as usize] > 0 {
            sub.gid_refs[gid as usize] -= 1;
            if sub.gid_refs[gid as usize] == 0 {
                if let Err(e) = sh.leave_mcast(gid) {
                    sub.gid_refs[gid as usize] = 1;
                    drop(sub);
                    drop(garbage);
                    return Err(e);
                }
            }
        }
        drop(sub);
        // displaced value (if any) released outside the locks
        drop(garbage);
        Ok(())
    }

    // ── Reception ────────────────────────────────────────────────────────────

    /// Fetch the most recent value of `id` from the cache.
    ///
    /// With `timeout_ms == 0` this is a plain cache read: `NoData` until
    /// the first arrival. With a nonzero timeout the calling thread
    /// blocks until fresh data arrive or the timeout expires; this
    /// requires a subscription made with [`GetMode::Sync`].
    ///
    /// The returned [`Blob`] is never updated in place; a newer arrival
    /// replaces the cache entry but leaves handed-out references alone.
    pub fn get_blob(&self, id: BlobId, timeout_ms: u32) -> FcomResult<Blob> {
        id.validate()?;
        self.shared.require_rx()?;
        let sh = &self.shared;
        let mut st = sh.lock_cache();

        if timeout_ms > 0 {
            let idx = st.find_slot(id).ok_or(FcomError::NotSubscribed)?;
            let (cond, seen) = {
                let slot = st.slot(idx);
                match &slot.cond {
                    Some(c) => (c.clone(), slot.upd_cnt),
                    // subscribed, but not for synchronous operation
                    None => return Err(FcomError::NotSubscribed),
                }
            };
            st.slot_mut(idx).sync_waiters += 1;

            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            let mut outcome = Ok(());
            loop {
                match st.find_slot(id) {
                    Some(i) if st.slot(i).upd_cnt != seen => break,
                    Some(_) => {}
                    None => {
                        outcome = Err(FcomError::NotSubscribed);
                        break;
                    }
                }
                let now = Instant::now();
                if now >= deadline {
                    outcome = Err(FcomError::TimedOut);
                    break;
                }
                let (guard, _) = cond
                    .wait_timeout(st, deadline - now)
                    .expect("FCOM cache lock poisoned");
                st = guard;
            }

            if let Some(i) = st.find_slot(id) {
                st.slot_mut(i).sync_waiters -= 1;
            }
            outcome?;
        }

        let idx = st.find_slot(id).ok_or(FcomError::NotSubscribed)?;
        match &st.slot(idx).value {
            Some(v) => Ok(Blob::from_value(v.clone())),
            None => Err(FcomError::NoData),
        }
    }

    // ── Blob sets ────────────────────────────────────────────────────────────

    /// Allocate a rendezvous over `ids`. Every ID must already be
    /// subscribed; membership pins it against final unsubscribe until
    /// the set is freed. Duplicate IDs are rejected.
    pub fn alloc_set(&self, ids: &[BlobId]) -> FcomResult<BlobSet> {
        self.shared.require_rx()?;
        if ids.is_empty() || ids.len() > MAX_SET_MEMBERS {
            return Err(FcomError::InvalidCount);
        }
        for id in ids {
            id.validate()?;
        }
        for (i, a) in ids.iter().enumerate() {
            if ids[i + 1..].contains(a) {
                return Err(FcomError::InvalidArg);
            }
        }

        let sh = &self.shared;
        let _sub = sh.lock_sub();
        let set_idx = {
            let mut st = sh.lock_cache();
            sets::alloc_in_state(&mut st, ids)?
        };
        Ok(BlobSet::new(sh.clone(), set_idx, ids.len()))
    }

    // ── Statistics ───────────────────────────────────────────────────────────

    /// Look up a batch of statistics by key (see [`stats::keys`]).
    /// Values are widened to 64 bits. Unknown keys fail `Unsupp`.
    pub fn get_stats(&self, stat_keys: &[u32]) -> FcomResult<Vec<u64>> {
        let sh = &self.shared;
        let mut out = Vec::with_capacity(stat_keys.len());
        for &key in stat_keys {
            let v: u64 = if keys::is_rx(key) {
                let kind = keys::kind(key) as usize;
                match keys::base(key) {
                    keys::RX_NUM_BLOBS_RECV => sh.rx.n_blb.get() as u64,
                    keys::RX_NUM_MESGS_RECV => sh.rx.n_msg.get() as u64,
                    keys::RX_ERR_NOBUF => sh.rx.no_bufs.get() as u64,
                    keys::RX_ERR_XDRDEC => sh.rx.dec_errs.get() as u64,
                    keys::RX_ERR_BAD_BVERS => sh.rx.bad_blb_version.get() as u64,
                    keys::RX_ERR_BAD_MVERS => sh.rx.bad_msg_version.get() as u64,
                    keys::RX_ERR_BAD_BCST => sh.rx.bad_bcst.get() as u64,
                    keys::RX_NUM_BLOBS_SUBS => sh.lock_cache().table.len() as u64,
                    keys::RX_NUM_BLOBS_MAX => sh.lock_cache().table.capacity() as u64,
                    keys::RX_NUM_BUF_KINDS => sh.lock_cache().pool.num_classes() as u64,
                    k if k == keys::rx_buf_size(0) => sh
                        .lock_cache()
                        .pool
                        .class_size(kind)
                        .ok_or(FcomError::Unsupp)?
                        as u64,
                    k if k == keys::rx_buf_num_tot(0) => sh
                        .lock_cache()
                        .pool
                        .class_total(kind)
                        .ok_or(FcomError::Unsupp)?
                        as u64,
                    k if k == keys::rx_buf_num_avl(0) => sh
                        .lock_cache()
                        .pool
                        .class_available(kind)
                        .ok_or(FcomError::Unsupp)?
                        as u64,
                    k if k == keys::rx_buf_aligned(0) => {
                        if kind >= sh.lock_cache().pool.num_classes() {
                            return Err(FcomError::Unsupp);
                        }
                        pool::PAYLOAD_ALIGN as u64
                    }
                    _ => return Err(FcomError::Unsupp),
                }
            } else if keys::is_tx(key) {
                match key {
                    keys::TX_NUM_BLOBS_SENT => sh.tx.n_blb.get() as u64,
                    keys::TX_NUM_MESGS_SENT => sh.tx.n_msg.get() as u64,
                    keys::TX_ERR_SEND => sh.tx.n_snderr.get() as u64,
                    _ => return Err(FcomError::Unsupp),
                }
            } else {
                return Err(FcomError::Unsupp);
            };
            out.push(v);
        }
        Ok(out)
    }

    /// Per-ID diagnostic snapshot. `NotSubscribed` for unknown IDs.
    pub fn id_stats(&self, id: BlobId) -> FcomResult<IdStats> {
        id.validate()?;
        let st = self.shared.lock_cache();
        let idx = st.find_slot(id).ok_or(FcomError::NotSubscribed)?;
        let slot = st.slot(idx);
        Ok(IdStats {
            sub_count: slot.sub_cnt,
            update_count: slot.upd_cnt,
            sync_capable: slot.cond.is_some(),
            in_set: slot.node.is_some(),
        })
    }

    /// Human-readable statistics dump.
    pub fn dump_stats(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let sh = &self.shared;
        {
            let st = sh.lock_cache();
            writeln!(w, "FCOM Buffer Statistics:")?;
            for k in 0..st.pool.num_classes() {
                let size = st.pool.class_size(k).unwrap_or(0);
                let tot = st.pool.class_total(k).unwrap_or(0);
                let avl = st.pool.class_available(k).unwrap_or(0);
                writeln!(
                    w,
                    "Size {size:4}: Tot {tot:4} -- Available {avl:4} -- Used {:4}",
                    tot - avl
                )?;
            }
            writeln!(w, "FCOM Rx Statistics:")?;
            writeln!(
                w,
                "  messages with unsupported version received: {:4}",
                sh.rx.bad_msg_version.get()
            )?;
            writeln!(
                w,
                "  blobs with unsupported version received:  {:6}",
                sh.rx.bad_blb_version.get()
            )?;
            writeln!(
                w,
                "  failed to allocate buffer:                {:6}",
                sh.rx.no_bufs.get()
            )?;
            writeln!(
                w,
                "  decoding errors:                          {:6}",
                sh.rx.dec_errs.get()
            )?;
            writeln!(
                w,
                "  messages processed:                    {:9}",
                sh.rx.n_msg.get()
            )?;
            writeln!(
                w,
                "  blobs processed:                       {:9}",
                sh.rx.n_blb.get()
            )?;
            let (size, used) = (st.table.capacity(), st.table.len());
            writeln!(
                w,
                "  hash table size/entries/load: {}/{}/{:.0}%",
                size,
                used,
                used as f64 / size as f64 * 100.0
            )?;
        }
        writeln!(w, "FCOM Tx Statistics:")?;
        writeln!(w, "  messages sent: {:4}", sh.tx.n_msg.get())?;
        writeln!(w, "  blobs sent:    {:4}", sh.tx.n_blb.get())?;
        writeln!(w, "  send errors:   {:4}", sh.tx.n_snderr.get())?;
        Ok(())
    }

    // ── Pool management ──────────────────────────────────────────────────────

    /// Add `n` buffers to size class `class` at run time. Thread-safe;
    /// the hash table, in contrast, is sized once at init.
    pub fn add_buffers(&self, class: usize, n: u32) -> FcomResult<()> {
        if n == 0 {
            return Ok(());
        }
        self.shared.lock_cache().pool.grow(class, n)
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Stop the receiver, drop all residual subscriptions (releasing
    /// their multicast memberships), and verify that every buffer has
    /// come home. Fails `Internal` (after cleaning up what it can) when
    /// buffers are still checked out, e.g. because the application holds
    /// [`Blob`] references.
    pub fn shutdown(mut self) -> FcomResult<()> {
        self.stop_receiver();
        let sh = &self.shared;

        let mut garbage = Garbage::default();
        {
            let mut sub = sh.lock_sub();
            let mut st = sh.lock_cache();
            let entries = st.table.drain_entries();
            for (_, slot_idx) in entries {
                let slot = st.take_slot(slot_idx);
                if let Some(v) = slot.value {
                    garbage.push(v);
                }
                let gid = slot.id.gid() as usize;
                if sub.gid_refs[gid] > 0 {
                    sub.gid_refs[gid] -= 1;
                    if sub.gid_refs[gid] == 0 {
                        let _ = sh.leave_mcast(slot.id.gid());
                    }
                }
            }
        }
        // residual cache values return their storage here
        drop(garbage);

        let st = sh.lock_cache();
        for (size, in_use) in st.pool.outstanding() {
            if in_use > 0 {
                tracing::warn!(size, in_use, "buffers still checked out at shutdown");
                return Err(FcomError::Internal);
            }
        }
        Ok(())
    }

    fn stop_receiver(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Fcom {
    fn drop(&mut self) {
        self.stop_receiver();
    }
}

// test-only construction without sockets, used by the unit suite
#[cfg(test)]
impl Fcom {
    pub(crate) fn init_local(n_bufs: u32) -> Fcom {
        let prefix = McastPrefix::parse("239.255.0.0:4586").expect("valid prefix");
        let shared = Arc::new(RuntimeShared {
            cache: Mutex::new(CacheState::new(n_bufs).expect("cache state")),
            sub: Mutex::new(SubState::new()),
            rx: RxStats::default(),
            tx: TxStats::default(),
            running: AtomicBool::new(true),
            prefix,
            rx_enabled: true,
            rx_sock: None,
            tx_sock: None,
        });
        Fcom {
            shared,
            rx_thread: None,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<RuntimeShared> {
        &self.shared
    }

    pub(crate) fn gid_refs(&self, gid: u16) -> u16 {
        self.shared.lock_sub().gid_refs[gid as usize]
    }
}
