//! Diagnostic counters and the structured statistics key namespace.
//!
//! Counters are 32-bit relaxed atomics: readers may observe inconsistent
//! cross-counter snapshots, which is fine for diagnostics and keeps the
//! receive path free of synchronization beyond the cache lock it already
//! holds.
//!
//! Keys encode direction, width and counter number:
//!
//! ```text
//!   31..28  protocol major version
//!   26..24  direction (1 = RX, 2 = TX) and width (bit 26: 64-bit)
//!   23..16  counter number
//!   15..0   buffer kind, for the per-class RX counters
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use fcom_core::id::PROTO_MAJ;

/// A relaxed 32-bit event counter.
#[derive(Default)]
pub(crate) struct Counter(AtomicU32);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u32) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Receive-side counters.
#[derive(Default)]
pub(crate) struct RxStats {
    /// Messages processed.
    pub n_msg: Counter,
    /// Blobs seen inside processed messages.
    pub n_blb: Counter,
    /// Buffer allocation failures (subscribed blob dropped, old value kept).
    pub no_bufs: Counter,
    /// Decoder errors.
    pub dec_errs: Counter,
    /// Messages with an unsupported version.
    pub bad_msg_version: Counter,
    /// Blobs with an unsupported version.
    pub bad_blb_version: Counter,
    /// Failed waiter broadcasts. Condvar broadcast cannot fail on this
    /// platform, so this stays zero; the key is kept for compatibility.
    pub bad_bcst: Counter,
}

/// Transmit-side counters.
#[derive(Default)]
pub(crate) struct TxStats {
    pub n_msg: Counter,
    pub n_blb: Counter,
    pub n_snderr: Counter,
}

// ── Key namespace ────────────────────────────────────────────────────────────

pub mod keys {
    //! Statistics keys accepted by `Fcom::get_stats`.

    use super::PROTO_MAJ;

    const fn rx32(n: u32) -> u32 {
        ((PROTO_MAJ as u32) << 28) | (1 << 24) | (n << 16)
    }

    const fn tx32(n: u32) -> u32 {
        ((PROTO_MAJ as u32) << 28) | (2 << 24) | (n << 16)
    }

    /// Blobs received.
    pub const RX_NUM_BLOBS_RECV: u32 = rx32(1);
    /// Messages (groups) received.
    pub const RX_NUM_MESGS_RECV: u32 = rx32(2);
    /// Failed buffer allocations.
    pub const RX_ERR_NOBUF: u32 = rx32(3);
    /// Decoder errors.
    pub const RX_ERR_XDRDEC: u32 = rx32(4);
    /// Blobs with bad/unknown version.
    pub const RX_ERR_BAD_BVERS: u32 = rx32(5);
    /// Messages with bad/unknown version.
    pub const RX_ERR_BAD_MVERS: u32 = rx32(6);
    /// Failed sync/set broadcasts.
    pub const RX_ERR_BAD_BCST: u32 = rx32(7);
    /// Currently subscribed blobs.
    pub const RX_NUM_BLOBS_SUBS: u32 = rx32(8);
    /// Maximum supported number of subscribed blobs.
    pub const RX_NUM_BLOBS_MAX: u32 = rx32(9);
    /// Number of buffer kinds (size classes).
    pub const RX_NUM_BUF_KINDS: u32 = rx32(10);

    /// Buffer size of a kind.
    pub const fn rx_buf_size(kind: u16) -> u32 {
        rx32(11) | kind as u32
    }
    /// Total buffers of a kind.
    pub const fn rx_buf_num_tot(kind: u16) -> u32 {
        rx32(12) | kind as u32
    }
    /// Available buffers of a kind.
    pub const fn rx_buf_num_avl(kind: u16) -> u32 {
        rx32(13) | kind as u32
    }
    /// Guaranteed payload alignment of a kind.
    pub const fn rx_buf_aligned(kind: u16) -> u32 {
        rx32(14) | kind as u32
    }

    /// Blobs sent.
    pub const TX_NUM_BLOBS_SENT: u32 = tx32(1);
    /// Messages sent.
    pub const TX_NUM_MESGS_SENT: u32 = tx32(2);
    /// Send failures.
    pub const TX_ERR_SEND: u32 = tx32(3);

    /// True for keys carrying 32-bit values.
    pub const fn is_32(key: u32) -> bool {
        key & (4 << 24) == 0
    }

    pub(crate) const fn is_rx(key: u32) -> bool {
        (key >> 24) & 3 == 1
    }

    pub(crate) const fn is_tx(key: u32) -> bool {
        (key >> 24) & 3 == 2
    }

    /// Buffer kind carried in the low bits of the per-class keys.
    pub(crate) const fn kind(key: u32) -> u16 {
        key as u16
    }

    /// The key with its kind bits stripped, for dispatch.
    pub(crate) const fn base(key: u32) -> u32 {
        key & !0xffff
    }
}
