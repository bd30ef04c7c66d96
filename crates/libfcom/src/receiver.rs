//! Packet ingest and dispatch.
//!
//! One dedicated thread receives datagrams with a bounded timeout and
//! feeds them through [`process_datagram`]. The dispatch path takes the
//! cache lock twice per blob: once to decide whether the ID is
//! subscribed and check out a buffer, once to install the decoded
//! result. Decoding happens in between with no lock held, so a slow
//! decode never stalls readers. Data errors are counted and skipped; the loop only
//! exits when the shutdown flag clears.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use fcom_core::error::FcomError;
use fcom_core::wire::{self, WORD};

use crate::cache::{install_update, Garbage};
use crate::pool::Storage;
use crate::rt;
use crate::RuntimeShared;

/// Receive buffer, comfortably above the largest datagram.
const RECV_BUF: usize = 2048;

/// Body of the receiver thread.
pub(crate) fn rx_loop(sh: Arc<RuntimeShared>, priority_percent: u8) {
    rt::set_realtime_priority(priority_percent);
    tracing::info!("receiver thread running");

    let mut buf = [0u8; RECV_BUF];
    while sh.running.load(Ordering::Acquire) {
        let Some(sock) = &sh.rx_sock else { break };
        match sock.recv(&mut buf) {
            Ok(n) => process_datagram(&sh, &buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => tracing::warn!(error = %e, "receive failed"),
        }
    }
    tracing::info!("receiver thread stopped");
}

/// Decode one datagram and install every subscribed blob it carries.
pub(crate) fn process_datagram(sh: &Arc<RuntimeShared>, pkt: &[u8]) {
    let (nblobs, hdr_words) = match wire::decode_msg_header(pkt) {
        Ok(v) => v,
        Err(_) => {
            sh.rx.bad_msg_version.bump();
            return;
        }
    };
    sh.rx.n_msg.bump();

    let mut off = hdr_words * WORD;
    for _ in 0..nblobs {
        sh.rx.n_blb.bump();

        let Some(stream) = pkt.get(off..) else {
            sh.rx.dec_errs.bump();
            return;
        };
        // Peek ID and size without committing to a decode. After a failed
        // peek the stream position is unknown, so the rest of the
        // message is abandoned.
        let peek = match wire::peek_blob(stream) {
            Ok(p) => p,
            Err(FcomError::BadVersion) | Err(FcomError::InvalidType) => {
                sh.rx.bad_blb_version.bump();
                return;
            }
            Err(_) => {
                sh.rx.dec_errs.bump();
                return;
            }
        };

        match checkout(sh, &peek) {
            Checkout::NotSubscribed => {}
            Checkout::NoBuffer => sh.rx.no_bufs.bump(),
            Checkout::Buffer(mut storage) => {
                // decode with no lock held
                match wire::decode_blob(stream, storage.bytes_mut()) {
                    Ok((hdr, _)) => {
                        let mut garbage = Garbage::default();
                        {
                            let mut st = sh.lock_cache();
                            install_update(&mut st, Arc::downgrade(sh), hdr, storage, &mut garbage);
                        }
                        // displaced references drop here, outside the lock
                        drop(garbage);
                    }
                    Err(_) => {
                        sh.rx.dec_errs.bump();
                        sh.lock_cache().pool.release(storage);
                    }
                }
            }
        }

        off += peek.words * WORD;
    }
}

enum Checkout {
    NotSubscribed,
    NoBuffer,
    Buffer(Storage),
}

/// Under the cache lock: is the ID subscribed, and if so, can we get a
/// buffer for the incoming payload? An allocation failure keeps the old
/// cached value visible.
fn checkout(sh: &RuntimeShared, peek: &wire::BlobPeek) -> Checkout {
    let mut st = sh.lock_cache();
    if st.find_slot(peek.id).is_none() {
        return Checkout::NotSubscribed;
    }
    match st.pool.alloc(peek.payload_bytes) {
        Some(storage) => Checkout::Buffer(storage),
        None => Checkout::NoBuffer,
    }
}
