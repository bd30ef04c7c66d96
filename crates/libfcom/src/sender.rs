//! Send path: group assembly and multicast transmission.
//!
//! A group is a write buffer that collects the blobs of one message.
//! Encoding happens at append time; transmission wraps the header and
//! sends one datagram to the multicast address derived from the group's
//! GID. Sending consumes the group whether or not the datagram left the
//! host, so there is no half-sent state to reason about.

use fcom_core::blob::BlobDesc;
use fcom_core::error::{FcomError, FcomResult};
use fcom_core::id::{BlobId, PROTO_MAJ};
use fcom_core::wire::{self, MsgWriter};

use crate::Fcom;

/// A message under construction. Obtained from [`Fcom::alloc_group`],
/// consumed by [`Fcom::put_group`]. Dropping it discards the contents.
pub struct Group {
    writer: MsgWriter,
}

impl Group {
    pub fn gid(&self) -> u16 {
        self.writer.gid()
    }

    pub fn blob_count(&self) -> u32 {
        self.writer.blob_count()
    }
}

impl Fcom {
    /// Allocate an empty group for the multicast group `id` belongs to.
    /// `BlobId::ANY` is admissible; the GID is then fixed by the first
    /// blob added.
    pub fn alloc_group(&self, id: BlobId) -> FcomResult<Group> {
        if id.major() != PROTO_MAJ {
            return Err(FcomError::BadVersion);
        }
        Ok(Group {
            writer: MsgWriter::new(wire::MAX_DATAGRAM, id.gid())?,
        })
    }

    /// Encode a blob into the group. All blobs of one group must share a
    /// GID; adding two blobs with the same ID is a caller bug the
    /// transport does not detect.
    pub fn add_to_group(&self, group: &mut Group, blob: &BlobDesc<'_>) -> FcomResult<()> {
        group.writer.append(blob)
    }

    /// Finalize and transmit the group.
    pub fn put_group(&self, group: Group) -> FcomResult<()> {
        let (bytes, gid, nblobs) = group.writer.finish();
        if !BlobId::gid_valid(gid) {
            // empty group, or one allocated with ANY and never fed
            return Err(FcomError::InvalidId);
        }
        self.send_datagram(&bytes, gid)?;
        self.shared.tx.n_blb.add(nblobs);
        Ok(())
    }

    /// Encode and transmit a single blob, the one-member-group fast
    /// path used by tight control loops.
    pub fn put_blob(&self, blob: &BlobDesc<'_>) -> FcomResult<()> {
        let (bytes, gid) = wire::encode_single(blob, wire::MAX_DATAGRAM)?;
        self.send_datagram(&bytes, gid)?;
        self.shared.tx.n_blb.bump();
        Ok(())
    }

    fn send_datagram(&self, bytes: &[u8], gid: u16) -> FcomResult<()> {
        let sock = self.shared.tx_sock.as_ref().ok_or(FcomError::Unsupp)?;
        let dst = self.shared.prefix.addr_for_gid(gid);
        match sock.send_to(bytes, dst) {
            Ok(_) => {
                self.shared.tx.n_msg.bump();
                Ok(())
            }
            Err(e) => {
                self.shared.tx.n_snderr.bump();
                tracing::warn!(%dst, error = %e, "multicast send failed");
                Err(e.into())
            }
        }
    }
}
