//! FCOM wire codec: XDR encoding of blobs and messages.
//!
//! These layouts ARE the protocol. A message (one UDP datagram) is a
//! stream of big-endian 32-bit words:
//!
//! ```text
//!   message:  [version] [blob-count] blob...
//!   blob:     [version] [id] [res=0] [ts-hi] [ts-lo] [status] [type] [count]
//!             payload-words...
//! ```
//!
//! Payload words: float32/uint32/int32 one element per word; float64 as
//! two words, high half of the IEEE bit pattern first; int8 packed four
//! per word and zero-padded to a word boundary. Every field is read and
//! written with explicit big-endian conversions; there is no
//! architecture-conditional byte swapping anywhere.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::const_assert_eq;

use crate::blob::{BlobDesc, BlobHeader, ElementType, PayloadRef};
use crate::error::{FcomError, FcomResult};
use crate::id::{proto_match, BlobId, GID_ANY, PROTO_MAJ, PROTO_VERSION};

/// Bytes per XDR word.
pub const WORD: usize = 4;
/// Words in a message header.
pub const MSG_HDR_WORDS: usize = 2;
/// Words in a blob header.
pub const BLOB_HDR_WORDS: usize = 8;
/// Largest message payload a single datagram may carry (standard
/// Ethernet MTU minus IP/UDP headers). Messages never span packets.
pub const MAX_DATAGRAM: usize = 1472;
/// Largest element count a blob header can carry.
pub const MAX_COUNT: usize = 65535;

const_assert_eq!(BLOB_HDR_WORDS * WORD, 32);
const_assert_eq!(MAX_DATAGRAM % WORD, 0);

/// Fetch big-endian word `idx` of `stream`, or `NoSpace` past the end.
fn word(stream: &[u8], idx: usize) -> FcomResult<u32> {
    let off = idx * WORD;
    match stream.get(off..off + WORD) {
        Some(b) => Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(FcomError::NoSpace),
    }
}

/// A full version word must fit in one byte and carry our major nibble.
fn check_version(vers: u32) -> FcomResult<u8> {
    if vers <= 0xff && proto_match(vers as u8) {
        Ok(vers as u8)
    } else {
        Err(FcomError::BadVersion)
    }
}

fn payload_words(ty: ElementType, count: usize) -> usize {
    match ty {
        ElementType::Float64 => count * 2,
        ElementType::Int8 => (count + 3) / 4,
        _ => count,
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Result of peeking a blob without decoding its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobPeek {
    pub id: BlobId,
    pub elem_type: ElementType,
    pub count: usize,
    /// Payload size in bytes once decoded (native representation).
    pub payload_bytes: usize,
    /// Total words this blob occupies in the stream, header included.
    pub words: usize,
}

/// Extract ID, type and size information from the blob at the head of
/// `stream` without touching the payload. This is what the receiver uses
/// to decide whether to allocate before committing to a full decode.
pub fn peek_blob(stream: &[u8]) -> FcomResult<BlobPeek> {
    check_version(word(stream, 0)?)?;

    let id = BlobId::from_raw(word(stream, 1)?);
    let elem_type = ElementType::from_wire(word(stream, 6)?)?;
    let count = word(stream, 7)? as usize;
    if count > MAX_COUNT {
        return Err(FcomError::InvalidCount);
    }

    // elem_size is Some for every wire-decodable type
    let payload_bytes = count * elem_type.elem_size().unwrap_or(0);

    Ok(BlobPeek {
        id,
        elem_type,
        count,
        payload_bytes,
        words: BLOB_HDR_WORDS + payload_words(elem_type, count),
    })
}

/// Decode the message header. Returns the blob count and the number of
/// words consumed.
pub fn decode_msg_header(stream: &[u8]) -> FcomResult<(usize, usize)> {
    check_version(word(stream, 0)?)?;
    Ok((word(stream, 1)? as usize, MSG_HDR_WORDS))
}

/// Decode the blob at the head of `stream`, writing the payload in native
/// element representation into `out`. Fails `NoSpace` when `out` is too
/// small for the payload, `BadVersion`/`InvalidType` as in [`peek_blob`].
///
/// Returns the decoded header and the number of words consumed.
pub fn decode_blob(stream: &[u8], out: &mut [u8]) -> FcomResult<(BlobHeader, usize)> {
    let version = check_version(word(stream, 0)?)?;

    let id = BlobId::from_raw(word(stream, 1)?);
    let res = word(stream, 2)?;
    let ts_hi = word(stream, 3)?;
    let ts_lo = word(stream, 4)?;
    let status = word(stream, 5)?;
    let elem_type = ElementType::from_wire(word(stream, 6)?)?;
    let count = word(stream, 7)? as usize;
    if count > MAX_COUNT {
        return Err(FcomError::InvalidCount);
    }

    let payload_bytes = count * elem_type.elem_size().unwrap_or(0);
    if payload_bytes > out.len() {
        return Err(FcomError::NoSpace);
    }

    match elem_type {
        ElementType::Float32 | ElementType::Uint32 | ElementType::Int32 => {
            for i in 0..count {
                let w = word(stream, BLOB_HDR_WORDS + i)?;
                out[i * 4..i * 4 + 4].copy_from_slice(&w.to_ne_bytes());
            }
        }
        ElementType::Float64 => {
            for i in 0..count {
                let hi = word(stream, BLOB_HDR_WORDS + 2 * i)?;
                let lo = word(stream, BLOB_HDR_WORDS + 2 * i + 1)?;
                let bits = ((hi as u64) << 32) | lo as u64;
                out[i * 8..i * 8 + 8].copy_from_slice(&bits.to_ne_bytes());
            }
        }
        ElementType::Int8 => {
            let start = BLOB_HDR_WORDS * WORD;
            let src = stream
                .get(start..start + payload_bytes)
                .ok_or(FcomError::NoSpace)?;
            out[..payload_bytes].copy_from_slice(src);
            // trailing pad bytes in the last word are ignored
        }
        ElementType::None => {}
    }

    let hdr = BlobHeader {
        version,
        elem_type,
        count: count as u16,
        id,
        res,
        ts_hi,
        ts_lo,
        status,
    };
    Ok((hdr, BLOB_HDR_WORDS + payload_words(elem_type, count)))
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Encode one blob onto `out`. `avail` is the remaining space in bytes;
/// nothing is written when the blob does not fit.
///
/// Returns the number of words written.
pub fn encode_blob(out: &mut BytesMut, desc: &BlobDesc<'_>, avail: usize) -> FcomResult<usize> {
    if desc.id.major() != PROTO_MAJ {
        return Err(FcomError::BadVersion);
    }
    if !desc.id.is_valid() {
        return Err(FcomError::InvalidId);
    }

    let count = desc.payload.len();
    if count > MAX_COUNT {
        return Err(FcomError::InvalidCount);
    }
    let ty = desc.payload.elem_type();
    if ty == ElementType::None {
        return Err(FcomError::InvalidType);
    }

    let words = BLOB_HDR_WORDS + payload_words(ty, count);
    if words * WORD > avail {
        return Err(FcomError::NoSpace);
    }

    out.put_u32(PROTO_VERSION as u32);
    out.put_u32(desc.id.raw());
    out.put_u32(0); // reserved
    out.put_u32(desc.ts_hi);
    out.put_u32(desc.ts_lo);
    out.put_u32(desc.status);
    out.put_u32(ty as u32);
    out.put_u32(count as u32);

    match desc.payload {
        PayloadRef::Float32(s) => {
            for v in s {
                out.put_u32(v.to_bits());
            }
        }
        PayloadRef::Uint32(s) => {
            for v in s {
                out.put_u32(*v);
            }
        }
        PayloadRef::Int32(s) => {
            for v in s {
                out.put_u32(*v as u32);
            }
        }
        PayloadRef::Float64(s) => {
            for v in s {
                let bits = v.to_bits();
                out.put_u32((bits >> 32) as u32);
                out.put_u32(bits as u32);
            }
        }
        PayloadRef::Int8(s) => {
            for v in s {
                out.put_i8(*v);
            }
            for _ in 0..(4 - count % 4) % 4 {
                out.put_u8(0);
            }
        }
        PayloadRef::None => {}
    }

    Ok(words)
}

/// Incremental writer for a message (an FCOM group). All blobs appended
/// to one writer must share a GID; a writer created with the `ANY` GID is
/// fixed by its first blob.
#[derive(Debug)]
pub struct MsgWriter {
    buf: BytesMut,
    cap: usize,
    gid: u16,
    n_blobs: u32,
}

impl MsgWriter {
    /// Start a message with at most `cap` bytes of wire space.
    pub fn new(cap: usize, gid: u16) -> FcomResult<MsgWriter> {
        if gid != GID_ANY && !BlobId::gid_valid(gid) {
            return Err(FcomError::InvalidId);
        }
        if cap < MSG_HDR_WORDS * WORD {
            return Err(FcomError::NoSpace);
        }
        let mut buf = BytesMut::with_capacity(cap);
        // header words are patched in finish()
        buf.put_u32(0);
        buf.put_u32(0);
        Ok(MsgWriter {
            buf,
            cap,
            gid,
            n_blobs: 0,
        })
    }

    pub fn gid(&self) -> u16 {
        self.gid
    }

    pub fn blob_count(&self) -> u32 {
        self.n_blobs
    }

    /// Append one blob. Fails `InvalidId` when the blob's GID does not
    /// match the message's, `NoSpace` when the message would overflow.
    pub fn append(&mut self, desc: &BlobDesc<'_>) -> FcomResult<()> {
        let gid = desc.id.gid();
        if self.gid != GID_ANY && gid != self.gid {
            return Err(FcomError::InvalidId);
        }

        let mark = self.buf.len();
        match encode_blob(&mut self.buf, desc, self.cap - mark) {
            Ok(_) => {
                self.gid = gid;
                self.n_blobs += 1;
                Ok(())
            }
            Err(e) => {
                self.buf.truncate(mark);
                Err(e)
            }
        }
    }

    /// Finalize the message header and hand back the encoded datagram
    /// together with its GID and blob count.
    pub fn finish(mut self) -> (Bytes, u16, u32) {
        self.buf[0..4].copy_from_slice(&(PROTO_VERSION as u32).to_be_bytes());
        self.buf[4..8].copy_from_slice(&self.n_blobs.to_be_bytes());
        (self.buf.freeze(), self.gid, self.n_blobs)
    }
}

/// Compact encoder for a message holding exactly one blob. Skips the
/// writer's GID bookkeeping; the common case on tight control loops.
pub fn encode_single(desc: &BlobDesc<'_>, cap: usize) -> FcomResult<(Bytes, u16)> {
    if cap < MSG_HDR_WORDS * WORD {
        return Err(FcomError::NoSpace);
    }
    let mut buf = BytesMut::with_capacity(cap);
    buf.put_u32(PROTO_VERSION as u32);
    buf.put_u32(1);
    encode_blob(&mut buf, desc, cap - MSG_HDR_WORDS * WORD)?;
    Ok((buf.freeze(), desc.id.gid()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_round_trip(desc: &BlobDesc<'_>) -> (BlobHeader, Vec<u8>, usize) {
        let mut buf = BytesMut::new();
        let words = encode_blob(&mut buf, desc, MAX_DATAGRAM).unwrap();
        assert_eq!(buf.len(), words * WORD);

        let mut out = vec![0u8; 4096];
        let (hdr, consumed) = decode_blob(&buf, &mut out).unwrap();
        assert_eq!(consumed, words);
        out.truncate(hdr.payload_bytes());
        (hdr, out, words)
    }

    #[test]
    fn uint32_round_trip() {
        let data = [0xdead_beefu32, 1, 0xffff_ffff];
        let desc = BlobDesc {
            id: BlobId::new(8, 8),
            ts_hi: 1,
            ts_lo: 2,
            status: 0,
            payload: PayloadRef::Uint32(&data),
        };
        let (hdr, out, words) = decode_round_trip(&desc);
        assert_eq!(hdr.id, desc.id);
        assert_eq!(hdr.version, PROTO_VERSION);
        assert_eq!((hdr.ts_hi, hdr.ts_lo), (1, 2));
        assert_eq!(hdr.count, 3);
        assert_eq!(words, BLOB_HDR_WORDS + 3);

        let vals: Vec<u32> = out
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, data);
    }

    #[test]
    fn float64_high_word_first() {
        let data = [1.0f64];
        let desc = BlobDesc::new(BlobId::new(8, 9), PayloadRef::Float64(&data));
        let mut buf = BytesMut::new();
        encode_blob(&mut buf, &desc, MAX_DATAGRAM).unwrap();

        // 1.0 == 0x3FF0000000000000; the high half must come first
        let hi = &buf[BLOB_HDR_WORDS * WORD..BLOB_HDR_WORDS * WORD + 4];
        let lo = &buf[BLOB_HDR_WORDS * WORD + 4..BLOB_HDR_WORDS * WORD + 8];
        assert_eq!(hi, 0x3FF0_0000u32.to_be_bytes());
        assert_eq!(lo, 0u32.to_be_bytes());

        let (hdr, out, _) = decode_round_trip(&desc);
        assert_eq!(hdr.elem_type, ElementType::Float64);
        let bits = u64::from_ne_bytes(out[..8].try_into().unwrap());
        assert_eq!(f64::from_bits(bits), 1.0);
    }

    #[test]
    fn float32_bit_exact() {
        let data = [f32::from_bits(0x7fc0_0001), -0.0f32];
        let desc = BlobDesc::new(BlobId::new(8, 9), PayloadRef::Float32(&data));
        let (_, out, _) = decode_round_trip(&desc);
        let bits: Vec<u32> = out
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(bits, vec![0x7fc0_0001, 0x8000_0000]);
    }

    #[test]
    fn int8_padding() {
        for n in 1..=8usize {
            let data: Vec<i8> = (0..n as i8).collect();
            let desc = BlobDesc::new(BlobId::new(8, 10), PayloadRef::Int8(&data));
            let mut buf = BytesMut::new();
            let words = encode_blob(&mut buf, &desc, MAX_DATAGRAM).unwrap();
            assert_eq!(words, BLOB_HDR_WORDS + (n + 3) / 4);
            assert_eq!(buf.len() % WORD, 0);

            let (hdr, out, consumed) = decode_round_trip(&desc);
            assert_eq!(consumed, words);
            assert_eq!(hdr.count as usize, n);
            assert_eq!(out, data.iter().map(|v| *v as u8).collect::<Vec<_>>());
        }
    }

    #[test]
    fn peek_matches_decode() {
        let data = [7u32; 5];
        let desc = BlobDesc::new(BlobId::new(9, 33), PayloadRef::Uint32(&data));
        let mut buf = BytesMut::new();
        let words = encode_blob(&mut buf, &desc, MAX_DATAGRAM).unwrap();

        let peek = peek_blob(&buf).unwrap();
        assert_eq!(peek.id, desc.id);
        assert_eq!(peek.elem_type, ElementType::Uint32);
        assert_eq!(peek.count, 5);
        assert_eq!(peek.payload_bytes, 20);
        assert_eq!(peek.words, words);
    }

    #[test]
    fn version_mismatch_rejected() {
        let data = [1u32];
        let desc = BlobDesc::new(BlobId::new(8, 8), PayloadRef::Uint32(&data));
        let mut buf = BytesMut::new();
        encode_blob(&mut buf, &desc, MAX_DATAGRAM).unwrap();

        // corrupt the version word's major nibble
        buf[3] = 0x21;
        assert_eq!(peek_blob(&buf), Err(FcomError::BadVersion));
        let mut out = [0u8; 64];
        assert_eq!(
            decode_blob(&buf, &mut out).unwrap_err(),
            FcomError::BadVersion
        );

        // a version "word" with junk in the upper bytes is also bad
        buf[0] = 1;
        buf[3] = 0x11;
        assert_eq!(peek_blob(&buf), Err(FcomError::BadVersion));
    }

    #[test]
    fn unknown_type_rejected() {
        let data = [1u32];
        let desc = BlobDesc::new(BlobId::new(8, 8), PayloadRef::Uint32(&data));
        let mut buf = BytesMut::new();
        encode_blob(&mut buf, &desc, MAX_DATAGRAM).unwrap();
        buf[6 * WORD + 3] = 9;
        assert_eq!(peek_blob(&buf), Err(FcomError::InvalidType));
    }

    #[test]
    fn decode_into_undersized_buffer() {
        let data = [0u32; 16];
        let desc = BlobDesc::new(BlobId::new(8, 8), PayloadRef::Uint32(&data));
        let mut buf = BytesMut::new();
        encode_blob(&mut buf, &desc, MAX_DATAGRAM).unwrap();

        let mut out = [0u8; 32]; // 64 bytes needed
        assert_eq!(decode_blob(&buf, &mut out).unwrap_err(), FcomError::NoSpace);
    }

    #[test]
    fn truncated_stream_is_no_space() {
        let data = [0u32; 4];
        let desc = BlobDesc::new(BlobId::new(8, 8), PayloadRef::Uint32(&data));
        let mut buf = BytesMut::new();
        encode_blob(&mut buf, &desc, MAX_DATAGRAM).unwrap();
        let short = &buf[..buf.len() - 4];
        let mut out = [0u8; 64];
        assert_eq!(
            decode_blob(short, &mut out).unwrap_err(),
            FcomError::NoSpace
        );
    }

    #[test]
    fn encode_rejects_bad_ids() {
        let data = [1u32];
        let mut buf = BytesMut::new();
        let wild = BlobDesc::new(BlobId::new(0, 8), PayloadRef::Uint32(&data));
        assert_eq!(
            encode_blob(&mut buf, &wild, MAX_DATAGRAM),
            Err(FcomError::InvalidId)
        );
        let foreign = BlobDesc::new(BlobId::from_raw(0x2008_0008), PayloadRef::Uint32(&data));
        assert_eq!(
            encode_blob(&mut buf, &foreign, MAX_DATAGRAM),
            Err(FcomError::BadVersion)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_blob_is_no_space() {
        let data = vec![0u32; 400]; // 1600 bytes > MAX_DATAGRAM
        let desc = BlobDesc::new(BlobId::new(8, 8), PayloadRef::Uint32(&data));
        let mut buf = BytesMut::new();
        assert_eq!(
            encode_blob(&mut buf, &desc, MAX_DATAGRAM),
            Err(FcomError::NoSpace)
        );
    }

    #[test]
    fn message_writer_fixes_wildcard_gid() {
        let data = [1u32];
        let mut w = MsgWriter::new(MAX_DATAGRAM, GID_ANY).unwrap();
        assert_eq!(w.gid(), GID_ANY);

        w.append(&BlobDesc::new(BlobId::new(12, 8), PayloadRef::Uint32(&data)))
            .unwrap();
        assert_eq!(w.gid(), 12);

        // same GID is fine, a different one is not
        w.append(&BlobDesc::new(BlobId::new(12, 9), PayloadRef::Uint32(&data)))
            .unwrap();
        assert_eq!(
            w.append(&BlobDesc::new(BlobId::new(13, 8), PayloadRef::Uint32(&data))),
            Err(FcomError::InvalidId)
        );

        let (bytes, gid, n) = w.finish();
        assert_eq!(gid, 12);
        assert_eq!(n, 2);

        let (count, words) = decode_msg_header(&bytes).unwrap();
        assert_eq!(count, 2);
        assert_eq!(words, MSG_HDR_WORDS);
    }

    #[test]
    fn failed_append_leaves_writer_intact() {
        let small = MSG_HDR_WORDS * WORD + (BLOB_HDR_WORDS + 1) * WORD;
        let mut w = MsgWriter::new(small, GID_ANY).unwrap();
        let one = [1u32];
        let many = [1u32; 8];
        w.append(&BlobDesc::new(BlobId::new(8, 8), PayloadRef::Uint32(&one)))
            .unwrap();
        assert_eq!(
            w.append(&BlobDesc::new(BlobId::new(8, 9), PayloadRef::Uint32(&many))),
            Err(FcomError::NoSpace)
        );
        let (bytes, _, n) = w.finish();
        assert_eq!(n, 1);
        assert_eq!(bytes.len(), small);
    }

    #[test]
    fn single_blob_message_matches_writer() {
        let data = [0xdead_beefu32];
        let desc = BlobDesc {
            id: BlobId::new(8, 8),
            ts_hi: 1,
            ts_lo: 2,
            status: 0,
            payload: PayloadRef::Uint32(&data),
        };

        let (single, gid) = encode_single(&desc, MAX_DATAGRAM).unwrap();
        assert_eq!(gid, 8);

        let mut w = MsgWriter::new(MAX_DATAGRAM, GID_ANY).unwrap();
        w.append(&desc).unwrap();
        let (via_writer, _, _) = w.finish();

        assert_eq!(&single[..], &via_writer[..]);
    }
}
