//! Blob data model: element types, the blob header, and the typed
//! payload views used on both the send and receive paths.

use std::fmt;

use crate::error::FcomError;
use crate::id::BlobId;

/// Element type of a blob payload.
///
/// The numeric tags are wire-level and therefore frozen under the current
/// protocol major version. `None` never travels on the wire; it marks a
/// subscription slot that has not received data yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    None = 0,
    Float32 = 1,
    Float64 = 2,
    Uint32 = 3,
    Int32 = 4,
    Int8 = 5,
}

impl ElementType {
    /// Size in bytes of one element, or `None` for the `None` sentinel.
    pub const fn elem_size(self) -> Option<usize> {
        match self {
            ElementType::None => None,
            ElementType::Float32 | ElementType::Uint32 | ElementType::Int32 => Some(4),
            ElementType::Float64 => Some(8),
            ElementType::Int8 => Some(1),
        }
    }

    /// Decode a wire type tag. The `None` tag (0) is not acceptable on the
    /// wire and decodes as `InvalidType`, like any unknown tag.
    pub fn from_wire(tag: u32) -> Result<ElementType, FcomError> {
        match tag {
            1 => Ok(ElementType::Float32),
            2 => Ok(ElementType::Float64),
            3 => Ok(ElementType::Uint32),
            4 => Ok(ElementType::Int32),
            5 => Ok(ElementType::Int8),
            _ => Err(FcomError::InvalidType),
        }
    }
}

/// Decoded blob header. 24 bytes in the C model; on the wire each field
/// occupies a full big-endian 32-bit word (see `wire`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Protocol version byte of the sender.
    pub version: u8,
    pub elem_type: ElementType,
    /// Number of payload elements (<= 65535).
    pub count: u16,
    pub id: BlobId,
    /// Reserved, zero on the wire.
    pub res: u32,
    /// Timestamp, high word. Interpretation is facility-defined.
    pub ts_hi: u32,
    /// Timestamp, low word.
    pub ts_lo: u32,
    /// Data status word; zero means good data.
    pub status: u32,
}

impl BlobHeader {
    /// Payload size in bytes implied by the type and count.
    pub fn payload_bytes(&self) -> usize {
        self.elem_type.elem_size().unwrap_or(0) * self.count as usize
    }
}

/// Borrowed, typed view of a payload array.
#[derive(Debug, Clone, Copy)]
pub enum PayloadRef<'a> {
    Float32(&'a [f32]),
    Float64(&'a [f64]),
    Uint32(&'a [u32]),
    Int32(&'a [i32]),
    Int8(&'a [i8]),
    /// Subscribed but nothing received yet.
    None,
}

impl<'a> PayloadRef<'a> {
    pub fn elem_type(&self) -> ElementType {
        match self {
            PayloadRef::Float32(_) => ElementType::Float32,
            PayloadRef::Float64(_) => ElementType::Float64,
            PayloadRef::Uint32(_) => ElementType::Uint32,
            PayloadRef::Int32(_) => ElementType::Int32,
            PayloadRef::Int8(_) => ElementType::Int8,
            PayloadRef::None => ElementType::None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PayloadRef::Float32(s) => s.len(),
            PayloadRef::Float64(s) => s.len(),
            PayloadRef::Uint32(s) => s.len(),
            PayloadRef::Int32(s) => s.len(),
            PayloadRef::Int8(s) => s.len(),
            PayloadRef::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.elem_type().elem_size().unwrap_or(0)
    }
}

/// A blob as handed to the send path: identity, timestamp, status and a
/// borrowed payload. The protocol version is supplied by the encoder.
#[derive(Debug, Clone, Copy)]
pub struct BlobDesc<'a> {
    pub id: BlobId,
    pub ts_hi: u32,
    pub ts_lo: u32,
    pub status: u32,
    pub payload: PayloadRef<'a>,
}

impl<'a> BlobDesc<'a> {
    pub fn new(id: BlobId, payload: PayloadRef<'a>) -> BlobDesc<'a> {
        BlobDesc {
            id,
            ts_hi: 0,
            ts_lo: 0,
            status: 0,
            payload,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::None => "none",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Uint32 => "uint32",
            ElementType::Int32 => "int32",
            ElementType::Int8 => "int8",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elem_sizes() {
        assert_eq!(ElementType::Float32.elem_size(), Some(4));
        assert_eq!(ElementType::Float64.elem_size(), Some(8));
        assert_eq!(ElementType::Uint32.elem_size(), Some(4));
        assert_eq!(ElementType::Int32.elem_size(), Some(4));
        assert_eq!(ElementType::Int8.elem_size(), Some(1));
        assert_eq!(ElementType::None.elem_size(), None);
    }

    #[test]
    fn wire_tags_round_trip() {
        for t in [
            ElementType::Float32,
            ElementType::Float64,
            ElementType::Uint32,
            ElementType::Int32,
            ElementType::Int8,
        ] {
            assert_eq!(ElementType::from_wire(t as u32), Ok(t));
        }
        assert_eq!(ElementType::from_wire(0), Err(FcomError::InvalidType));
        assert_eq!(ElementType::from_wire(6), Err(FcomError::InvalidType));
    }

    #[test]
    fn payload_lengths() {
        let data = [1.0f64, 2.0];
        let p = PayloadRef::Float64(&data);
        assert_eq!(p.len(), 2);
        assert_eq!(p.byte_len(), 16);
        assert_eq!(p.elem_type(), ElementType::Float64);
        assert_eq!(PayloadRef::None.byte_len(), 0);
    }
}
