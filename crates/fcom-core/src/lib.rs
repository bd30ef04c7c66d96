//! fcom-core: the protocol layer of the FCOM fast-feedback fabric.
//!
//! Blob identifiers, element types, the XDR wire codec, the multicast
//! address plan, configuration, and the error taxonomy. The runtime
//! (subscription cache, receiver thread, blob sets, sender) lives in
//! `libfcom`, which depends on this crate.

pub mod addr;
pub mod blob;
pub mod config;
pub mod error;
pub mod id;
pub mod wire;

pub use blob::{BlobDesc, BlobHeader, ElementType, PayloadRef};
pub use config::FcomConfig;
pub use error::{FcomError, FcomResult};
pub use id::BlobId;
