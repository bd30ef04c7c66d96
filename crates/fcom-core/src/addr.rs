//! Multicast address plan.
//!
//! All FCOM traffic for one group travels on the address `prefix | GID`.
//! The prefix is a user-supplied IPv4 multicast address whose low bits
//! (as many as GID_MAX occupies) must be zero so that OR-ing the GID in
//! can never corrupt the prefix.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::error::{FcomError, FcomResult};
use crate::id::GID_MAX;

/// Default UDP port. Every participating peer must use the same port.
pub const PORT_DEFAULT: u16 = 4586;

/// Position of the most significant non-zero bit, 1-based.
/// `nzbits(0x15) == 5`.
pub const fn nzbits(x: u32) -> u32 {
    32 - x.leading_zeros()
}

/// Validated multicast prefix plus port: everything needed to derive a
/// destination address from a GID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastPrefix {
    prefix: Ipv4Addr,
    port: u16,
}

impl McastPrefix {
    /// Parse `"<mcast-ip>[:<port>]"`.
    ///
    /// The address must lie in 224.0.0.0/4 and must not overlap the GID
    /// bit range; the port defaults to [`PORT_DEFAULT`].
    pub fn parse(spec: &str) -> FcomResult<McastPrefix> {
        let (ip_str, port) = match spec.split_once(':') {
            Some((ip, port_str)) => {
                let port: u16 = port_str.parse().map_err(|_| FcomError::InvalidArg)?;
                (ip, port)
            }
            None => (spec, PORT_DEFAULT),
        };

        let prefix: Ipv4Addr = ip_str.parse().map_err(|_| FcomError::InvalidArg)?;
        if !prefix.is_multicast() {
            return Err(FcomError::InvalidArg);
        }
        if u32::from(prefix) & ((1u32 << nzbits(GID_MAX as u32)) - 1) != 0 {
            return Err(FcomError::InvalidArg);
        }

        Ok(McastPrefix { prefix, port })
    }

    pub fn prefix(&self) -> Ipv4Addr {
        self.prefix
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Destination address for one multicast group.
    pub fn addr_for_gid(&self, gid: u16) -> SocketAddrV4 {
        let ip = Ipv4Addr::from(u32::from(self.prefix) | gid as u32);
        SocketAddrV4::new(ip, self.port)
    }

    /// Group address only (used for membership operations).
    pub fn group_for_gid(&self, gid: u16) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.prefix) | gid as u32)
    }
}

impl FromStr for McastPrefix {
    type Err = FcomError;

    fn from_str(s: &str) -> FcomResult<McastPrefix> {
        McastPrefix::parse(s)
    }
}

impl fmt::Display for McastPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.port)
    }
}
