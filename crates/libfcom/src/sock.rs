//! UDP multicast socket pair.
//!
//! The RX socket binds the well-known FCOM port with SO_REUSEADDR and a
//! read timeout (the receiver thread polls its shutdown flag between
//! timeouts); multicast memberships are joined and left on it as GID
//! reference counts cross zero. The TX socket binds an ephemeral port
//! and has multicast loopback enabled so co-located consumers see their
//! own traffic.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

pub(crate) struct RxSocket {
    sock: UdpSocket,
    mcast_if: Ipv4Addr,
}

impl RxSocket {
    /// Bind the receive socket. `mcast_if` selects the interface
    /// memberships are joined on; UNSPECIFIED leaves the choice to the
    /// kernel's routing table.
    pub fn open(port: u16, mcast_if: Ipv4Addr, poll: Duration) -> std::io::Result<RxSocket> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        sock.set_read_timeout(Some(poll))?;
        Ok(RxSocket {
            sock: sock.into(),
            mcast_if,
        })
    }

    pub fn join(&self, group: Ipv4Addr) -> std::io::Result<()> {
        self.sock.join_multicast_v4(&group, &self.mcast_if)
    }

    pub fn leave(&self, group: Ipv4Addr) -> std::io::Result<()> {
        self.sock.leave_multicast_v4(&group, &self.mcast_if)
    }

    /// Blocks for at most the configured poll timeout.
    pub fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.sock.recv(buf)
    }
}

pub(crate) struct TxSocket {
    sock: UdpSocket,
}

impl TxSocket {
    pub fn open(mcast_if: Option<Ipv4Addr>) -> std::io::Result<TxSocket> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if let Some(ifaddr) = mcast_if {
            sock.set_multicast_if_v4(&ifaddr)?;
        }
        sock.set_multicast_loop_v4(true)?;
        sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        Ok(TxSocket { sock: sock.into() })
    }

    pub fn send_to(&self, buf: &[u8], dst: SocketAddrV4) -> std::io::Result<usize> {
        self.sock.send_to(buf, dst)
    }
}
