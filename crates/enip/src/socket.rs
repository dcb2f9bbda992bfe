//! The socket collaborator contract.
//!
//! The stack never talks to the OS network layer directly; every
//! socket it needs is created, written and closed through this trait.
//! The event loop that owns the real sockets feeds received datagrams
//! and TCP frames back into the engine entry points.

use std::io;
use std::net::SocketAddrV4;

/// Handle for a UDP socket owned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpHandle(pub u32);

/// Handle for an accepted TCP connection owned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpHandle(pub u32);

/// Direction a UDP socket is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketDirection {
    /// The device sends produced data on this socket.
    Producing,
    /// The device receives consumed data on this socket; the driver
    /// binds (and joins a multicast group when the address is one).
    Consuming,
}

/// OS networking adapter as seen by the core.
pub trait SocketDriver {
    /// Create a UDP socket for the given direction.
    ///
    /// For [`SocketDirection::Consuming`] the address is the bind
    /// address (port, and group to join when multicast). For
    /// [`SocketDirection::Producing`] it is the future destination,
    /// kept here so the driver can pick routes or apply QoS early.
    fn create_udp_socket(
        &mut self,
        direction: SocketDirection,
        address: SocketAddrV4,
        qos_dscp: u8,
    ) -> io::Result<UdpHandle>;

    /// Send one datagram.
    fn send_udp_data(
        &mut self,
        handle: UdpHandle,
        destination: SocketAddrV4,
        data: &[u8],
    ) -> io::Result<()>;

    /// Close a UDP socket. Unknown handles are ignored.
    fn close_udp_socket(&mut self, handle: UdpHandle);

    /// Close an accepted TCP connection (session teardown).
    fn close_tcp_socket(&mut self, handle: TcpHandle);
}
