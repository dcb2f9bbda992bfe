//! Tokio-backed implementation of the stack's socket collaborator.
//!
//! TCP streams and UDP sockets live in reader tasks on the current
//! thread's `LocalSet`; received frames flow back to the event loop
//! over one unbounded channel. Consuming I/O sockets that share the
//! same bind address (several connections on the I/O port, multicast
//! groups included) share one underlying socket with a reference
//! count.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use enip::{SocketDirection, SocketDriver, TcpHandle, UdpHandle};

/// Events the socket layer feeds into the main loop.
#[derive(Debug)]
pub enum Event {
    /// One complete encapsulation frame arrived on a TCP session.
    TcpFrame(TcpHandle, Vec<u8>, SocketAddrV4),
    /// The peer closed its TCP connection.
    TcpClosed(TcpHandle),
    /// A datagram arrived on the encapsulation UDP port.
    UdpEncap(Vec<u8>, SocketAddrV4),
    /// A datagram arrived on an I/O socket.
    UdpIo(Vec<u8>, SocketAddrV4),
}

struct TcpPeer {
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct UdpEntry {
    socket: Rc<UdpSocket>,
    /// Port of a shared consuming socket, if any.
    shared_port: Option<u16>,
    reader: Option<JoinHandle<()>>,
}

struct SharedConsumer {
    socket: Rc<UdpSocket>,
    reader: JoinHandle<()>,
    joined_groups: Vec<Ipv4Addr>,
    users: usize,
}

pub struct TokioSocketDriver {
    events: mpsc::UnboundedSender<Event>,
    tcp: HashMap<u32, TcpPeer>,
    udp: HashMap<u32, UdpEntry>,
    /// Consuming sockets shared per local port (every I/O connection
    /// consumes on the same port; multicast groups are joined on the
    /// shared socket as they appear).
    shared: HashMap<u16, SharedConsumer>,
    next_tcp: u32,
    next_udp: u32,
}

impl TokioSocketDriver {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            tcp: HashMap::new(),
            udp: HashMap::new(),
            shared: HashMap::new(),
            next_tcp: 0,
            next_udp: 0,
        }
    }

    /// Register a pre-bound UDP socket (the encapsulation port).
    pub fn register_udp(&mut self, handle: UdpHandle, socket: Rc<UdpSocket>) {
        self.next_udp = self.next_udp.max(handle.0 + 1);
        self.udp.insert(
            handle.0,
            UdpEntry {
                socket,
                shared_port: None,
                reader: None,
            },
        );
    }

    /// Adopt an accepted TCP stream: spawn its reader and writer.
    pub fn register_tcp(&mut self, stream: TcpStream, peer: SocketAddr) -> TcpHandle {
        self.next_tcp += 1;
        let handle = TcpHandle(self.next_tcp);
        let origin = match peer {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };

        let (mut read_half, mut write_half) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let events = self.events.clone();
        let reader = tokio::task::spawn_local(async move {
            loop {
                let mut header = [0u8; 24];
                if read_half.read_exact(&mut header).await.is_err() {
                    break;
                }
                let length = u16::from_le_bytes([header[2], header[3]]) as usize;
                let mut frame = header.to_vec();
                frame.resize(24 + length, 0);
                if read_half.read_exact(&mut frame[24..]).await.is_err() {
                    break;
                }
                if events.send(Event::TcpFrame(handle, frame, origin)).is_err() {
                    break;
                }
            }
            let _ = events.send(Event::TcpClosed(handle));
        });

        let writer = tokio::task::spawn_local(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(reply) = reply_rx.recv().await {
                if write_half.write_all(&reply).await.is_err() {
                    break;
                }
            }
        });

        self.tcp.insert(
            handle.0,
            TcpPeer {
                reply_tx,
                reader,
                writer,
            },
        );
        handle
    }

    /// Queue a reply frame on a TCP session.
    pub fn send_tcp_reply(&mut self, handle: TcpHandle, reply: Vec<u8>) {
        if let Some(peer) = self.tcp.get(&handle.0) {
            let _ = peer.reply_tx.send(reply);
        }
    }

    /// Drop the bookkeeping for a TCP session the peer closed.
    pub fn forget_tcp(&mut self, handle: TcpHandle) {
        if let Some(peer) = self.tcp.remove(&handle.0) {
            peer.reader.abort();
            peer.writer.abort();
        }
    }

    /// Bind (or reuse) the consuming socket for a port and start its
    /// reader; join the multicast group when the address names one.
    fn consuming_socket(&mut self, address: SocketAddrV4) -> io::Result<Rc<UdpSocket>> {
        let port = address.port();
        if let Some(consumer) = self.shared.get_mut(&port) {
            consumer.users += 1;
            if address.ip().is_multicast() && !consumer.joined_groups.contains(address.ip()) {
                consumer
                    .socket
                    .join_multicast_v4(*address.ip(), Ipv4Addr::UNSPECIFIED)?;
                consumer.joined_groups.push(*address.ip());
                debug!(group = %address.ip(), "joined multicast group");
            }
            return Ok(Rc::clone(&consumer.socket));
        }

        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let std_socket = std::net::UdpSocket::bind(bind)?;
        std_socket.set_nonblocking(true)?;
        let socket = Rc::new(UdpSocket::from_std(std_socket)?);
        let mut joined_groups = Vec::new();
        if address.ip().is_multicast() {
            socket.join_multicast_v4(*address.ip(), Ipv4Addr::UNSPECIFIED)?;
            joined_groups.push(*address.ip());
            debug!(group = %address.ip(), "joined multicast group");
        }

        let events = self.events.clone();
        let reader_socket = Rc::clone(&socket);
        let reader = tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, SocketAddr::V4(origin))) => {
                        let _ = events.send(Event::UdpIo(buf[..len].to_vec(), origin));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "I/O socket receive failed");
                        break;
                    }
                }
            }
        });

        self.shared.insert(
            port,
            SharedConsumer {
                socket: Rc::clone(&socket),
                reader,
                joined_groups,
                users: 1,
            },
        );
        Ok(socket)
    }

    fn release_shared(&mut self, port: u16) {
        if let Some(consumer) = self.shared.get_mut(&port) {
            consumer.users -= 1;
            if consumer.users == 0 {
                if let Some(consumer) = self.shared.remove(&port) {
                    consumer.reader.abort();
                }
            }
        }
    }
}

impl SocketDriver for TokioSocketDriver {
    fn create_udp_socket(
        &mut self,
        direction: SocketDirection,
        address: SocketAddrV4,
        _qos_dscp: u8,
    ) -> io::Result<UdpHandle> {
        self.next_udp += 1;
        let handle = UdpHandle(self.next_udp);

        let entry = match direction {
            SocketDirection::Consuming => UdpEntry {
                socket: self.consuming_socket(address)?,
                shared_port: Some(address.port()),
                reader: None,
            },
            SocketDirection::Producing => {
                let std_socket =
                    std::net::UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
                std_socket.set_nonblocking(true)?;
                UdpEntry {
                    socket: Rc::new(UdpSocket::from_std(std_socket)?),
                    shared_port: None,
                    reader: None,
                }
            }
        };
        trace!(handle = handle.0, ?direction, %address, "UDP socket created");
        self.udp.insert(handle.0, entry);
        Ok(handle)
    }

    fn send_udp_data(
        &mut self,
        handle: UdpHandle,
        destination: SocketAddrV4,
        data: &[u8],
    ) -> io::Result<()> {
        let entry = self
            .udp
            .get(&handle.0)
            .ok_or_else(|| io::Error::other("unknown UDP handle"))?;
        entry
            .socket
            .try_send_to(data, destination.into())
            .map(|_| ())
    }

    fn close_udp_socket(&mut self, handle: UdpHandle) {
        if let Some(entry) = self.udp.remove(&handle.0) {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
            if let Some(port) = entry.shared_port {
                self.release_shared(port);
            }
        }
    }

    fn close_tcp_socket(&mut self, handle: TcpHandle) {
        debug!(handle = handle.0, "closing TCP session socket");
        self.forget_tcp(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a test body on a current-thread runtime inside a LocalSet,
    /// as the driver's spawn_local/reactor calls require.
    fn run_local(body: impl std::future::Future<Output = ()>) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, body);
    }

    fn driver() -> (TokioSocketDriver, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TokioSocketDriver::new(tx), rx)
    }

    #[test]
    fn test_consuming_sockets_share_one_bind_per_port() {
        run_local(async {
            let (mut driver, _rx) = driver();
            // port 0 -> the kernel picks; the shared map keys on the
            // requested port, so both handles land on one socket
            let address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

            let first = driver
                .create_udp_socket(SocketDirection::Consuming, address, 0)
                .unwrap();
            let second = driver
                .create_udp_socket(SocketDirection::Consuming, address, 0)
                .unwrap();
            assert_ne!(first, second);

            assert_eq!(driver.shared.len(), 1);
            assert_eq!(driver.shared[&0].users, 2);
            assert!(Rc::ptr_eq(
                &driver.udp[&first.0].socket,
                &driver.udp[&second.0].socket
            ));

            // closing one user keeps the socket alive
            driver.close_udp_socket(first);
            assert_eq!(driver.shared[&0].users, 1);
            assert!(driver.udp.contains_key(&second.0));

            // the last user takes the shared socket down with it
            driver.close_udp_socket(second);
            assert!(driver.shared.is_empty());
            assert!(driver.udp.is_empty());
        });
    }

    #[test]
    fn test_producing_socket_is_private() {
        run_local(async {
            let (mut driver, _rx) = driver();
            let destination = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0x08AE);

            let handle = driver
                .create_udp_socket(SocketDirection::Producing, destination, 0)
                .unwrap();
            assert!(driver.shared.is_empty());
            assert!(driver.udp[&handle.0].shared_port.is_none());

            // closing a producing handle never touches the shared table
            driver.close_udp_socket(handle);
            assert!(driver.shared.is_empty());
        });
    }

    #[test]
    fn test_registered_socket_bypasses_refcounting() {
        run_local(async {
            let (mut driver, _rx) = driver();

            let std_socket =
                std::net::UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
            std_socket.set_nonblocking(true).unwrap();
            let socket = Rc::new(UdpSocket::from_std(std_socket).unwrap());

            let encap = UdpHandle(0);
            driver.register_udp(encap, Rc::clone(&socket));
            assert!(driver.udp[&encap.0].shared_port.is_none());
            assert!(driver.shared.is_empty());

            // later handles never collide with the registered one
            let produced = driver
                .create_udp_socket(
                    SocketDirection::Producing,
                    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0x08AE),
                    0,
                )
                .unwrap();
            assert_ne!(produced, encap);

            // closing the registered handle skips release_shared
            driver.close_udp_socket(encap);
            assert!(driver.shared.is_empty());
            assert!(!driver.udp.contains_key(&encap.0));
        });
    }

    #[test]
    fn test_close_unknown_handle_is_ignored() {
        run_local(async {
            let (mut driver, _rx) = driver();
            driver.close_udp_socket(UdpHandle(99));
            assert!(driver.udp.is_empty());
            assert!(driver.shared.is_empty());
        });
    }
}
