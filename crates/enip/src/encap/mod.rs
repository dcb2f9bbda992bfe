//! Encapsulation session layer: framing, session registration and the
//! command dispatch feeding the CIP layer.

pub mod cpf;

use bytes::BufMut;
use rand::Rng;
use std::net::SocketAddrV4;
use tracing::{debug, info, trace, warn};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::app::AdapterApplication;
use crate::cip::error::EncapStatus;
use crate::engine::Engine;
use crate::socket::{SocketDriver, TcpHandle, UdpHandle};

use cpf::{AddressItem, CpfPacket, ItemId};

/// Size of the encapsulation header.
pub const ENCAP_HEADER_LEN: usize = 24;

/// Supported encapsulation protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Number of TCP session slots.
pub const SUPPORTED_SESSIONS: usize = 20;

/// Slots for deferred UDP ListIdentity replies (the protocol demands
/// at least two).
pub const SUPPORTED_DELAYED_MESSAGES: usize = 2;

/// Default ListIdentity response delay ceiling in milliseconds.
pub const LIST_IDENTITY_DEFAULT_DELAY_MS: u16 = 2000;

/// Requested delays below this are clamped up to it.
pub const LIST_IDENTITY_MINIMUM_DELAY_MS: u16 = 500;

/// Capability flags advertised by ListServices.
const CAPABILITY_TCP: u16 = 0x0020;
const CAPABILITY_UDP_CLASS_0_1: u16 = 0x0100;

/// Encapsulation header (little-endian on the wire).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EncapHeader {
    pub command: U16,
    /// Length of the command-specific payload.
    pub length: U16,
    pub session_handle: U32,
    pub status: U32,
    pub sender_context: [u8; 8],
    pub options: U32,
}

impl EncapHeader {
    /// Parse a header from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> crate::cip::error::Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(header, _)| header)
            .map_err(|_| crate::cip::error::Error::Truncated {
                expected: ENCAP_HEADER_LEN,
                actual: data.len(),
            })
    }

    /// Header bytes for transmission.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }
}

/// Known encapsulation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapCommand {
    /// Only allowed on TCP; no reply.
    Nop,
    /// Allowed on both UDP and TCP.
    ListServices,
    /// Allowed on both UDP and TCP.
    ListIdentity,
    /// Allowed on both UDP and TCP.
    ListInterfaces,
    /// Only allowed on TCP.
    RegisterSession,
    /// Only allowed on TCP.
    UnregisterSession,
    /// Only allowed on TCP.
    SendRrData,
    /// Only allowed on TCP.
    SendUnitData,
    /// Anything else; answered with InvalidCommand.
    Unknown(u16),
}

impl EncapCommand {
    /// Decode the command code of an encapsulation header.
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Self::Nop,
            0x0004 => Self::ListServices,
            0x0063 => Self::ListIdentity,
            0x0064 => Self::ListInterfaces,
            0x0065 => Self::RegisterSession,
            0x0066 => Self::UnregisterSession,
            0x006F => Self::SendRrData,
            0x0070 => Self::SendUnitData,
            other => Self::Unknown(other),
        }
    }

    /// The wire code.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Nop => 0x0000,
            Self::ListServices => 0x0004,
            Self::ListIdentity => 0x0063,
            Self::ListInterfaces => 0x0064,
            Self::RegisterSession => 0x0065,
            Self::UnregisterSession => 0x0066,
            Self::SendRrData => 0x006F,
            Self::SendUnitData => 0x0070,
            Self::Unknown(other) => other,
        }
    }
}

/// The TCP session slot table. Handle = slot index + 1.
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Option<TcpHandle>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Register a socket in a free slot, returning the session handle.
    pub fn register(&mut self, socket: TcpHandle) -> Option<u32> {
        let free = self.slots.iter().position(Option::is_none)?;
        self.slots[free] = Some(socket);
        Some(free as u32 + 1)
    }

    /// The session handle a socket is registered under, if any.
    pub fn find_by_socket(&self, socket: TcpHandle) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| *s == Some(socket))
            .map(|i| i as u32 + 1)
    }

    /// Whether the handle names a registered session.
    pub fn is_valid(&self, handle: u32) -> bool {
        self.socket_of(handle).is_some()
    }

    /// The socket bound to a session handle.
    pub fn socket_of(&self, handle: u32) -> Option<TcpHandle> {
        if handle == 0 {
            return None;
        }
        self.slots.get(handle as usize - 1).copied().flatten()
    }

    /// Clear a slot, returning the socket that was bound to it.
    pub fn unregister(&mut self, handle: u32) -> Option<TcpHandle> {
        if handle == 0 {
            return None;
        }
        self.slots.get_mut(handle as usize - 1)?.take()
    }

    /// Iterate registered (handle, socket) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, TcpHandle)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|socket| (i as u32 + 1, socket)))
    }
}

/// A ListIdentity reply waiting out its random delay.
#[derive(Debug)]
pub(crate) struct DelayedListIdentity {
    pub timeout_ms: i64,
    pub socket: UdpHandle,
    pub receiver: SocketAddrV4,
    pub message: Vec<u8>,
}

/// Build a reply frame echoing the request header.
fn encap_reply(request: &EncapHeader, session: u32, status: u32, payload: &[u8]) -> Vec<u8> {
    let header = EncapHeader {
        command: request.command,
        length: U16::new(payload.len() as u16),
        session_handle: U32::new(session),
        status: U32::new(status),
        sender_context: request.sender_context,
        options: request.options,
    };
    let mut buf = Vec::with_capacity(ENCAP_HEADER_LEN + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

impl<D: SocketDriver, A: AdapterApplication> Engine<D, A> {
    /// Handle one framed encapsulation request received on TCP.
    ///
    /// Returns the reply bytes, or `None` when the command produces no
    /// reply (NoOperation, successful UnregisterSession) or the frame
    /// is dropped as malformed.
    pub fn handle_explicit_tcp_data(
        &mut self,
        socket: TcpHandle,
        data: &[u8],
        originator: SocketAddrV4,
    ) -> Option<Vec<u8>> {
        trace!(socket = socket.0, len = data.len(), "explicit TCP data");
        let (header, payload) = self.parse_frame(data)?;
        let session = header.session_handle.get();

        match EncapCommand::from_u16(header.command.get()) {
            EncapCommand::Nop => {
                trace!("NOP");
                None
            }
            EncapCommand::ListServices => {
                debug!("list services");
                let payload = self.list_services_payload();
                Some(encap_reply(&header, session, EncapStatus::SUCCESS, &payload))
            }
            EncapCommand::ListIdentity => {
                debug!("list identity");
                let payload = self.list_identity_payload();
                Some(encap_reply(&header, session, EncapStatus::SUCCESS, &payload))
            }
            EncapCommand::ListInterfaces => {
                debug!("list interfaces");
                Some(encap_reply(&header, session, EncapStatus::SUCCESS, &[0, 0]))
            }
            EncapCommand::RegisterSession => {
                debug!(socket = socket.0, "register session");
                let (session, status, payload) = self.register_session(socket, &payload);
                Some(encap_reply(&header, session, status, &payload))
            }
            EncapCommand::UnregisterSession => {
                info!(session, "unregister session");
                if self.sessions.is_valid(session) {
                    self.teardown_session(session, true);
                    None
                } else {
                    Some(encap_reply(
                        &header,
                        session,
                        EncapStatus::INVALID_SESSION_HANDLE,
                        &[],
                    ))
                }
            }
            EncapCommand::SendRrData => {
                debug!("send RR data");
                let (status, reply) = self.send_rr_data(&header, &payload, originator);
                reply.map(|body| encap_reply(&header, session, status, &body))
            }
            EncapCommand::SendUnitData => {
                debug!("send unit data");
                let (status, reply) = self.send_unit_data(&header, &payload, originator);
                reply.map(|body| encap_reply(&header, session, status, &body))
            }
            EncapCommand::Unknown(other) => {
                warn!(command = other, "unknown encapsulation command");
                Some(encap_reply(
                    &header,
                    session,
                    EncapStatus::INVALID_COMMAND,
                    &[],
                ))
            }
        }
    }

    /// Handle one encapsulation request received on UDP.
    ///
    /// A broadcast ListIdentity is deferred into the delay queue and
    /// answered from the tick loop; everything else answers (or is
    /// refused) immediately.
    pub fn handle_explicit_udp_data(
        &mut self,
        socket: UdpHandle,
        originator: SocketAddrV4,
        data: &[u8],
        unicast: bool,
    ) -> Option<Vec<u8>> {
        trace!(socket = socket.0, len = data.len(), unicast, "explicit UDP data");
        let (header, _payload) = self.parse_frame(data)?;
        let session = header.session_handle.get();

        match EncapCommand::from_u16(header.command.get()) {
            EncapCommand::ListServices => {
                let payload = self.list_services_payload();
                Some(encap_reply(&header, session, EncapStatus::SUCCESS, &payload))
            }
            EncapCommand::ListIdentity => {
                if unicast {
                    let payload = self.list_identity_payload();
                    Some(encap_reply(&header, session, EncapStatus::SUCCESS, &payload))
                } else {
                    self.enqueue_delayed_list_identity(socket, originator, &header);
                    None
                }
            }
            EncapCommand::ListInterfaces => {
                Some(encap_reply(&header, session, EncapStatus::SUCCESS, &[0, 0]))
            }
            other => {
                // NOP, session and data transfer commands are TCP-only.
                debug!(command = other.as_u16(), "command not allowed on UDP");
                Some(encap_reply(
                    &header,
                    session,
                    EncapStatus::INVALID_COMMAND,
                    &[],
                ))
            }
        }
    }

    /// The peer closed its TCP socket: tear the session down without
    /// replying or closing (the driver already lost the socket).
    pub fn on_tcp_close(&mut self, socket: TcpHandle) {
        if let Some(handle) = self.sessions.find_by_socket(socket) {
            info!(session = handle, "TCP peer closed, removing session");
            self.sessions.unregister(handle);
            self.close_class3_for_session(handle);
        }
    }

    /// Strip and validate the encapsulation header.
    fn parse_frame(&self, data: &[u8]) -> Option<(EncapHeader, Vec<u8>)> {
        let header = match EncapHeader::from_bytes(data) {
            Ok(header) => *header,
            Err(_) => {
                trace!(len = data.len(), "short encapsulation frame dropped");
                return None;
            }
        };
        if header.options.get() != 0 {
            trace!(options = header.options.get(), "nonzero options, frame dropped");
            return None;
        }
        let declared = header.length.get() as usize;
        let payload = &data[ENCAP_HEADER_LEN..];
        if payload.len() < declared {
            trace!(
                declared,
                actual = payload.len(),
                "encapsulation payload fragment dropped"
            );
            return None;
        }
        Some((header, payload[..declared].to_vec()))
    }

    /// RegisterSession: validate version/options, allocate a slot.
    fn register_session(&mut self, socket: TcpHandle, payload: &[u8]) -> (u32, u32, Vec<u8>) {
        if payload.len() < 4 {
            return (0, EncapStatus::INVALID_LENGTH, Vec::new());
        }
        let version = u16::from_le_bytes([payload[0], payload[1]]);
        let options = u16::from_le_bytes([payload[2], payload[3]]);
        let echo = payload[..4].to_vec();

        if version == 0 || version > PROTOCOL_VERSION || options != 0 {
            warn!(version, options, "unsupported registration parameters");
            return (0, EncapStatus::UNSUPPORTED_PROTOCOL, echo);
        }

        if let Some(existing) = self.sessions.find_by_socket(socket) {
            // A second register on the same socket is refused; the
            // already-assigned handle is reported back.
            warn!(socket = socket.0, session = existing, "session already registered");
            return (existing, EncapStatus::INVALID_COMMAND, echo);
        }

        match self.sessions.register(socket) {
            Some(handle) => {
                info!(socket = socket.0, session = handle, "session registered");
                (handle, EncapStatus::SUCCESS, echo)
            }
            None => {
                warn!("session table full");
                (0, EncapStatus::INSUFFICIENT_MEMORY, echo)
            }
        }
    }

    /// Close a session slot, optionally the socket under it, and every
    /// class-3 connection that referenced it.
    pub(crate) fn teardown_session(&mut self, handle: u32, close_socket: bool) {
        if let Some(socket) = self.sessions.unregister(handle) {
            if close_socket {
                self.sockets.close_tcp_socket(socket);
            }
            self.close_class3_for_session(handle);
        }
    }

    /// SendRRData: unconnected explicit messaging.
    fn send_rr_data(
        &mut self,
        header: &EncapHeader,
        payload: &[u8],
        originator: SocketAddrV4,
    ) -> (u32, Option<Vec<u8>>) {
        if payload.len() < 6 {
            return (EncapStatus::INVALID_LENGTH, Some(Vec::new()));
        }
        let session = header.session_handle.get();
        if !self.sessions.is_valid(session) {
            return (EncapStatus::INVALID_SESSION_HANDLE, Some(Vec::new()));
        }

        // Interface handle and timeout are not used.
        let packet = match CpfPacket::decode(&payload[6..]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "SendRRData with malformed CPF frame");
                return (EncapStatus::SUCCESS, None);
            }
        };
        let request = match (packet.address, packet.data) {
            (AddressItem::Null, Some((type_id, request)))
                if type_id == ItemId::UNCONNECTED_DATA =>
            {
                request.to_vec()
            }
            _ => {
                warn!("SendRRData without null address / unconnected data item");
                return (EncapStatus::INCORRECT_DATA, Some(Vec::new()));
            }
        };
        let mut ctx = crate::cip::router::ExplicitContext::new(originator, session);
        ctx.request_sockaddr = packet.sockaddr_info;
        let response = self.route_request(&request, &mut ctx);

        let mut body = Vec::new();
        response.encode(&mut body);
        let reply = CpfPacket {
            address: AddressItem::Null,
            data: Some((ItemId::UNCONNECTED_DATA, &body)),
            sockaddr_info: ctx.sockaddr_reply,
        };
        (EncapStatus::SUCCESS, Some(reply.encode(true)))
    }

    /// SendUnitData: connected (class-3) explicit messaging.
    fn send_unit_data(
        &mut self,
        header: &EncapHeader,
        payload: &[u8],
        originator: SocketAddrV4,
    ) -> (u32, Option<Vec<u8>>) {
        if payload.len() < 6 {
            return (EncapStatus::INVALID_LENGTH, Some(Vec::new()));
        }
        let session = header.session_handle.get();
        if !self.sessions.is_valid(session) {
            return (EncapStatus::INVALID_SESSION_HANDLE, Some(Vec::new()));
        }

        let packet = match CpfPacket::decode(&payload[6..]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "SendUnitData with malformed CPF frame");
                return (EncapStatus::SUCCESS, None);
            }
        };
        let (connection_id, item) = match (packet.address, packet.data) {
            (AddressItem::Connection { connection_id }, Some((type_id, item)))
                if type_id == ItemId::CONNECTED_DATA =>
            {
                (connection_id, item)
            }
            _ => {
                warn!("SendUnitData without connection address / connected data item");
                return (EncapStatus::SUCCESS, None);
            }
        };
        if item.len() < 2 {
            return (EncapStatus::INVALID_LENGTH, Some(Vec::new()));
        }

        let Some(key) = self.connections.find_by_consumed_id(connection_id) else {
            warn!(connection_id, "SendUnitData for unknown connection");
            return (EncapStatus::SUCCESS, None);
        };

        let sequence = u16::from_le_bytes([item[0], item[1]]);
        let request = item[2..].to_vec();

        let produced_id = {
            let connection = self.connections.get_mut(key).expect("key from lookup");
            connection.reset_watchdog();
            connection.produced_connection_id
        };

        let mut ctx = crate::cip::router::ExplicitContext::new(originator, session);
        let response = self.route_request(&request, &mut ctx);

        let mut body = Vec::with_capacity(2 + 16);
        body.put_u16_le(sequence);
        response.encode(&mut body);
        let reply = CpfPacket {
            address: AddressItem::Connection {
                connection_id: produced_id,
            },
            data: Some((ItemId::CONNECTED_DATA, &body)),
            sockaddr_info: [None, None],
        };
        (EncapStatus::SUCCESS, Some(reply.encode(true)))
    }

    /// ListServices reply payload: one item describing the
    /// encapsulation version and transport capabilities.
    fn list_services_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u16_le(1); // item count
        buf.put_u16_le(ItemId::LIST_SERVICES_RESPONSE);
        buf.put_u16_le(20); // version + flags + name
        buf.put_u16_le(PROTOCOL_VERSION);
        buf.put_u16_le(CAPABILITY_TCP | CAPABILITY_UDP_CLASS_0_1);
        let mut name = [0u8; 16];
        name[..14].copy_from_slice(b"Communications");
        buf.put_slice(&name);
        buf
    }

    /// ListIdentity reply payload: one item with the identity data.
    fn list_identity_payload(&self) -> Vec<u8> {
        let identity = &self.config.identity;
        let mut item = Vec::new();
        item.put_u16_le(PROTOCOL_VERSION);
        // sockaddr image of the encapsulation endpoint
        item.put_u16(2); // AF_INET
        item.put_u16(self.config.encapsulation_port);
        item.put_slice(&self.config.ip_address.octets());
        item.put_slice(&[0u8; 8]);
        item.put_u16_le(identity.vendor_id);
        item.put_u16_le(identity.device_type);
        item.put_u16_le(identity.product_code);
        item.put_u8(identity.revision.major);
        item.put_u8(identity.revision.minor);
        item.put_u16_le(identity.status);
        item.put_u32_le(identity.serial_number);
        item.put_u8(identity.product_name.len() as u8);
        item.put_slice(identity.product_name.as_bytes());
        item.put_u8(0xFF); // state

        let mut buf = Vec::with_capacity(6 + item.len());
        buf.put_u16_le(1); // item count
        buf.put_u16_le(ItemId::LIST_IDENTITY_RESPONSE);
        buf.put_u16_le(item.len() as u16);
        buf.put_slice(&item);
        buf
    }

    /// Defer a broadcast ListIdentity reply by a random interval.
    fn enqueue_delayed_list_identity(
        &mut self,
        socket: UdpHandle,
        receiver: SocketAddrV4,
        header: &EncapHeader,
    ) {
        let Some(slot) = self.delayed_identity.iter().position(Option::is_none) else {
            debug!("delayed ListIdentity queue full, dropping request");
            return;
        };

        let mut max_delay =
            u16::from_le_bytes([header.sender_context[0], header.sender_context[1]]);
        if max_delay == 0 {
            max_delay = LIST_IDENTITY_DEFAULT_DELAY_MS;
        } else if max_delay < LIST_IDENTITY_MINIMUM_DELAY_MS {
            max_delay = LIST_IDENTITY_MINIMUM_DELAY_MS;
        }
        let delay = self.rng.gen_range(0..=max_delay) as i64;

        let payload = self.list_identity_payload();
        let message = encap_reply(
            header,
            header.session_handle.get(),
            EncapStatus::SUCCESS,
            &payload,
        );
        debug!(delay_ms = delay, "deferring ListIdentity reply");
        self.delayed_identity[slot] = Some(DelayedListIdentity {
            timeout_ms: delay,
            socket,
            receiver,
            message,
        });
    }

    /// Fire expired deferred ListIdentity replies. Called every tick.
    pub(crate) fn manage_delayed_messages(&mut self, elapsed_ms: i64) {
        for slot in self.delayed_identity.iter_mut() {
            let fire = match slot {
                Some(delayed) => {
                    delayed.timeout_ms -= elapsed_ms;
                    delayed.timeout_ms <= 0
                }
                None => false,
            };
            if fire {
                let delayed = slot.take().expect("checked above");
                if let Err(e) = self.sockets.send_udp_data(
                    delayed.socket,
                    delayed.receiver,
                    &delayed.message,
                ) {
                    warn!(error = %e, "failed to send deferred ListIdentity reply");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = EncapHeader {
            command: U16::new(EncapCommand::RegisterSession.as_u16()),
            length: U16::new(4),
            session_handle: U32::new(7),
            status: U32::new(0),
            sender_context: *b"context!",
            options: U32::new(0),
        };
        let bytes = header.as_bytes().to_vec();
        assert_eq!(bytes.len(), ENCAP_HEADER_LEN);
        let parsed = EncapHeader::from_bytes(&bytes).unwrap();
        assert_eq!(
            EncapCommand::from_u16(parsed.command.get()),
            EncapCommand::RegisterSession
        );
        assert_eq!(parsed.session_handle.get(), 7);
        assert_eq!(&parsed.sender_context, b"context!");
    }

    #[test]
    fn test_header_layout_little_endian() {
        let header = EncapHeader {
            command: U16::new(0x0065),
            length: U16::new(0x0102),
            ..Default::default()
        };
        let bytes = header.as_bytes();
        assert_eq!(&bytes[..4], &[0x65, 0x00, 0x02, 0x01]);
    }

    #[test]
    fn test_session_table_handles_are_slot_plus_one() {
        let mut table = SessionTable::new(2);
        assert_eq!(table.register(TcpHandle(9)), Some(1));
        assert_eq!(table.register(TcpHandle(11)), Some(2));
        assert_eq!(table.register(TcpHandle(12)), None); // full
        assert_eq!(table.find_by_socket(TcpHandle(11)), Some(2));
        assert!(table.is_valid(1));
        assert!(!table.is_valid(0));
        assert!(!table.is_valid(3));

        assert_eq!(table.unregister(1), Some(TcpHandle(9)));
        assert!(!table.is_valid(1));
        // slot is free again
        assert_eq!(table.register(TcpHandle(13)), Some(1));
    }
}
