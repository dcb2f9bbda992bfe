//! Connection manager: forward-open and forward-close services.

use bytes::BufMut;
use tracing::{debug, info};

use crate::app::AdapterApplication;
use crate::engine::{Engine, TIMER_TICK_MS};
use crate::socket::SocketDriver;

use super::connection::{
    ConnectionObject, ConnectionState, ConnectionTriad, ConnectionType, InstanceType,
    NetConnectionParameters, TransportClassTrigger, WatchdogAction,
};
use super::epath::{ConnectionPath, ConnectionPathContext, parse_connection_path};
use super::error::{ConnectionError, ExtendedStatus, GeneralStatus};
use super::router::{ExplicitContext, MessageRouterRequest, MessageRouterResponse};
use super::types::ClassCode;

/// Forward-open bytes before the connection path, standard form.
pub const FORWARD_OPEN_HEADER_LEN: usize = 36;

/// Forward-open bytes before the connection path, large form
/// (32-bit network connection parameters).
pub const LARGE_FORWARD_OPEN_HEADER_LEN: usize = 40;

/// The fixed-layout part of a (large) forward-open request.
#[derive(Debug, Clone)]
pub(crate) struct ForwardOpenRequest {
    pub priority_timetick: u8,
    pub timeout_ticks: u8,
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    pub triad: ConnectionTriad,
    pub timeout_multiplier: u8,
    pub o_to_t_rpi_us: u32,
    pub o_to_t_params: NetConnectionParameters,
    pub t_to_o_rpi_us: u32,
    pub t_to_o_params: NetConnectionParameters,
    pub trigger: TransportClassTrigger,
    pub path_words: u8,
}

impl ForwardOpenRequest {
    fn header_len(large: bool) -> usize {
        if large {
            LARGE_FORWARD_OPEN_HEADER_LEN
        } else {
            FORWARD_OPEN_HEADER_LEN
        }
    }

    /// Parse the fixed request header; returns the request and the
    /// connection path bytes.
    fn parse(data: &[u8], large: bool) -> Option<(Self, &[u8])> {
        if data.len() < Self::header_len(large) {
            return None;
        }
        let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };

        let mut off = 0;
        let priority_timetick = data[off];
        let timeout_ticks = data[off + 1];
        let o_to_t_connection_id = u32_at(off + 2);
        let t_to_o_connection_id = u32_at(off + 6);
        let triad = ConnectionTriad {
            connection_serial: u16_at(off + 10),
            originator_vendor_id: u16_at(off + 12),
            originator_serial: u32_at(off + 14),
        };
        let timeout_multiplier = data[off + 18];
        // 3 reserved bytes
        off += 22;

        let o_to_t_rpi_us = u32_at(off);
        off += 4;
        let o_to_t_params = if large {
            let params = NetConnectionParameters::from_raw32(u32_at(off));
            off += 4;
            params
        } else {
            let params = NetConnectionParameters::from_raw16(u16_at(off));
            off += 2;
            params
        };
        let t_to_o_rpi_us = u32_at(off);
        off += 4;
        let t_to_o_params = if large {
            let params = NetConnectionParameters::from_raw32(u32_at(off));
            off += 4;
            params
        } else {
            let params = NetConnectionParameters::from_raw16(u16_at(off));
            off += 2;
            params
        };
        let trigger = TransportClassTrigger(data[off]);
        let path_words = data[off + 1];
        off += 2;

        Some((
            Self {
                priority_timetick,
                timeout_ticks,
                o_to_t_connection_id,
                t_to_o_connection_id,
                triad,
                timeout_multiplier,
                o_to_t_rpi_us,
                o_to_t_params,
                t_to_o_rpi_us,
                t_to_o_params,
                trigger,
                path_words,
            },
            &data[off..],
        ))
    }
}

/// Round a requested packet interval up to a timer-tick multiple.
fn round_rpi_to_tick(rpi_us: u32) -> u32 {
    let tick_us = (TIMER_TICK_MS * 1000) as u32;
    match rpi_us % tick_us {
        0 => rpi_us,
        rem => rpi_us - rem + tick_us,
    }
}

/// Forward-open failure body: triad, remaining path size, reserved.
fn open_failure_body(triad: &ConnectionTriad) -> Vec<u8> {
    let mut data = Vec::with_capacity(10);
    data.put_u16_le(triad.connection_serial);
    data.put_u16_le(triad.originator_vendor_id);
    data.put_u32_le(triad.originator_serial);
    data.put_u8(0); // remaining path size
    data.put_u8(0); // reserved
    data
}

fn open_failure_response(
    service: u8,
    triad: &ConnectionTriad,
    error: ConnectionError,
) -> MessageRouterResponse {
    MessageRouterResponse {
        reply_service: super::types::REPLY_SERVICE_FLAG | service,
        general_status: error.general,
        additional_status: vec![error.extended],
        data: open_failure_body(triad),
    }
}

impl<D: SocketDriver, A: AdapterApplication> Engine<D, A> {
    /// ForwardOpen / LargeForwardOpen service handler.
    pub(crate) fn forward_open(
        &mut self,
        request: &MessageRouterRequest<'_>,
        ctx: &mut ExplicitContext,
        large: bool,
    ) -> MessageRouterResponse {
        let Some((open, path_bytes)) = ForwardOpenRequest::parse(request.data, large) else {
            return MessageRouterResponse::error(request.service, GeneralStatus::NOT_ENOUGH_DATA);
        };
        info!(
            serial = format_args!("{:#06x}", open.triad.connection_serial),
            vendor = open.triad.originator_vendor_id,
            originator_serial = format_args!("{:#010x}", open.triad.originator_serial),
            large,
            "forward open"
        );

        // Duplicate triad: the connection is already in use. A request
        // with zeroed connection ids would be a reconfiguration, which
        // this target does not support either.
        if self
            .connections
            .find_established_by_triad(&open.triad)
            .is_some()
        {
            if open.o_to_t_connection_id == 0 && open.t_to_o_connection_id == 0 {
                debug!("duplicate forward open with null connection ids (reconfiguration)");
            }
            return open_failure_response(
                request.service,
                &open.triad,
                ConnectionError::failure(ExtendedStatus::CONNECTION_IN_USE),
            );
        }

        // Reserved connection type bits.
        if open.o_to_t_params.connection_type == ConnectionType::Reserved
            || open.t_to_o_params.connection_type == ConnectionType::Reserved
        {
            return open_failure_response(
                request.service,
                &open.triad,
                ConnectionError::failure(ExtendedStatus::INVALID_CONNECTION_TYPE),
            );
        }

        if open.trigger.reserved_trigger_bit() {
            return open_failure_response(
                request.service,
                &open.triad,
                ConnectionError::failure(ExtendedStatus::TRANSPORT_TRIGGER_NOT_SUPPORTED),
            );
        }

        // The path size must agree with the request length.
        let expected = ForwardOpenRequest::header_len(large) + open.path_words as usize * 2;
        if request.data.len() > expected {
            return open_failure_response(
                request.service,
                &open.triad,
                ConnectionError::general(GeneralStatus::TOO_MUCH_DATA),
            );
        }
        if request.data.len() < expected {
            return open_failure_response(
                request.service,
                &open.triad,
                ConnectionError::general(GeneralStatus::NOT_ENOUGH_DATA),
            );
        }

        let path = {
            let path_cx = ConnectionPathContext {
                registry: &self.registry,
                identity: &self.config.identity,
                trigger: open.trigger,
                o_to_t_type: open.o_to_t_params.connection_type,
                t_to_o_type: open.t_to_o_params.connection_type,
            };
            match parse_connection_path(open.path_words, path_bytes, &path_cx) {
                Ok(path) => path,
                Err(error) => {
                    return open_failure_response(request.service, &open.triad, error);
                }
            }
        };

        let result = if open.trigger.is_class_3() {
            self.establish_class3(&open, &path, ctx)
        } else if path.class_id == ClassCode::ASSEMBLY {
            self.establish_io(&open, &path, ctx)
        } else {
            // Only the message router (class 3) and assemblies (I/O)
            // accept connections.
            Err(ConnectionError::failure(
                ExtendedStatus::INVALID_CONNECTION_POINT,
            ))
        };

        match result {
            Ok(key) => {
                debug!(key, "connection established");
                let connection = self.connections.get(key).expect("just inserted");
                let mut data = Vec::with_capacity(26);
                data.put_u32_le(connection.consumed_connection_id);
                data.put_u32_le(connection.produced_connection_id);
                data.put_u16_le(connection.triad.connection_serial);
                data.put_u16_le(connection.triad.originator_vendor_id);
                data.put_u32_le(connection.triad.originator_serial);
                data.put_u32_le(connection.o_to_t_rpi_us); // actual O->T API
                data.put_u32_le(connection.t_to_o_rpi_us); // actual T->O API
                data.put_u8(0); // application reply size
                data.put_u8(0); // reserved
                MessageRouterResponse::success(request.service, data)
            }
            Err(error) => {
                info!(
                    general = format_args!("{:#04x}", error.general),
                    extended = format_args!("{:#06x}", error.extended),
                    "forward open failed"
                );
                open_failure_response(request.service, &open.triad, error)
            }
        }
    }

    /// ForwardClose service handler: match by triad only (connection
    /// ids may have been reused by the originator).
    pub(crate) fn forward_close(
        &mut self,
        request: &MessageRouterRequest<'_>,
    ) -> MessageRouterResponse {
        if request.data.len() < 12 {
            return MessageRouterResponse::error(request.service, GeneralStatus::NOT_ENOUGH_DATA);
        }
        // priority/time-tick and timeout ticks are ignored
        let triad = ConnectionTriad {
            connection_serial: u16::from_le_bytes([request.data[2], request.data[3]]),
            originator_vendor_id: u16::from_le_bytes([request.data[4], request.data[5]]),
            originator_serial: u32::from_le_bytes([
                request.data[6],
                request.data[7],
                request.data[8],
                request.data[9],
            ]),
        };
        let path_words = request.data[10];

        info!(
            serial = format_args!("{:#06x}", triad.connection_serial),
            "forward close"
        );

        let mut data = Vec::with_capacity(10);
        data.put_u16_le(triad.connection_serial);
        data.put_u16_le(triad.originator_vendor_id);
        data.put_u32_le(triad.originator_serial);

        match self.connections.find_closable_by_triad(&triad) {
            Some(key) => {
                self.close_connection(key);
                data.put_u8(0); // application reply size
                data.put_u8(0); // reserved
                MessageRouterResponse::success(request.service, data)
            }
            None => {
                data.put_u8(path_words); // remaining path size
                data.put_u8(0); // reserved
                MessageRouterResponse {
                    reply_service: super::types::REPLY_SERVICE_FLAG | request.service,
                    general_status: GeneralStatus::CONNECTION_FAILURE,
                    additional_status: vec![ExtendedStatus::CONNECTION_NOT_FOUND],
                    data,
                }
            }
        }
    }

    /// Generate a connection id from the incarnation id and the
    /// 16-bit connection counter, retrying on collision with any live
    /// connection id.
    pub(crate) fn next_connection_id(&mut self) -> u32 {
        loop {
            self.connection_counter = self.connection_counter.wrapping_add(1);
            let id = self.incarnation_id | self.connection_counter as u32;
            if !self.connections.connection_id_in_use(id) {
                return id;
            }
        }
    }

    /// Shared connection setup after a validated forward open.
    fn general_connection_configuration(&mut self, connection: &mut ConnectionObject) {
        if connection.o_to_t_params.is_point_to_point() {
            // O->T point-to-point: the target picks the id it consumes on.
            connection.consumed_connection_id = self.next_connection_id();
        }
        if connection.t_to_o_params.is_multicast() {
            // T->O multicast: the target picks the id it produces on.
            connection.produced_connection_id = self.next_connection_id();
        }

        connection.eip_sequence_producing = 0;
        connection.eip_sequence_consuming = None;
        connection.sequence_count_producing = 0;
        connection.sequence_count_consuming = None;

        connection.watchdog_action = WatchdogAction::AutoDelete;
        connection.expected_packet_rate_ms = 0;

        if connection.trigger.is_server() {
            connection.expected_packet_rate_ms = (connection.o_to_t_rpi_us / 1000) as i64;
        } else {
            connection.expected_packet_rate_ms = (connection.t_to_o_rpi_us / 1000) as i64;
            // produce on the next tick
            connection.transmission_trigger_timer = 0;
        }

        connection.production_inhibit_timer = 0;
        connection.consumed_size = connection.o_to_t_params.size;
        connection.produced_size = connection.t_to_o_params.size;
        connection.arm_initial_watchdog();
    }

    /// Build the connection object common to class-3 and I/O opens.
    pub(crate) fn connection_from_request(
        &mut self,
        open: &ForwardOpenRequest,
        path: &ConnectionPath,
    ) -> ConnectionObject {
        let mut connection = ConnectionObject {
            state: ConnectionState::Configuring,
            trigger: open.trigger,
            triad: open.triad,
            priority_timetick: open.priority_timetick,
            timeout_ticks: open.timeout_ticks,
            timeout_multiplier: open.timeout_multiplier,
            consumed_connection_id: open.o_to_t_connection_id,
            produced_connection_id: open.t_to_o_connection_id,
            o_to_t_rpi_us: open.o_to_t_rpi_us,
            t_to_o_rpi_us: round_rpi_to_tick(open.t_to_o_rpi_us),
            o_to_t_params: open.o_to_t_params,
            t_to_o_params: open.t_to_o_params,
            class_id: path.class_id,
            connection_points: path.connection_points,
            production_inhibit_time_ms: path.production_inhibit_ms.unwrap_or(0),
            ..Default::default()
        };
        self.general_connection_configuration(&mut connection);
        connection
    }

    /// Establish a class-3 explicit messaging connection over the
    /// originating encapsulation session. No UDP endpoints.
    fn establish_class3(
        &mut self,
        open: &ForwardOpenRequest,
        path: &ConnectionPath,
        ctx: &ExplicitContext,
    ) -> Result<usize, ConnectionError> {
        let mut connection = self.connection_from_request(open, path);
        connection.instance_type = InstanceType::ExplicitMessaging;
        connection.watchdog_action = WatchdogAction::AutoDelete;
        connection.associated_session = Some(ctx.session);
        connection.originator_address = Some(ctx.originator);
        connection.state = ConnectionState::Established;
        Ok(self.connections.insert(connection))
    }

    /// Close every class-3 connection bound to an encapsulation
    /// session that went away.
    pub(crate) fn close_class3_for_session(&mut self, session_handle: u32) {
        let keys: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                c.trigger.is_class_3() && c.associated_session == Some(session_handle)
            })
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            debug!(key, session = session_handle, "closing class-3 connection with session");
            self.close_connection(key);
        }
    }

    /// Close a connection of any kind.
    pub(crate) fn close_connection(&mut self, key: usize) {
        let Some(connection) = self.connections.get(key) else {
            return;
        };
        if connection.instance_type.is_io() {
            self.close_io_connection(key);
        } else {
            self.connections.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_rpi_to_tick() {
        assert_eq!(round_rpi_to_tick(10_000), 10_000);
        assert_eq!(round_rpi_to_tick(10_001), 20_000);
        assert_eq!(round_rpi_to_tick(9_999), 10_000);
        assert_eq!(round_rpi_to_tick(25_000), 30_000);
        assert_eq!(round_rpi_to_tick(0), 0);
    }

    #[test]
    fn test_forward_open_request_parse() {
        let mut data = Vec::new();
        data.put_u8(0x07); // priority/time tick
        data.put_u8(0xE9); // timeout ticks
        data.put_u32_le(0); // O->T id
        data.put_u32_le(0xAABBCCDD); // T->O id
        data.put_u16_le(0x1234); // serial
        data.put_u16_le(0x0042); // vendor
        data.put_u32_le(0xDEADBEEF); // originator serial
        data.put_u8(0); // timeout multiplier
        data.put_slice(&[0, 0, 0]); // reserved
        data.put_u32_le(10_000); // O->T RPI
        data.put_u16_le(0x4004); // O->T params: P2P size 4
        data.put_u32_le(20_000); // T->O RPI
        data.put_u16_le(0x2008); // T->O params: multicast size 8
        data.put_u8(0x01); // trigger: class 1, cyclic, client
        data.put_u8(4); // path words
        data.put_slice(&[0x20, 0x04, 0x24, 151, 0x2C, 150, 0x2C, 100]);

        let (open, path) = ForwardOpenRequest::parse(&data, false).unwrap();
        assert_eq!(open.triad.connection_serial, 0x1234);
        assert_eq!(open.triad.originator_vendor_id, 0x0042);
        assert_eq!(open.triad.originator_serial, 0xDEADBEEF);
        assert_eq!(open.o_to_t_rpi_us, 10_000);
        assert_eq!(open.t_to_o_rpi_us, 20_000);
        assert!(open.o_to_t_params.is_point_to_point());
        assert_eq!(open.o_to_t_params.size, 4);
        assert!(open.t_to_o_params.is_multicast());
        assert_eq!(open.path_words, 4);
        assert_eq!(path.len(), 8);
    }

    #[test]
    fn test_large_forward_open_request_parse() {
        let mut data = Vec::new();
        data.put_u8(0x07);
        data.put_u8(0xE9);
        data.put_u32_le(0);
        data.put_u32_le(0);
        data.put_u16_le(1);
        data.put_u16_le(2);
        data.put_u32_le(3);
        data.put_u8(1);
        data.put_slice(&[0, 0, 0]);
        data.put_u32_le(50_000);
        data.put_u32_le(0x4000_0400); // P2P size 1024
        data.put_u32_le(50_000);
        data.put_u32_le(0x2000_0200); // multicast size 512
        data.put_u8(0x01);
        data.put_u8(0);

        let (open, path) = ForwardOpenRequest::parse(&data, true).unwrap();
        assert_eq!(open.o_to_t_params.size, 1024);
        assert_eq!(open.t_to_o_params.size, 512);
        assert!(path.is_empty());
    }

    #[test]
    fn test_short_forward_open_rejected() {
        assert!(ForwardOpenRequest::parse(&[0u8; 35], false).is_none());
        assert!(ForwardOpenRequest::parse(&[0u8; 39], true).is_none());
    }
}
