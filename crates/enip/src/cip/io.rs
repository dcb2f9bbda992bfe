//! I/O connection engine: UDP endpoint setup, produced/consumed data
//! paths and multicast production ownership.

use bytes::BufMut;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, info, trace, warn};

use crate::app::{AdapterApplication, IoConnectionEvent};
use crate::encap::cpf::{AddressItem, CpfPacket, ItemId, SockaddrDirection, SockaddrInfo};
use crate::engine::Engine;
use crate::socket::{SocketDirection, SocketDriver};

use super::appconn::{
    connections_for_input_with_type, connection_with_same_config_point_exists,
    existing_producing_multicast, next_non_controlling_master,
};
use super::connection::{
    ConnectionObject, ConnectionState, ConnectionType, InstanceType, WatchdogAction,
};
use super::epath::ConnectionPath;
use super::error::{ConnectionError, ExtendedStatus};
use super::manager::ForwardOpenRequest;
use super::router::ExplicitContext;
use super::types::{CipValue, ClassCode};

impl<D: SocketDriver, A: AdapterApplication> Engine<D, A> {
    /// Establish an I/O connection to assembly instances.
    pub(crate) fn establish_io(
        &mut self,
        open: &ForwardOpenRequest,
        path: &ConnectionPath,
        ctx: &mut ExplicitContext,
    ) -> Result<usize, ConnectionError> {
        let instance_type = self
            .pools
            .select(
                &path.connection_points,
                open.t_to_o_params.is_multicast(),
                &self.connections,
            )
            .map_err(ConnectionError::failure)?;

        let mut connection = self.connection_from_request(open, path);
        connection.instance_type = instance_type;
        connection.watchdog_action = WatchdogAction::TransitionToTimedOut;
        connection.originator_address = Some(ctx.originator);

        // Non-cyclic connections need a production inhibit below the RPI;
        // absent one, a quarter of the RPI is used.
        if !connection.trigger.is_cyclic() {
            match path.production_inhibit_ms {
                None => {
                    connection.production_inhibit_time_ms =
                        (connection.t_to_o_rpi_us / 4000) as u16;
                }
                Some(pit) => {
                    if pit as u32 > connection.t_to_o_rpi_us / 1000 {
                        return Err(ConnectionError::failure(
                            ExtendedStatus::PIT_GREATER_THAN_RPI,
                        ));
                    }
                    connection.production_inhibit_time_ms = pit;
                }
            }
        }

        self.setup_consumer(&mut connection)?;
        self.setup_producer(&mut connection)?;

        if let Some(config_data) = &path.config_data {
            self.handle_config_data(&connection, config_data)?;
        }

        self.open_communication_channels(&mut connection, ctx)?;

        connection.state = ConnectionState::Established;
        let output = connection.connection_points[0];
        let input = connection.connection_points[1];
        let key = self.connections.insert(connection);
        info!(key, output, input, "I/O connection opened");
        self.app
            .io_connection_event(output, input, IoConnectionEvent::Opened);
        Ok(key)
    }

    /// Bind the consuming side to its assembly and validate the O->T
    /// size, deriving whether a run/idle header is budgeted.
    fn setup_consumer(&self, connection: &mut ConnectionObject) -> Result<(), ConnectionError> {
        if connection.o_to_t_params.is_null() {
            return Ok(());
        }
        let point = connection.connection_points[0];
        let assembly_len = self
            .assembly_data(point)
            .ok_or(ConnectionError::failure(
                ExtendedStatus::INVALID_CONNECTION_POINT,
            ))?
            .len();

        let mut data_size = connection.consumed_size as i64;
        if connection.trigger.is_class_1() {
            data_size -= 2; // 16-bit sequence count
        }
        if data_size == assembly_len as i64 {
            connection.consumed_has_run_idle = false;
        } else if data_size > 0 && data_size == assembly_len as i64 + 4 {
            connection.consumed_has_run_idle = true;
        } else {
            debug!(
                point,
                expected = assembly_len,
                got = data_size,
                "consumed connection size mismatch"
            );
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_CONNECTION_SIZE,
            ));
        }
        connection.consuming_instance = Some(point);
        Ok(())
    }

    /// Bind the producing side to its assembly and validate the T->O size.
    fn setup_producer(&self, connection: &mut ConnectionObject) -> Result<(), ConnectionError> {
        if connection.t_to_o_params.is_null() {
            return Ok(());
        }
        // With both directions present the producing point is the
        // second path; with production only, the single path.
        let point = if connection.o_to_t_params.is_null() {
            connection.connection_points[0]
        } else {
            connection.connection_points[1]
        };
        let assembly_len = self
            .assembly_data(point)
            .ok_or(ConnectionError::failure(
                ExtendedStatus::INVALID_CONNECTION_POINT,
            ))?
            .len();

        let mut data_size = connection.produced_size as i64;
        if connection.trigger.is_class_1() {
            data_size -= 2;
        }
        if data_size != assembly_len as i64 {
            debug!(
                point,
                expected = assembly_len,
                got = data_size,
                "produced connection size mismatch"
            );
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_CONNECTION_SIZE,
            ));
        }
        connection.producing_instance = Some(point);
        Ok(())
    }

    /// Apply configuration data sent with the forward open.
    ///
    /// If another connection already references the same config point,
    /// the data must match what is present; otherwise it is written to
    /// the config assembly under the application's veto.
    fn handle_config_data(
        &mut self,
        connection: &ConnectionObject,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }
        let config_point = connection.connection_points[2];
        if connection_with_same_config_point_exists(&self.connections, config_point) {
            if self.assembly_data(config_point) != Some(data) {
                warn!(config_point, "conflicting configuration data");
                return Err(ConnectionError::failure(
                    ExtendedStatus::OWNERSHIP_CONFLICT,
                ));
            }
            return Ok(());
        }
        if !self.write_assembly_data(config_point, data) {
            warn!(config_point, "configuration data rejected");
            return Err(ConnectionError::failure(
                ExtendedStatus::INVALID_CONFIGURATION_FORMAT,
            ));
        }
        Ok(())
    }

    /// Open UDP endpoints per the (O->T, T->O) connection-type matrix.
    fn open_communication_channels(
        &mut self,
        connection: &mut ConnectionObject,
        ctx: &mut ExplicitContext,
    ) -> Result<(), ConnectionError> {
        match connection.o_to_t_params.connection_type {
            ConnectionType::Multicast => self.open_consuming_multicast(connection, ctx)?,
            ConnectionType::PointToPoint => self.open_consuming_point_to_point(connection, ctx)?,
            _ => {}
        }
        match connection.t_to_o_params.connection_type {
            ConnectionType::Multicast => self.open_producing_multicast(connection, ctx)?,
            ConnectionType::PointToPoint => self.open_producing_point_to_point(connection, ctx)?,
            _ => {}
        }
        Ok(())
    }

    fn open_consuming_point_to_point(
        &mut self,
        connection: &mut ConnectionObject,
        ctx: &mut ExplicitContext,
    ) -> Result<(), ConnectionError> {
        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.io_port);
        let handle = self
            .sockets
            .create_udp_socket(SocketDirection::Consuming, bind, self.config.qos_dscp)
            .map_err(|e| {
                warn!(error = %e, "cannot create consuming point-to-point socket");
                ConnectionError::failure(ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH)
            })?;
        connection.consuming_socket = Some(handle);
        // Tell the originator where to send O->T data.
        ctx.push_sockaddr(SockaddrInfo {
            direction: SockaddrDirection::OriginatorToTarget,
            port: self.config.io_port,
            address: Ipv4Addr::UNSPECIFIED,
        });
        Ok(())
    }

    fn open_consuming_multicast(
        &mut self,
        connection: &mut ConnectionObject,
        ctx: &mut ExplicitContext,
    ) -> Result<(), ConnectionError> {
        let group = self.config.multicast_address();
        let bind = SocketAddrV4::new(group, self.config.io_port);
        let handle = self
            .sockets
            .create_udp_socket(SocketDirection::Consuming, bind, self.config.qos_dscp)
            .map_err(|e| {
                warn!(error = %e, "cannot create consuming multicast socket");
                ConnectionError::failure(ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH)
            })?;
        connection.consuming_socket = Some(handle);
        ctx.push_sockaddr(SockaddrInfo {
            direction: SockaddrDirection::OriginatorToTarget,
            port: self.config.io_port,
            address: group,
        });
        Ok(())
    }

    fn open_producing_point_to_point(
        &mut self,
        connection: &mut ConnectionObject,
        ctx: &mut ExplicitContext,
    ) -> Result<(), ConnectionError> {
        // The originator may name the port it consumes on via a
        // T->O sockaddr item in the request.
        let port = ctx
            .request_sockaddr
            .iter()
            .flatten()
            .find(|info| info.direction == SockaddrDirection::TargetToOriginator)
            .map(|info| info.port)
            .unwrap_or(self.config.io_port);
        let remote = SocketAddrV4::new(*ctx.originator.ip(), port);
        let handle = self
            .sockets
            .create_udp_socket(SocketDirection::Producing, remote, self.config.qos_dscp)
            .map_err(|e| {
                warn!(error = %e, "cannot create producing point-to-point socket");
                ConnectionError::failure(ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH)
            })?;
        connection.producing_socket = Some(handle);
        connection.remote_address = Some(remote);
        Ok(())
    }

    /// Producing multicast honors application-type ownership: the
    /// first producer for an input assembly opens the socket, later
    /// connections share its produced connection id. An exclusive
    /// owner takes the socket over from a non-owning holder.
    fn open_producing_multicast(
        &mut self,
        connection: &mut ConnectionObject,
        ctx: &mut ExplicitContext,
    ) -> Result<(), ConnectionError> {
        let group = self.config.multicast_address();
        let remote = SocketAddrV4::new(group, self.config.io_port);
        let input_point = connection.connection_points[1];

        match existing_producing_multicast(&self.connections, input_point) {
            None => {
                let handle = self
                    .sockets
                    .create_udp_socket(SocketDirection::Producing, remote, self.config.qos_dscp)
                    .map_err(|e| {
                        warn!(error = %e, "cannot create producing multicast socket");
                        ConnectionError::failure(ExtendedStatus::INVALID_SEGMENT_TYPE_IN_PATH)
                    })?;
                connection.producing_socket = Some(handle);
            }
            Some(existing_key) => {
                let existing = self
                    .connections
                    .get_mut(existing_key)
                    .expect("key from lookup");
                // Share the already-chosen produced connection id.
                connection.produced_connection_id = existing.produced_connection_id;
                if connection.instance_type == InstanceType::IoExclusiveOwner {
                    // Exclusive owners drive the production themselves.
                    connection.producing_socket = existing.producing_socket.take();
                } else {
                    connection.producing_socket = None;
                }
            }
        }

        connection.remote_address = Some(remote);
        ctx.push_sockaddr(SockaddrInfo {
            direction: SockaddrDirection::TargetToOriginator,
            port: self.config.io_port,
            address: group,
        });
        Ok(())
    }

    /// Produce one frame for a connection whose transmission trigger
    /// expired. A send error aborts this tick's production only.
    pub(crate) fn send_connected_data(&mut self, key: usize) {
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };
        let Some(instance) = connection.producing_instance else {
            return;
        };
        let Some(handle) = connection.producing_socket else {
            return;
        };
        let Some(remote) = connection.remote_address else {
            return;
        };

        connection.eip_sequence_producing = connection.eip_sequence_producing.wrapping_add(1);
        let transport_class = connection.trigger.transport_class();
        let produced_id = connection.produced_connection_id;
        let eip_sequence = connection.eip_sequence_producing;

        // The application is asked right before the data leaves; a
        // change advances the class-1 sequence count.
        if self.app.before_assembly_data_send(instance) {
            let connection = self.connections.get_mut(key).expect("still present");
            connection.sequence_count_producing =
                connection.sequence_count_producing.wrapping_add(1);
        }
        let class1_sequence = self
            .connections
            .get(key)
            .map(|c| c.sequence_count_producing)
            .unwrap_or(0);

        let Some(assembly) = self.assembly_data(instance) else {
            return;
        };
        let mut payload = Vec::with_capacity(2 + assembly.len());
        if transport_class == 1 {
            payload.put_u16_le(class1_sequence);
        }
        payload.put_slice(assembly);

        let address = if transport_class != 0 {
            AddressItem::Sequenced {
                connection_id: produced_id,
                sequence: eip_sequence,
            }
        } else {
            AddressItem::Connection {
                connection_id: produced_id,
            }
        };
        let frame = CpfPacket {
            address,
            data: Some((ItemId::CONNECTED_DATA, &payload)),
            sockaddr_info: [None, None],
        }
        .encode(false);

        if let Err(e) = self.sockets.send_udp_data(handle, remote, &frame) {
            warn!(key, error = %e, "producing send failed");
        } else {
            trace!(key, len = frame.len(), "produced connected data");
            if let Some(connection) = self.connections.get_mut(key) {
                connection.last_package_watchdog_timer = connection.regular_watchdog_ms();
            }
        }
    }

    /// Dispatch a connected class-0/1 datagram received on a UDP I/O
    /// endpoint.
    pub fn handle_received_connected_data(&mut self, data: &[u8], origin: SocketAddrV4) {
        let packet = match CpfPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(error = %e, "malformed connected datagram dropped");
                return;
            }
        };
        let Some(connection_id) = packet.address.connection_id() else {
            trace!("connected datagram without connection address");
            return;
        };
        let payload = match packet.data {
            Some((type_id, payload)) if type_id == ItemId::CONNECTED_DATA => payload,
            _ => {
                trace!("connected datagram without connected data item");
                return;
            }
        };

        let Some(key) = self.connections.find_by_consumed_id(connection_id) else {
            trace!(connection_id, "datagram for unknown connection");
            return;
        };
        let connection = self.connections.get_mut(key).expect("key from lookup");

        // Ingress filter: only the originator may feed this connection.
        if connection.originator_address.map(|a| *a.ip()) != Some(*origin.ip()) {
            warn!(
                key,
                %origin,
                "connected data from unexpected source dropped"
            );
            return;
        }

        if let Some(sequence) = packet.address.sequence() {
            if !connection.accept_eip_sequence(sequence) {
                trace!(key, sequence, "stale EIP sequence dropped");
                return;
            }
        }
        connection.reset_watchdog();
        self.receive_io_data(key, payload);
    }

    /// Class-1 sequence discipline, run/idle header, assembly write.
    fn receive_io_data(&mut self, key: usize, mut payload: &[u8]) {
        let Some(connection) = self.connections.get_mut(key) else {
            return;
        };

        if connection.trigger.is_class_1() {
            if payload.len() < 2 {
                return;
            }
            let sequence = u16::from_le_bytes([payload[0], payload[1]]);
            payload = &payload[2..];
            if !connection.accept_class1_sequence(sequence) {
                // unchanged data: keep-alive only
                return;
            }
        }

        if payload.is_empty() {
            return; // heartbeat
        }

        let has_run_idle = connection.consumed_has_run_idle;
        let Some(instance) = connection.consuming_instance else {
            return;
        };

        if has_run_idle {
            if payload.len() < 4 {
                return;
            }
            let run_idle = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            payload = &payload[4..];
            if self.run_idle_state != run_idle {
                self.app.run_idle_changed(run_idle);
            }
            self.run_idle_state = run_idle;
        }

        if !self.write_assembly_data(instance, payload) {
            trace!(key, instance, "consumed data rejected by application");
        }
    }

    /// Watchdog expiry on an established connection.
    pub(crate) fn handle_connection_timeout(&mut self, key: usize) {
        let Some(connection) = self.connections.get(key) else {
            return;
        };
        info!(
            key,
            serial = format_args!("{:#06x}", connection.triad.connection_serial),
            "connection timed out"
        );

        let instance_type = connection.instance_type;
        let action = connection.watchdog_action;

        if !instance_type.is_io() {
            match action {
                WatchdogAction::AutoReset => {
                    if let Some(connection) = self.connections.get_mut(key) {
                        connection.reset_watchdog();
                    }
                }
                _ => self.close_connection(key),
            }
            return;
        }

        let output = connection.connection_points[0];
        let input = connection.connection_points[1];
        let multicast_producer = connection.t_to_o_params.is_multicast();
        let holds_socket = connection.producing_socket.is_some();

        self.app
            .io_connection_event(output, input, IoConnectionEvent::TimedOut);

        if multicast_producer {
            match instance_type {
                InstanceType::IoExclusiveOwner => {
                    // The owner's O->T data is gone: dependents fall.
                    self.close_all_for_input_with_type(input, InstanceType::IoInputOnly);
                    self.close_all_for_input_with_type(input, InstanceType::IoListenOnly);
                }
                InstanceType::IoInputOnly if holds_socket => {
                    self.hand_over_producing_socket(key, input);
                }
                _ => {}
            }
        }

        match action {
            WatchdogAction::AutoReset => {
                if let Some(connection) = self.connections.get_mut(key) {
                    connection.reset_watchdog();
                }
            }
            WatchdogAction::TransitionToTimedOut => {
                if multicast_producer
                    && self
                        .connections
                        .get(key)
                        .is_some_and(|c| c.producing_socket.is_some())
                {
                    self.hand_over_producing_socket(key, input);
                }
                if let Some(connection) = self.connections.get_mut(key) {
                    connection.state = ConnectionState::TimedOut;
                }
            }
            WatchdogAction::AutoDelete | WatchdogAction::DeferredDelete => {
                if action == WatchdogAction::DeferredDelete {
                    warn!(key, "DeferredDelete is DeviceNet-only, deleting");
                }
                self.close_io_connection(key);
            }
        }
    }

    /// Regular close of an I/O connection (forward close, watchdog
    /// auto-delete): transfer multicast production, release sockets.
    pub(crate) fn close_io_connection(&mut self, key: usize) {
        let Some(connection) = self.connections.get(key) else {
            return;
        };
        let output = connection.connection_points[0];
        let input = connection.connection_points[1];
        let transfers_production = matches!(
            connection.instance_type,
            InstanceType::IoExclusiveOwner | InstanceType::IoInputOnly
        ) && connection.t_to_o_params.is_multicast()
            && connection.producing_socket.is_some();

        self.app
            .io_connection_event(output, input, IoConnectionEvent::Closed);

        if transfers_production {
            self.hand_over_producing_socket(key, input);
        }
        self.release_connection(key);
    }

    /// Move the producing socket and transmission trigger state to
    /// the next non-controlling master; absent one, listen-only
    /// dependents are closed.
    fn hand_over_producing_socket(&mut self, from_key: usize, input_point: u32) {
        let Some(to_key) = next_non_controlling_master(&self.connections, input_point) else {
            debug!(input_point, "no producer successor, closing listen-only dependents");
            self.close_all_for_input_with_type(input_point, InstanceType::IoListenOnly);
            return;
        };

        let Some((socket, trigger_timer)) = self.connections.get_mut(from_key).map(|from| {
            (
                from.producing_socket.take(),
                from.transmission_trigger_timer,
            )
        }) else {
            return;
        };
        if let Some(to) = self.connections.get_mut(to_key) {
            debug!(from_key, to_key, input_point, "multicast production handed over");
            to.producing_socket = socket;
            to.transmission_trigger_timer = trigger_timer;
        }
    }

    /// Close every connection of the given type on an input assembly.
    fn close_all_for_input_with_type(&mut self, input_point: u32, instance_type: InstanceType) {
        for key in connections_for_input_with_type(&self.connections, input_point, instance_type) {
            if let Some(connection) = self.connections.get(key) {
                self.app.io_connection_event(
                    connection.connection_points[0],
                    connection.connection_points[1],
                    IoConnectionEvent::Closed,
                );
            }
            self.release_connection(key);
        }
    }

    /// Close sockets and drop the connection from the active list.
    pub(crate) fn release_connection(&mut self, key: usize) {
        if let Some(connection) = self.connections.remove(key) {
            if let Some(handle) = connection.consuming_socket {
                self.sockets.close_udp_socket(handle);
            }
            if let Some(handle) = connection.producing_socket {
                self.sockets.close_udp_socket(handle);
            }
        }
    }

    /// Read an assembly's data buffer.
    pub fn assembly_data(&self, instance_id: u32) -> Option<&[u8]> {
        let attribute = self
            .registry
            .instance(ClassCode::ASSEMBLY, instance_id)?
            .attribute(3)?;
        match &attribute.value {
            CipValue::ByteArray(data) => Some(data),
            _ => None,
        }
    }

    /// Write an assembly's data buffer and notify the application.
    ///
    /// Returns false when the instance is unknown, the length does not
    /// match, or the application rejects the data.
    pub fn write_assembly_data(&mut self, instance_id: u32, data: &[u8]) -> bool {
        let Some(class) = self.registry.class_mut(ClassCode::ASSEMBLY) else {
            return false;
        };
        let Some(instance) = class.instance_mut(instance_id) else {
            return false;
        };
        let Some(attribute) = instance.attribute_mut(3) else {
            return false;
        };
        let CipValue::ByteArray(buffer) = &mut attribute.value else {
            return false;
        };
        if buffer.len() != data.len() {
            return false;
        }
        buffer.copy_from_slice(data);
        self.app.after_assembly_data_received(instance_id)
    }

    /// Mutable access to an assembly's data buffer for the
    /// application side (producing data updates).
    pub fn assembly_data_mut(&mut self, instance_id: u32) -> Option<&mut [u8]> {
        let attribute = self
            .registry
            .class_mut(ClassCode::ASSEMBLY)?
            .instance_mut(instance_id)?
            .attribute_mut(3)?;
        match &mut attribute.value {
            CipValue::ByteArray(data) => Some(data),
            _ => None,
        }
    }
}
