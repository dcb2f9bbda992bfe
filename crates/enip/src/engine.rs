//! The stack engine: one value owning every table, driven by the
//! event loop through the explicit/connected entry points and the
//! periodic tick.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::app::AdapterApplication;
use crate::cip::appconn::AppConnectionPools;
use crate::cip::connection::{ConnectionState, ConnectionTable};
use crate::cip::registry::{CipClass, ClassInstance, ClassRegistry};
use crate::cip::types::{
    AttributeFlags, CipValue, ClassCode, InterfaceConfiguration, PaddedPath, ServiceCode,
};
use crate::config::DeviceConfig;
use crate::encap::{DelayedListIdentity, SUPPORTED_DELAYED_MESSAGES, SUPPORTED_SESSIONS, SessionTable};
use crate::socket::SocketDriver;

/// Tick granularity of the cooperative scheduler in milliseconds.
pub const TIMER_TICK_MS: i64 = 10;

/// The EtherNet/IP adapter engine.
///
/// Exactly one execution context owns an `Engine` and calls its entry
/// points; all connection state is reached only through it, so no
/// locking is involved anywhere in the stack.
pub struct Engine<D: SocketDriver, A: AdapterApplication> {
    pub(crate) config: DeviceConfig,
    pub(crate) registry: ClassRegistry,
    pub(crate) sessions: SessionTable,
    pub(crate) delayed_identity: Vec<Option<DelayedListIdentity>>,
    pub(crate) connections: ConnectionTable,
    pub(crate) pools: AppConnectionPools,
    pub(crate) incarnation_id: u32,
    pub(crate) connection_counter: u16,
    pub(crate) rng: SmallRng,
    pub(crate) run_idle_state: u32,
    pub(crate) sockets: D,
    pub(crate) app: A,
}

impl<D: SocketDriver, A: AdapterApplication> Engine<D, A> {
    /// Build the engine and register the startup classes.
    pub fn new(config: DeviceConfig, sockets: D, app: A) -> Self {
        let mut rng = SmallRng::from_entropy();
        let connection_counter: u16 = rng.r#gen();
        let pools = AppConnectionPools {
            exclusive_owner: config.exclusive_owner_paths.clone(),
            input_only: config.input_only_paths.clone(),
            listen_only: config.listen_only_paths.clone(),
        };
        let mut engine = Self {
            incarnation_id: (config.unique_connection_id as u32) << 16,
            connection_counter,
            rng,
            config,
            registry: ClassRegistry::new(),
            sessions: SessionTable::new(SUPPORTED_SESSIONS),
            delayed_identity: (0..SUPPORTED_DELAYED_MESSAGES).map(|_| None).collect(),
            connections: ConnectionTable::new(),
            pools,
            run_idle_state: 0,
            sockets,
            app,
        };
        engine.register_classes();
        info!(
            ip = %engine.config.ip_address,
            multicast = %engine.config.multicast_address(),
            assemblies = engine.config.assemblies.len(),
            "engine initialized"
        );
        engine
    }

    /// The device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The socket collaborator.
    pub fn driver(&self) -> &D {
        &self.sockets
    }

    /// Mutable access to the socket collaborator.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.sockets
    }

    /// The application collaborator.
    pub fn application(&self) -> &A {
        &self.app
    }

    /// Mutable access to the application collaborator.
    pub fn application_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Number of live (established or timed out) connections.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// One scheduler tick: fire deferred replies, evaluate watchdogs,
    /// produce expired cyclic data.
    pub fn manage_connections(&mut self, elapsed_ms: i64) {
        self.manage_delayed_messages(elapsed_ms);

        for key in self.connections.keys() {
            // Watchdog phase.
            let mut timed_out = false;
            match self.connections.get_mut(key) {
                Some(connection) => {
                    if connection.state == ConnectionState::Established
                        && connection.maintains_watchdog()
                    {
                        connection.inactivity_watchdog_timer -= elapsed_ms;
                        connection.last_package_watchdog_timer -= elapsed_ms;
                        timed_out = connection.inactivity_watchdog_timer <= 0;
                    }
                }
                None => continue,
            }
            if timed_out {
                self.handle_connection_timeout(key);
            }

            // Production phase; only connections that survived the
            // watchdog in Established keep producing.
            let mut produce = false;
            if let Some(connection) = self.connections.get_mut(key) {
                if connection.state == ConnectionState::Established
                    && connection.expected_packet_rate_ms != 0
                    && connection.producing_socket.is_some()
                {
                    if !connection.trigger.is_cyclic() && connection.production_inhibit_timer >= 0 {
                        connection.production_inhibit_timer -= elapsed_ms;
                    }
                    connection.transmission_trigger_timer -= elapsed_ms;
                    if connection.transmission_trigger_timer <= 0
                        && (connection.trigger.is_cyclic()
                            || connection.production_inhibit_timer <= 0)
                    {
                        produce = true;
                        connection.transmission_trigger_timer = connection.expected_packet_rate_ms;
                        if !connection.trigger.is_cyclic() {
                            connection.production_inhibit_timer =
                                connection.production_inhibit_time_ms as i64;
                        }
                    }
                }
            }
            if produce {
                self.send_connected_data(key);
            }
        }
    }

    /// Tear everything down: connections, sessions, deferred replies.
    pub fn shutdown(&mut self) {
        debug!("engine shutdown");
        for key in self.connections.keys() {
            self.release_connection(key);
        }
        let sessions: Vec<_> = self.sessions.iter().collect();
        for (handle, socket) in sessions {
            self.sessions.unregister(handle);
            self.sockets.close_tcp_socket(socket);
        }
        for slot in self.delayed_identity.iter_mut() {
            *slot = None;
        }
    }

    /// Register the startup classes: identity, message router,
    /// assembly, connection manager and TCP/IP interface.
    fn register_classes(&mut self) {
        let identity = &self.config.identity;

        let mut identity_class = CipClass::new(ClassCode::IDENTITY, "identity", 1, 0xFE);
        identity_class.insert_instance_service(ServiceCode::GET_ATTRIBUTE_ALL, "GetAttributeAll");
        identity_class.insert_instance_service(ServiceCode::RESET, "Reset");
        let mut instance = ClassInstance::new(1);
        instance.insert_attribute(1, CipValue::Uint(identity.vendor_id), AttributeFlags::GETABLE);
        instance.insert_attribute(
            2,
            CipValue::Uint(identity.device_type),
            AttributeFlags::GETABLE,
        );
        instance.insert_attribute(
            3,
            CipValue::Uint(identity.product_code),
            AttributeFlags::GETABLE,
        );
        instance.insert_attribute(
            4,
            CipValue::Revision(identity.revision),
            AttributeFlags::GETABLE,
        );
        instance.insert_attribute(5, CipValue::Word(identity.status), AttributeFlags::GETABLE);
        instance.insert_attribute(
            6,
            CipValue::Udint(identity.serial_number),
            AttributeFlags::GETABLE,
        );
        instance.insert_attribute(
            7,
            CipValue::ShortString(identity.product_name.clone()),
            AttributeFlags::GETABLE,
        );
        identity_class.insert_instance(instance);
        self.registry.register(identity_class);

        let mut router = CipClass::new(ClassCode::MESSAGE_ROUTER, "message router", 1, 0);
        router.insert_instance(ClassInstance::new(1));
        self.registry.register(router);

        let mut assembly = CipClass::new(ClassCode::ASSEMBLY, "assembly", 2, 0);
        assembly.insert_instance_service(ServiceCode::SET_ATTRIBUTE_SINGLE, "SetAttributeSingle");
        for config in &self.config.assemblies {
            let mut instance = ClassInstance::new(config.instance_id);
            instance.insert_attribute(
                3,
                CipValue::ByteArray(vec![0; config.size]),
                AttributeFlags::GETABLE_SINGLE | AttributeFlags::SETTABLE,
            );
            instance.insert_attribute(
                4,
                CipValue::Uint(config.size as u16),
                AttributeFlags::GETABLE_SINGLE,
            );
            assembly.insert_instance(instance);
        }
        self.registry.register(assembly);

        let mut manager = CipClass::new(ClassCode::CONNECTION_MANAGER, "connection manager", 1, 0);
        manager.insert_instance_service(ServiceCode::FORWARD_OPEN, "ForwardOpen");
        manager.insert_instance_service(ServiceCode::LARGE_FORWARD_OPEN, "LargeForwardOpen");
        manager.insert_instance_service(ServiceCode::FORWARD_CLOSE, "ForwardClose");
        manager.insert_instance_service(ServiceCode::UNCONNECTED_SEND, "UnconnectedSend");
        manager.insert_instance_service(
            ServiceCode::GET_CONNECTION_OWNER,
            "GetConnectionOwner",
        );
        manager.insert_instance(ClassInstance::new(1));
        self.registry.register(manager);

        let mut tcpip = CipClass::new(ClassCode::TCP_IP_INTERFACE, "TCP/IP interface", 4, 0x7E);
        tcpip.insert_instance_service(ServiceCode::GET_ATTRIBUTE_ALL, "GetAttributeAll");
        let mut instance = ClassInstance::new(1);
        instance.insert_attribute(1, CipValue::Dword(1), AttributeFlags::GETABLE); // configured
        instance.insert_attribute(2, CipValue::Dword(0x04), AttributeFlags::GETABLE); // DHCP capable
        instance.insert_attribute(3, CipValue::Dword(0), AttributeFlags::GETABLE);
        instance.insert_attribute(
            4,
            CipValue::Epath(PaddedPath {
                class_id: 0xF6,
                instance_id: 1,
                attribute_id: None,
            }),
            AttributeFlags::GETABLE,
        );
        instance.insert_attribute(
            5,
            CipValue::InterfaceConfiguration(InterfaceConfiguration {
                ip_address: self.config.ip_address,
                network_mask: self.config.network_mask,
                gateway: self.config.gateway,
                name_server: std::net::Ipv4Addr::UNSPECIFIED,
                name_server_2: std::net::Ipv4Addr::UNSPECIFIED,
                domain_name: self.config.domain_name.clone(),
            }),
            AttributeFlags::GETABLE,
        );
        instance.insert_attribute(
            6,
            CipValue::String(self.config.host_name.clone()),
            AttributeFlags::GETABLE,
        );
        tcpip.insert_instance(instance);
        self.registry.register(tcpip);
    }
}

impl<D: SocketDriver, A: AdapterApplication> Drop for Engine<D, A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
