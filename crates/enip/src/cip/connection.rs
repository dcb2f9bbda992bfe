//! Connection object: per-connection state, counters and timers.

use std::net::SocketAddrV4;

use crate::socket::UdpHandle;

/// Connection object state (CIP connection object attribute 1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    NonExistent,
    Configuring,
    /// DeviceNet only; never entered by this stack.
    WaitingForConnectionId,
    Established,
    TimedOut,
    /// DeviceNet only; never entered by this stack.
    DeferredDelete,
    /// Reserved for bridged connections awaiting downstream close.
    Closing,
}

/// Application flavor of a connection, fixed at open time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InstanceType {
    #[default]
    ExplicitMessaging,
    IoExclusiveOwner,
    IoInputOnly,
    IoListenOnly,
}

impl InstanceType {
    /// True for the I/O variants.
    pub fn is_io(&self) -> bool {
        !matches!(self, Self::ExplicitMessaging)
    }
}

/// Connection type bits of the network connection parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionType {
    #[default]
    Null,
    Multicast,
    PointToPoint,
    Reserved,
}

impl ConnectionType {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Null,
            1 => Self::Multicast,
            2 => Self::PointToPoint,
            _ => Self::Reserved,
        }
    }
}

/// Priority bits of the network connection parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionPriority {
    #[default]
    Low,
    High,
    Scheduled,
    Urgent,
}

impl ConnectionPriority {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Low,
            1 => Self::High,
            2 => Self::Scheduled,
            _ => Self::Urgent,
        }
    }
}

/// Decoded network connection parameters (16-bit standard form or
/// 32-bit large form).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetConnectionParameters {
    pub connection_type: ConnectionType,
    pub priority: ConnectionPriority,
    /// Variable (true) vs fixed (false) size.
    pub variable_size: bool,
    /// Connection size in bytes.
    pub size: u16,
}

impl NetConnectionParameters {
    /// Decode the standard 16-bit form.
    pub fn from_raw16(raw: u16) -> Self {
        let raw = raw as u32;
        Self {
            connection_type: ConnectionType::from_bits(raw >> 13),
            priority: ConnectionPriority::from_bits(raw >> 10),
            variable_size: raw & (1 << 9) != 0,
            size: (raw & 0x01FF) as u16,
        }
    }

    /// Decode the large 32-bit form.
    pub fn from_raw32(raw: u32) -> Self {
        Self {
            connection_type: ConnectionType::from_bits(raw >> 29),
            priority: ConnectionPriority::from_bits(raw >> 26),
            variable_size: raw & (1 << 25) != 0,
            size: (raw & 0xFFFF) as u16,
        }
    }

    pub fn is_multicast(&self) -> bool {
        self.connection_type == ConnectionType::Multicast
    }

    pub fn is_point_to_point(&self) -> bool {
        self.connection_type == ConnectionType::PointToPoint
    }

    pub fn is_null(&self) -> bool {
        self.connection_type == ConnectionType::Null
    }
}

/// Production trigger encoded in the transport class trigger byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionTrigger {
    Cyclic,
    ChangeOfState,
    ApplicationObject,
    Reserved,
}

/// The transport class trigger byte of a forward-open request.
///
/// Bit 7 is the server flag, bits 4-6 the production trigger, bits
/// 0-3 the transport class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportClassTrigger(pub u8);

impl TransportClassTrigger {
    /// Server (target-maintained watchdog) direction flag.
    pub fn is_server(&self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn production_trigger(&self) -> ProductionTrigger {
        match (self.0 >> 4) & 0x7 {
            0 => ProductionTrigger::Cyclic,
            1 => ProductionTrigger::ChangeOfState,
            2 => ProductionTrigger::ApplicationObject,
            _ => ProductionTrigger::Reserved,
        }
    }

    /// Transport class (0-3 supported).
    pub fn transport_class(&self) -> u8 {
        self.0 & 0x0F
    }

    /// Bit 6; a production trigger value this target cannot support.
    pub fn reserved_trigger_bit(&self) -> bool {
        self.0 & 0x40 != 0
    }

    pub fn is_class_3(&self) -> bool {
        self.transport_class() == 3
    }

    pub fn is_class_1(&self) -> bool {
        self.transport_class() == 1
    }

    pub fn is_cyclic(&self) -> bool {
        self.production_trigger() == ProductionTrigger::Cyclic
    }
}

/// The connection triad: the uniqueness key between two endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectionTriad {
    pub connection_serial: u16,
    pub originator_vendor_id: u16,
    pub originator_serial: u32,
}

/// Action taken when the inactivity watchdog expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Default for I/O connections.
    #[default]
    TransitionToTimedOut,
    /// Default for explicit messaging connections.
    AutoDelete,
    AutoReset,
    /// DeviceNet only; executed as AutoDelete here.
    DeferredDelete,
}

/// Minimum initial inactivity watchdog value in milliseconds.
pub const MIN_INITIAL_WATCHDOG_MS: i64 = 10_000;

/// The central per-connection entity.
///
/// All timers are signed milliseconds; a value at or below zero means
/// expired. Sequence counters are independent per direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionObject {
    pub state: ConnectionState,
    pub instance_type: InstanceType,
    pub trigger: TransportClassTrigger,
    pub triad: ConnectionTriad,

    pub priority_timetick: u8,
    pub timeout_ticks: u8,
    pub timeout_multiplier: u8,
    pub watchdog_action: WatchdogAction,

    /// Connection id the device consumes on (O->T direction).
    pub consumed_connection_id: u32,
    /// Connection id the device produces on (T->O direction).
    pub produced_connection_id: u32,

    pub o_to_t_rpi_us: u32,
    pub t_to_o_rpi_us: u32,
    pub o_to_t_params: NetConnectionParameters,
    pub t_to_o_params: NetConnectionParameters,

    /// Production period in milliseconds (0 disables production).
    pub expected_packet_rate_ms: i64,
    pub transmission_trigger_timer: i64,
    pub inactivity_watchdog_timer: i64,
    pub last_package_watchdog_timer: i64,
    pub production_inhibit_timer: i64,
    /// Configured production inhibit time in milliseconds.
    pub production_inhibit_time_ms: u16,

    /// EIP-level (sequenced address item) counters, 32 bit.
    pub eip_sequence_producing: u32,
    pub eip_sequence_consuming: Option<u32>,
    /// Class-1 application counters, 16 bit.
    pub sequence_count_producing: u16,
    pub sequence_count_consuming: Option<u16>,

    pub consuming_socket: Option<UdpHandle>,
    pub producing_socket: Option<UdpHandle>,

    /// Source validated on ingress.
    pub originator_address: Option<SocketAddrV4>,
    /// Destination of produced frames.
    pub remote_address: Option<SocketAddrV4>,

    /// Encapsulation session a class-3 connection lives on.
    pub associated_session: Option<u32>,

    /// Target class from the connection path.
    pub class_id: u32,
    /// Connection points as parsed: [O->T, T->O, configuration].
    /// Zero marks an absent path.
    pub connection_points: [u32; 3],
    /// Assembly instance consumed data is written to.
    pub consuming_instance: Option<u32>,
    /// Assembly instance produced data is read from.
    pub producing_instance: Option<u32>,

    pub consumed_size: u16,
    pub produced_size: u16,
    /// Whether the O->T size budgets a 4-byte run/idle header.
    pub consumed_has_run_idle: bool,
}

impl ConnectionObject {
    /// Regular inactivity watchdog reload:
    /// `(o_to_t_rpi_us / 1000) << (2 + timeout_multiplier)`.
    pub fn regular_watchdog_ms(&self) -> i64 {
        ((self.o_to_t_rpi_us as i64) / 1000) << (2 + self.timeout_multiplier as i64)
    }

    /// Initial watchdog value: the regular reload, floored at 10 s.
    pub fn initial_watchdog_ms(&self) -> i64 {
        self.regular_watchdog_ms().max(MIN_INITIAL_WATCHDOG_MS)
    }

    /// Arm the watchdog for establishment.
    pub fn arm_initial_watchdog(&mut self) {
        self.inactivity_watchdog_timer = self.initial_watchdog_ms();
        self.last_package_watchdog_timer = self.regular_watchdog_ms();
    }

    /// Reload the watchdog after accepted consumed data.
    pub fn reset_watchdog(&mut self) {
        self.inactivity_watchdog_timer = self.regular_watchdog_ms();
        self.last_package_watchdog_timer = self.regular_watchdog_ms();
    }

    /// Accept an EIP-level sequence number.
    ///
    /// Accepted when strictly greater than the last accepted value
    /// under 32-bit wrap (signed difference); the first number after
    /// establishment is always accepted.
    pub fn accept_eip_sequence(&mut self, sequence: u32) -> bool {
        let accept = match self.eip_sequence_consuming {
            None => true,
            Some(last) => (sequence.wrapping_sub(last) as i32) > 0,
        };
        if accept {
            self.eip_sequence_consuming = Some(sequence);
        }
        accept
    }

    /// Accept a class-1 application sequence count.
    ///
    /// A count not strictly greater than the last accepted one means
    /// unchanged data: the caller keeps the packet as keep-alive but
    /// drops the payload.
    pub fn accept_class1_sequence(&mut self, sequence: u16) -> bool {
        let accept = match self.sequence_count_consuming {
            None => true,
            Some(last) => (sequence.wrapping_sub(last) as i16) > 0,
        };
        if accept {
            self.sequence_count_consuming = Some(sequence);
        }
        accept
    }

    /// Whether this connection maintains the inactivity watchdog.
    pub fn maintains_watchdog(&self) -> bool {
        self.consuming_instance.is_some() || self.trigger.is_server()
    }
}

/// The active connection list.
///
/// Connections live in stable slots; the walk order is insertion
/// order, matching the list semantics the scheduler relies on. The
/// triad stays the external key.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Option<ConnectionObject>>,
    order: Vec<usize>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Install a connection, returning its key.
    pub fn insert(&mut self, connection: ConnectionObject) -> usize {
        let key = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(connection);
                free
            }
            None => {
                self.slots.push(Some(connection));
                self.slots.len() - 1
            }
        };
        self.order.push(key);
        key
    }

    /// Remove a connection, returning it to NonExistent.
    pub fn remove(&mut self, key: usize) -> Option<ConnectionObject> {
        let mut connection = self.slots.get_mut(key)?.take()?;
        self.order.retain(|&k| k != key);
        connection.state = ConnectionState::NonExistent;
        Some(connection)
    }

    pub fn get(&self, key: usize) -> Option<&ConnectionObject> {
        self.slots.get(key)?.as_ref()
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut ConnectionObject> {
        self.slots.get_mut(key)?.as_mut()
    }

    /// Iterate live connections in walk order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ConnectionObject)> {
        self.order
            .iter()
            .filter_map(|&k| self.slots[k].as_ref().map(|c| (k, c)))
    }

    /// Snapshot of the walk order, safe against removal mid-walk.
    pub fn keys(&self) -> Vec<usize> {
        self.order.clone()
    }

    /// Find the Established connection consuming on `connection_id`.
    pub fn find_by_consumed_id(&self, connection_id: u32) -> Option<usize> {
        self.iter()
            .find(|(_, c)| {
                c.state == ConnectionState::Established
                    && c.consumed_connection_id == connection_id
            })
            .map(|(k, _)| k)
    }

    /// Find an Established connection with the given triad.
    pub fn find_established_by_triad(&self, triad: &ConnectionTriad) -> Option<usize> {
        self.iter()
            .find(|(_, c)| c.state == ConnectionState::Established && c.triad == *triad)
            .map(|(k, _)| k)
    }

    /// Find an Established or TimedOut connection with the given triad
    /// (forward-close matches both).
    pub fn find_closable_by_triad(&self, triad: &ConnectionTriad) -> Option<usize> {
        self.iter()
            .find(|(_, c)| {
                matches!(
                    c.state,
                    ConnectionState::Established | ConnectionState::TimedOut
                ) && c.triad == *triad
            })
            .map(|(k, _)| k)
    }

    /// True if any live connection uses `id` as a connection id.
    pub fn connection_id_in_use(&self, id: u32) -> bool {
        self.iter()
            .any(|(_, c)| c.consumed_connection_id == id || c.produced_connection_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_params_from_raw16() {
        // P2P, low priority, fixed, size 4
        let params = NetConnectionParameters::from_raw16(0x4004);
        assert_eq!(params.connection_type, ConnectionType::PointToPoint);
        assert_eq!(params.priority, ConnectionPriority::Low);
        assert!(!params.variable_size);
        assert_eq!(params.size, 4);

        // multicast, scheduled, variable, size 8
        let params = NetConnectionParameters::from_raw16(0x2A08);
        assert_eq!(params.connection_type, ConnectionType::Multicast);
        assert_eq!(params.priority, ConnectionPriority::Scheduled);
        assert!(params.variable_size);
        assert_eq!(params.size, 8);

        let params = NetConnectionParameters::from_raw16(0x6000);
        assert_eq!(params.connection_type, ConnectionType::Reserved);
    }

    #[test]
    fn test_net_params_from_raw32() {
        // P2P, size 1000
        let params = NetConnectionParameters::from_raw32(0x4000_03E8);
        assert_eq!(params.connection_type, ConnectionType::PointToPoint);
        assert_eq!(params.size, 1000);
    }

    #[test]
    fn test_trigger_byte_fields() {
        // class 1, cyclic, client
        let trigger = TransportClassTrigger(0x01);
        assert!(!trigger.is_server());
        assert!(trigger.is_cyclic());
        assert!(trigger.is_class_1());

        // class 3, application object, server
        let trigger = TransportClassTrigger(0xA3);
        assert!(trigger.is_server());
        assert_eq!(
            trigger.production_trigger(),
            ProductionTrigger::ApplicationObject
        );
        assert!(trigger.is_class_3());
    }

    #[test]
    fn test_watchdog_formula() {
        let mut conn = ConnectionObject {
            o_to_t_rpi_us: 10_000, // 10 ms
            timeout_multiplier: 0,
            ..Default::default()
        };
        assert_eq!(conn.regular_watchdog_ms(), 40);
        assert_eq!(conn.initial_watchdog_ms(), 10_000);

        conn.o_to_t_rpi_us = 1_000_000; // 1 s
        conn.timeout_multiplier = 2;
        assert_eq!(conn.regular_watchdog_ms(), 16_000);
        assert_eq!(conn.initial_watchdog_ms(), 16_000);

        conn.arm_initial_watchdog();
        assert_eq!(conn.inactivity_watchdog_timer, 16_000);
    }

    #[test]
    fn test_eip_sequence_strictly_monotonic() {
        let mut conn = ConnectionObject::default();
        assert!(conn.accept_eip_sequence(0));
        assert!(!conn.accept_eip_sequence(0));
        assert!(conn.accept_eip_sequence(1));
        assert!(!conn.accept_eip_sequence(1));
        assert!(conn.accept_eip_sequence(100));
        assert!(!conn.accept_eip_sequence(5));
    }

    #[test]
    fn test_eip_sequence_wraps() {
        let mut conn = ConnectionObject::default();
        assert!(conn.accept_eip_sequence(u32::MAX));
        // wrap-around: 0 is "greater" than u32::MAX by signed diff
        assert!(conn.accept_eip_sequence(0));
        assert!(!conn.accept_eip_sequence(u32::MAX));
    }

    #[test]
    fn test_class1_sequence_keepalive() {
        let mut conn = ConnectionObject::default();
        assert!(conn.accept_class1_sequence(7));
        assert!(!conn.accept_class1_sequence(7));
        assert!(conn.accept_class1_sequence(8));
        assert!(!conn.accept_class1_sequence(3));
        conn.sequence_count_consuming = Some(65_000);
        assert!(conn.accept_class1_sequence(100)); // wrapped
    }

    #[test]
    fn test_table_insert_remove_order() {
        let mut table = ConnectionTable::new();
        let a = table.insert(ConnectionObject {
            state: ConnectionState::Established,
            consumed_connection_id: 10,
            ..Default::default()
        });
        let b = table.insert(ConnectionObject {
            state: ConnectionState::Established,
            consumed_connection_id: 20,
            ..Default::default()
        });
        assert_eq!(table.len(), 2);
        assert_eq!(table.find_by_consumed_id(20), Some(b));

        let removed = table.remove(a).unwrap();
        assert_eq!(removed.state, ConnectionState::NonExistent);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find_by_consumed_id(10), None);

        // slot is reused, walk order keeps insertion order
        let c = table.insert(ConnectionObject::default());
        assert_eq!(c, a);
        let keys: Vec<usize> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b, c]);
    }

    #[test]
    fn test_triad_lookup_requires_established() {
        let mut table = ConnectionTable::new();
        let triad = ConnectionTriad {
            connection_serial: 0x1234,
            originator_vendor_id: 0x42,
            originator_serial: 0xDEAD_BEEF,
        };
        let key = table.insert(ConnectionObject {
            state: ConnectionState::TimedOut,
            triad,
            ..Default::default()
        });
        assert_eq!(table.find_established_by_triad(&triad), None);
        assert_eq!(table.find_closable_by_triad(&triad), Some(key));
    }
}
