//! Application connection pools: exclusive-owner, input-only and
//! listen-only slot selection for incoming I/O forward-opens.

use tracing::debug;

use crate::config::ApplicationPath;

use super::connection::{ConnectionObject, ConnectionTable, InstanceType};
use super::error::ExtendedStatus;

/// Connections sharing one input-only path.
pub const INPUT_ONLY_FAN_OUT: usize = 3;

/// Connections sharing one listen-only path.
pub const LISTEN_ONLY_FAN_OUT: usize = 3;

/// The three fixed pools, configured once at startup.
#[derive(Debug, Clone, Default)]
pub struct AppConnectionPools {
    pub exclusive_owner: Vec<ApplicationPath>,
    pub input_only: Vec<ApplicationPath>,
    pub listen_only: Vec<ApplicationPath>,
}

impl AppConnectionPools {
    /// Match a parsed {output, input, config} triple against the pools
    /// and pick the application instance type for the connection.
    ///
    /// Tried in order: exclusive owner, input only, listen only. The
    /// first pool whose output assembly matches decides, and within it
    /// the remaining points must agree exactly.
    pub fn select(
        &self,
        points: &[u32; 3],
        t_to_o_multicast: bool,
        connections: &ConnectionTable,
    ) -> Result<InstanceType, u16> {
        if let Some(path) = find_path(&self.exclusive_owner, points[0]) {
            check_points(path, points)?;
            let taken = connections.iter().any(|(_, c)| {
                c.instance_type == InstanceType::IoExclusiveOwner
                    && c.connection_points[0] == points[0]
            });
            if taken {
                return Err(ExtendedStatus::OWNERSHIP_CONFLICT);
            }
            return Ok(InstanceType::IoExclusiveOwner);
        }

        if let Some(path) = find_path(&self.input_only, points[0]) {
            check_points(path, points)?;
            let used = count_siblings(connections, InstanceType::IoInputOnly, points[0]);
            if used >= INPUT_ONLY_FAN_OUT {
                return Err(ExtendedStatus::TARGET_OUT_OF_CONNECTIONS);
            }
            return Ok(InstanceType::IoInputOnly);
        }

        if let Some(path) = find_path(&self.listen_only, points[0]) {
            // Listen-only connections ride an existing multicast
            // producer; they cannot stand on their own.
            if !t_to_o_multicast {
                return Err(ExtendedStatus::NON_LISTEN_ONLY_NOT_OPENED);
            }
            check_points(path, points)?;
            if existing_producing_multicast(connections, points[1]).is_none() {
                return Err(ExtendedStatus::NON_LISTEN_ONLY_NOT_OPENED);
            }
            let used = count_siblings(connections, InstanceType::IoListenOnly, points[0]);
            if used >= LISTEN_ONLY_FAN_OUT {
                return Err(ExtendedStatus::TARGET_OUT_OF_CONNECTIONS);
            }
            return Ok(InstanceType::IoListenOnly);
        }

        debug!(?points, "no application connection path matches");
        Err(ExtendedStatus::INVALID_CONNECTION_POINT)
    }
}

fn find_path(pool: &[ApplicationPath], output_assembly: u32) -> Option<&ApplicationPath> {
    pool.iter().find(|p| p.output_assembly == output_assembly)
}

fn check_points(path: &ApplicationPath, points: &[u32; 3]) -> Result<(), u16> {
    if path.input_assembly != points[1] || path.config_assembly != points[2] {
        return Err(ExtendedStatus::INVALID_CONNECTION_POINT);
    }
    Ok(())
}

fn count_siblings(
    connections: &ConnectionTable,
    instance_type: InstanceType,
    output_point: u32,
) -> usize {
    connections
        .iter()
        .filter(|(_, c)| c.instance_type == instance_type && c.connection_points[0] == output_point)
        .count()
}

/// Whether a connection produces the multicast data for `input_point`
/// and currently drives the producing socket.
fn is_controlling_producer(connection: &ConnectionObject, input_point: u32) -> bool {
    matches!(
        connection.instance_type,
        InstanceType::IoExclusiveOwner | InstanceType::IoInputOnly
    ) && connection.connection_points[1] == input_point
        && connection.t_to_o_params.is_multicast()
}

/// The connection currently driving the multicast producing socket
/// for the given input assembly.
pub fn existing_producing_multicast(
    connections: &ConnectionTable,
    input_point: u32,
) -> Option<usize> {
    connections
        .iter()
        .find(|(_, c)| is_controlling_producer(c, input_point) && c.producing_socket.is_some())
        .map(|(k, _)| k)
}

/// The next connection eligible to take the multicast producing
/// socket over (same input assembly, not currently controlling).
pub fn next_non_controlling_master(
    connections: &ConnectionTable,
    input_point: u32,
) -> Option<usize> {
    connections
        .iter()
        .find(|(_, c)| is_controlling_producer(c, input_point) && c.producing_socket.is_none())
        .map(|(k, _)| k)
}

/// All connections of `instance_type` listening on `input_point`.
pub fn connections_for_input_with_type(
    connections: &ConnectionTable,
    input_point: u32,
    instance_type: InstanceType,
) -> Vec<usize> {
    connections
        .iter()
        .filter(|(_, c)| {
            c.instance_type == instance_type && c.connection_points[1] == input_point
        })
        .map(|(k, _)| k)
        .collect()
}

/// Whether any live connection references `config_point` as its
/// configuration assembly.
pub fn connection_with_same_config_point_exists(
    connections: &ConnectionTable,
    config_point: u32,
) -> bool {
    connections
        .iter()
        .any(|(_, c)| c.connection_points[2] == config_point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cip::connection::{ConnectionState, NetConnectionParameters};
    use crate::socket::UdpHandle;

    fn pools() -> AppConnectionPools {
        AppConnectionPools {
            exclusive_owner: vec![ApplicationPath {
                output_assembly: 150,
                input_assembly: 100,
                config_assembly: 151,
            }],
            input_only: vec![ApplicationPath {
                output_assembly: 152,
                input_assembly: 100,
                config_assembly: 151,
            }],
            listen_only: vec![ApplicationPath {
                output_assembly: 153,
                input_assembly: 100,
                config_assembly: 151,
            }],
        }
    }

    fn multicast_producer(output: u32, socket: Option<UdpHandle>) -> ConnectionObject {
        ConnectionObject {
            state: ConnectionState::Established,
            instance_type: InstanceType::IoExclusiveOwner,
            connection_points: [output, 100, 151],
            t_to_o_params: NetConnectionParameters::from_raw16(0x2008),
            producing_socket: socket,
            ..Default::default()
        }
    }

    #[test]
    fn test_exclusive_owner_selected_when_free() {
        let pools = pools();
        let connections = ConnectionTable::new();
        assert_eq!(
            pools.select(&[150, 100, 151], true, &connections),
            Ok(InstanceType::IoExclusiveOwner)
        );
    }

    #[test]
    fn test_exclusive_owner_conflict() {
        let pools = pools();
        let mut connections = ConnectionTable::new();
        connections.insert(multicast_producer(150, Some(UdpHandle(4))));
        assert_eq!(
            pools.select(&[150, 100, 151], true, &connections),
            Err(ExtendedStatus::OWNERSHIP_CONFLICT)
        );
    }

    #[test]
    fn test_wrong_input_point_rejected() {
        let pools = pools();
        let connections = ConnectionTable::new();
        assert_eq!(
            pools.select(&[150, 101, 151], true, &connections),
            Err(ExtendedStatus::INVALID_CONNECTION_POINT)
        );
    }

    #[test]
    fn test_unknown_output_point_rejected() {
        let pools = pools();
        let connections = ConnectionTable::new();
        assert_eq!(
            pools.select(&[99, 100, 151], true, &connections),
            Err(ExtendedStatus::INVALID_CONNECTION_POINT)
        );
    }

    #[test]
    fn test_input_only_fan_out_limit() {
        let pools = pools();
        let mut connections = ConnectionTable::new();
        for _ in 0..INPUT_ONLY_FAN_OUT {
            connections.insert(ConnectionObject {
                state: ConnectionState::Established,
                instance_type: InstanceType::IoInputOnly,
                connection_points: [152, 100, 151],
                ..Default::default()
            });
        }
        assert_eq!(
            pools.select(&[152, 100, 151], true, &connections),
            Err(ExtendedStatus::TARGET_OUT_OF_CONNECTIONS)
        );
    }

    #[test]
    fn test_listen_only_requires_multicast_and_producer() {
        let pools = pools();
        let mut connections = ConnectionTable::new();

        assert_eq!(
            pools.select(&[153, 100, 151], false, &connections),
            Err(ExtendedStatus::NON_LISTEN_ONLY_NOT_OPENED)
        );
        assert_eq!(
            pools.select(&[153, 100, 151], true, &connections),
            Err(ExtendedStatus::NON_LISTEN_ONLY_NOT_OPENED)
        );

        connections.insert(multicast_producer(150, Some(UdpHandle(4))));
        assert_eq!(
            pools.select(&[153, 100, 151], true, &connections),
            Ok(InstanceType::IoListenOnly)
        );
    }

    #[test]
    fn test_handover_scans() {
        let mut connections = ConnectionTable::new();
        let owner = connections.insert(multicast_producer(150, Some(UdpHandle(4))));
        let standby = connections.insert(ConnectionObject {
            instance_type: InstanceType::IoInputOnly,
            ..multicast_producer(152, None)
        });

        assert_eq!(existing_producing_multicast(&connections, 100), Some(owner));
        assert_eq!(next_non_controlling_master(&connections, 100), Some(standby));

        connections.remove(owner);
        assert_eq!(existing_producing_multicast(&connections, 100), None);
    }
}
