//! EtherNet/IP adapter-class device stack.
//!
//! This crate implements the CIP application layer over TCP and UDP
//! for an adapter (target) device: encapsulation sessions, the common
//! packet format, explicit message routing, the connection manager
//! with forward-open/forward-close, and cyclic class-0/1 I/O data
//! production with watchdog-enforced liveness.
//!
//! The stack is synchronous and single-threaded by design: one
//! [`engine::Engine`] value owns every table, and exactly one event
//! loop drives it through the entry points
//! ([`Engine::handle_explicit_tcp_data`],
//! [`Engine::handle_explicit_udp_data`],
//! [`Engine::handle_received_connected_data`],
//! [`Engine::manage_connections`]). OS sockets and the device
//! application sit behind the [`socket::SocketDriver`] and
//! [`app::AdapterApplication`] collaborator traits.
//!
//! [`Engine::handle_explicit_tcp_data`]: engine::Engine::handle_explicit_tcp_data
//! [`Engine::handle_explicit_udp_data`]: engine::Engine::handle_explicit_udp_data
//! [`Engine::handle_received_connected_data`]: engine::Engine::handle_received_connected_data
//! [`Engine::manage_connections`]: engine::Engine::manage_connections
//!
//! # Example
//!
//! ```ignore
//! use enip::config::{ApplicationPath, AssemblyConfig, DeviceConfig};
//! use enip::engine::Engine;
//!
//! let config = DeviceConfig {
//!     unique_connection_id: 7,
//!     ip_address: "192.168.0.2".parse()?,
//!     network_mask: "255.255.255.0".parse()?,
//!     assemblies: vec![
//!         AssemblyConfig { instance_id: 100, size: 32 }, // input
//!         AssemblyConfig { instance_id: 150, size: 32 }, // output
//!         AssemblyConfig { instance_id: 151, size: 10 }, // config
//!     ],
//!     exclusive_owner_paths: vec![ApplicationPath {
//!         output_assembly: 150,
//!         input_assembly: 100,
//!         config_assembly: 151,
//!     }],
//!     ..Default::default()
//! };
//! let mut engine = Engine::new(config, driver, application);
//!
//! // event loop:
//! //   engine.handle_explicit_tcp_data(socket, &frame, origin)
//! //   engine.handle_received_connected_data(&datagram, origin)
//! //   engine.manage_connections(TIMER_TICK_MS) every tick
//! ```

pub mod app;
pub mod cip;
pub mod config;
pub mod encap;
pub mod engine;
pub mod socket;

pub use app::{AdapterApplication, IoConnectionEvent};
pub use cip::error::{Error, Result};
pub use config::DeviceConfig;
pub use engine::{Engine, TIMER_TICK_MS};
pub use socket::{SocketDirection, SocketDriver, TcpHandle, UdpHandle};
