//! CIP application layer: object model, routing, connections.

pub mod appconn;
pub mod connection;
pub mod ekey;
pub mod epath;
pub mod error;
pub mod io;
pub mod manager;
pub mod registry;
pub mod router;
pub mod types;

pub use connection::{
    ConnectionObject, ConnectionState, ConnectionTriad, ConnectionType, InstanceType,
    NetConnectionParameters, TransportClassTrigger, WatchdogAction,
};
pub use error::{EncapStatus, Error, ExtendedStatus, GeneralStatus, Result};
pub use router::{MessageRouterRequest, MessageRouterResponse};
pub use types::{CipValue, ClassCode, ServiceCode};
