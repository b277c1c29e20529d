//! # IPC Fabric
//!
//! A distributed inter-process control facility implemented in Rust.
//! Cooperating application endpoints discover one another through a
//! filesystem-backed flow registry, exchange typed netstring-framed
//! messages over UDP points of attachment, and spawn worker processes
//! that join the same fabric.

pub mod assembly;
pub mod cli;
pub mod framing;
pub mod message;
pub mod node;
pub mod policy;
pub mod proactor;
pub mod registry;
pub mod router;

pub use cli::{Args, FabricConfiguration, FabricMode};
pub use message::{parcel, reply, Address, Header, Message};
pub use node::{create_udp_node, Node};
pub use proactor::{Initiator, Processor, Worker};
pub use registry::{Resource, Token};

/// The current version of the fabric crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// The trust domain every endpoint registers under
    pub const NAMESPACE: &str = "turberfield";

    /// Local address points of attachment bind to
    pub const LOOPBACK_ADDR: &str = "127.0.0.1";

    /// Ephemeral pool a UDP attachment is allocated from
    pub const POA_PORT_MIN: u16 = 49152;
    pub const POA_PORT_MAX: u16 = 65535;

    /// Default hop limit stamped on a fresh header
    pub const HOP_LIMIT: u32 = 3;

    /// Flow directory naming
    pub const FLOW_PREFIX: &str = "flow_";
    pub const POLICY_SUFFIX: &str = ".json";

    /// Policy names the node runtime relies on
    pub const POLICY_UDP: &str = "udp";
    pub const POLICY_APPLICATION: &str = "application";

    /// Startup window for configuration delivery
    pub const CONFIG_TIMEOUT_SEC: u64 = 3;

    /// Pause between configuration refresh cycles
    pub const REFRESH_INTERVAL_SEC: u64 = 30;

    /// The initiator's management coordinates and child port range
    pub const PARENT_PORT: u16 = 8080;
    pub const CHILD_PORT_MIN: u16 = 8081;
    pub const CHILD_PORT_MAX: u16 = 8181;

    /// Depth of the application and supervision queues
    pub const QUEUE_DEPTH: usize = 64;

    /// Largest datagram a node accepts
    pub const DATAGRAM_CAPACITY: usize = 64 * 1024;

    /// Receive buffer requested for each attachment socket
    pub const SOCKET_BUFFER: usize = 1 << 20;
}
