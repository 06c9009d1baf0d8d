//! The message fabric: wake primitive, packet codec, in-process transport,
//! broker, client façade, and the endpoint registry.

pub mod broker;
pub mod client;
pub mod packet;
pub mod registry;
pub mod signal;
pub mod socket;

pub use client::BrokerClient;
pub use packet::{InstructionKind, Packet, PacketError, PacketKind, TargetKey, PROTOCOL_VERSION};
pub use registry::Runtime;
pub use signal::{Monitor, Notifier, Signal, StopFlag};
pub use socket::{Acceptor, Socket, SocketError};
