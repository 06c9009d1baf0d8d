//! Ailoy runtime fabric: an in-process message broker plus an execution
//! engine that together mediate every interaction between host bindings
//! and compute backends.
//!
//! A host owns a [`Runtime`], starts a broker (and usually a VM) on an
//! endpoint URL, then drives work through [`BrokerClient`]s:
//!
//! ```no_run
//! use ailoy::{builtin_module, Runtime, Value};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let runtime = Runtime::new();
//! runtime.broker_start("inproc://main")?;
//! runtime.vm_start("inproc://main", vec![Arc::new(builtin_module())])?;
//!
//! let client = runtime.client("inproc://main")?;
//! let tx = ailoy::generate_uuid();
//! client.send_execute_function(&tx, "echo", Value::Str("hi".into()))?;
//! while let Some(packet) = client.listen(Duration::from_secs(1)) {
//!     if packet.kind == ailoy::PacketKind::RespondExecute {
//!         break;
//!     }
//! }
//! # Ok::<(), ailoy::Error>(())
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod lm;
pub mod runtime;
pub mod telemetry;
pub mod value;
pub mod vm;

pub use config::Limits;
pub use error::{Error, ErrorCode, OperatorError, RangeError, TypeError, ValueError};
pub use runtime::{
    BrokerClient, InstructionKind, Monitor, Notifier, Packet, PacketError, PacketKind, Runtime,
    Signal, StopFlag, TargetKey,
};
pub use value::{Dtype, DtypeCode, NdArray, Value, ValueKind, ValueMap};
pub use vm::{builtin_module, Component, Method, Module, Step};

pub type Result<T> = std::result::Result<T, Error>;

/// Fresh random UUID, string-encoded. Transaction ids and client names are
/// generated with this.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
