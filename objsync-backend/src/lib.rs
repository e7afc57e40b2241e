//! # objsync-backend
//!
//! Owning side of the objsync protocol.
//!
//! This crate provides:
//! - Object handles with stable identity and lazily assigned identifiers
//! - The per-connection object registry and reference bookkeeping
//! - Epoch-based reclamation driven by SYNC / SYNC_ACK
//! - Method dispatch, property snapshots and signal emission
//! - A paged list model
//! - A TCP server with per-connection object roots

pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod object;
pub mod registry;
pub mod server;
pub mod sync;
pub mod types;
pub mod value;

pub use config::{Config, ConfigError, LimitsConfig, NetworkConfig, SyncConfig};
pub use connection::{Connection, ConnectionOptions};
pub use error::{BackendError, MethodError};
pub use model::ListModel;
pub use object::{Args, BackendObject, Emitter, Object, ObjectHandle};
pub use registry::{ObjectRecord, Registry};
pub use server::{Server, ServerConfig, ServerStats};
pub use sync::SyncState;
pub use types::descriptor_of;
pub use value::{FromValue, Value, VisitObjects};

pub use objsync_protocol::{TypeDescriptor, ValueKind};
