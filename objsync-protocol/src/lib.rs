//! # objsync-protocol
//!
//! Wire protocol shared by the objsync owning side (backend) and consuming
//! side (frontend).
//!
//! This crate provides:
//! - Length-prefixed text framing (`<len> <payload>\n`)
//! - Command-tagged JSON messages
//! - Type descriptors and embedded object references
//! - Protocol constants

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use descriptor::{
    setter_name, MethodDescriptor, ObjectRef, ObjectTag, OmittedType, ParamDescriptor,
    PropertyDescriptor, SignalDescriptor, TypeDescriptor, TypeDescriptorBuilder, TypeRef,
    ValueKind,
};
pub use error::ProtocolError;
pub use frame::{Frame, MAX_LENGTH_DIGITS};
pub use message::{Direction, Message};

/// Protocol version announced in the VERSION handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Default TCP port for an objsync backend.
pub const DEFAULT_PORT: u16 = 7402;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Object identifier, unique for the lifetime of one connection.
pub type ObjectId = String;
