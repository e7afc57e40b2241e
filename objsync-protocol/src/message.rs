//! Command-tagged JSON messages.
//!
//! Every payload is a JSON object with a `command` discriminator. Unknown
//! commands and missing required fields fail to decode; optional fields
//! fall back to their defaults.

use crate::descriptor::{ObjectRef, TypeDescriptor};
use crate::error::ProtocolError;
use crate::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Which side of a connection may send a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the owning side (backend).
    ToConsumer,
    /// Sent by the consuming side (frontend).
    ToOwner,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Protocol version handshake.
    Version { version: u32 },

    /// Instantiable types and singleton roots.
    Register {
        #[serde(default)]
        types: Vec<TypeDescriptor>,
        #[serde(default)]
        singletons: BTreeMap<String, ObjectRef>,
    },

    /// Explicit acquire of an object by the consumer.
    ObjectRef { identifier: ObjectId },

    /// Explicit release of an object by the consumer.
    ObjectDeref { identifier: ObjectId },

    /// Request for a full property snapshot.
    ObjectQuery { identifier: ObjectId },

    /// Full property snapshot.
    ObjectReset {
        identifier: ObjectId,
        #[serde(default)]
        data: Map<String, Value>,
    },

    /// Remote construction of an instantiable type.
    ObjectCreate {
        identifier: ObjectId,
        #[serde(rename = "typeName")]
        type_name: String,
    },

    /// Method call.
    Invoke {
        identifier: ObjectId,
        method: String,
        parameters: Vec<Value>,
        #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
        return_id: Option<String>,
    },

    /// Result of a method call that asked for one.
    InvokeReturn {
        identifier: ObjectId,
        #[serde(rename = "return")]
        return_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Signal delivery. `method` carries the signal name.
    Emit {
        identifier: ObjectId,
        method: String,
        #[serde(default)]
        parameters: Vec<Value>,
    },

    /// Start of a reclamation epoch.
    Sync { serial: u64 },

    /// Consumer acknowledgement of an epoch.
    SyncAck { serial: u64 },
}

impl Message {
    /// Returns the wire name of the command.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version { .. } => "VERSION",
            Message::Register { .. } => "REGISTER",
            Message::ObjectRef { .. } => "OBJECT_REF",
            Message::ObjectDeref { .. } => "OBJECT_DEREF",
            Message::ObjectQuery { .. } => "OBJECT_QUERY",
            Message::ObjectReset { .. } => "OBJECT_RESET",
            Message::ObjectCreate { .. } => "OBJECT_CREATE",
            Message::Invoke { .. } => "INVOKE",
            Message::InvokeReturn { .. } => "INVOKE_RETURN",
            Message::Emit { .. } => "EMIT",
            Message::Sync { .. } => "SYNC",
            Message::SyncAck { .. } => "SYNC_ACK",
        }
    }

    /// Returns which side is allowed to send this command.
    pub fn direction(&self) -> Direction {
        match self {
            Message::Version { .. }
            | Message::Register { .. }
            | Message::ObjectReset { .. }
            | Message::InvokeReturn { .. }
            | Message::Emit { .. }
            | Message::Sync { .. } => Direction::ToConsumer,
            Message::ObjectRef { .. }
            | Message::ObjectDeref { .. }
            | Message::ObjectQuery { .. }
            | Message::ObjectCreate { .. }
            | Message::Invoke { .. }
            | Message::SyncAck { .. } => Direction::ToOwner,
        }
    }

    /// Returns the object this message is addressed to, if any.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Message::ObjectRef { identifier }
            | Message::ObjectDeref { identifier }
            | Message::ObjectQuery { identifier }
            | Message::ObjectReset { identifier, .. }
            | Message::ObjectCreate { identifier, .. }
            | Message::Invoke { identifier, .. }
            | Message::InvokeReturn { identifier, .. }
            | Message::Emit { identifier, .. } => Some(identifier),
            Message::Version { .. }
            | Message::Register { .. }
            | Message::Sync { .. }
            | Message::SyncAck { .. } => None,
        }
    }

    /// Decodes a message from a frame payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serializes the message into a frame payload.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{TypeRef, ValueKind};
    use serde_json::json;

    fn decode(value: Value) -> Result<Message, ProtocolError> {
        Message::from_slice(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_version_wire_shape() {
        let msg = Message::Version { version: 2 };
        assert_eq!(
            String::from_utf8(msg.to_vec().unwrap()).unwrap(),
            r#"{"command":"VERSION","version":2}"#
        );
    }

    #[test]
    fn test_object_commands() {
        let msg = decode(json!({"command": "OBJECT_REF", "identifier": "Root"})).unwrap();
        assert_eq!(msg, Message::ObjectRef { identifier: "Root".into() });
        assert_eq!(msg.direction(), Direction::ToOwner);
        assert_eq!(msg.identifier(), Some("Root"));

        let msg = decode(json!({"command": "OBJECT_CREATE", "identifier": "x", "typeName": "Item"})).unwrap();
        assert_eq!(
            msg,
            Message::ObjectCreate { identifier: "x".into(), type_name: "Item".into() }
        );

        let msg = decode(json!({"command": "SYNC_ACK", "serial": 3})).unwrap();
        assert_eq!(msg.command(), "SYNC_ACK");
    }

    #[test]
    fn test_register() {
        let desc = TypeDescriptor::builder("Item").property("name", ValueKind::String).build();
        let msg = Message::Register {
            types: vec![desc.clone()],
            singletons: BTreeMap::from([(
                "Root".to_string(),
                ObjectRef::new("Root", Some(TypeRef::Full(desc))),
            )]),
        };
        let bytes = msg.to_vec().unwrap();
        assert_eq!(Message::from_slice(&bytes).unwrap(), msg);

        let empty = decode(json!({"command": "REGISTER"})).unwrap();
        assert_eq!(empty, Message::Register { types: vec![], singletons: BTreeMap::new() });
    }

    #[test]
    fn test_invoke_optional_return() {
        let msg = decode(json!({
            "command": "INVOKE", "identifier": "Root", "method": "addOne", "parameters": []
        }))
        .unwrap();
        assert!(matches!(msg, Message::Invoke { return_id: None, .. }));

        let msg = decode(json!({
            "command": "INVOKE", "identifier": "Root", "method": "addOne",
            "parameters": [1, "two"], "return": "r1"
        }))
        .unwrap();
        match msg {
            Message::Invoke { parameters, return_id, .. } => {
                assert_eq!(parameters, vec![json!(1), json!("two")]);
                assert_eq!(return_id.as_deref(), Some("r1"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_invoke_return_omits_empty_fields() {
        let msg = Message::InvokeReturn {
            identifier: "Root".into(),
            return_id: "r1".into(),
            value: None,
            error: None,
        };
        let json: Value = serde_json::from_slice(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(json, json!({"command": "INVOKE_RETURN", "identifier": "Root", "return": "r1"}));
    }

    #[test]
    fn test_emit_defaults_parameters() {
        let msg = decode(json!({"command": "EMIT", "identifier": "a", "method": "died"})).unwrap();
        assert_eq!(
            msg,
            Message::Emit { identifier: "a".into(), method: "died".into(), parameters: vec![] }
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(matches!(
            decode(json!({"command": "EXPLODE", "identifier": "a"})),
            Err(ProtocolError::Json(_))
        ));
        assert!(decode(json!({"identifier": "a"})).is_err());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        assert!(decode(json!({"command": "OBJECT_QUERY"})).is_err());
        assert!(decode(json!({"command": "SYNC"})).is_err());
        assert!(decode(json!({"command": "INVOKE", "identifier": "a", "method": "m"})).is_err());
        assert!(decode(json!({"command": "INVOKE", "identifier": "a", "method": "m", "parameters": {}})).is_err());
    }
}
