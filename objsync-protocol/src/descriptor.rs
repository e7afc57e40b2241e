//! Type descriptors and embedded object references.
//!
//! A [`TypeDescriptor`] is the structural description of an object type:
//! its properties, methods and signals. Descriptors travel inside object
//! references, either in full or elided to just their name once the peer
//! is known to have seen them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Element kind of a property, parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Int,
    Double,
    Bool,
    Object,
    Array,
    Map,
    /// Any JSON value.
    Var,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::Bool => "bool",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::Map => "map",
            ValueKind::Var => "var",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    #[serde(default)]
    pub writable: bool,
}

/// A method declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ValueKind>,
}

/// A named signal parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
}

/// A signal declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDescriptor>,
}

/// Structural description of an object type.
///
/// Immutable once published; identified on the wire by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
    #[serde(default)]
    pub signals: Vec<SignalDescriptor>,
}

impl TypeDescriptor {
    /// Starts building a descriptor for the named type.
    pub fn builder(name: impl Into<String>) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            descriptor: TypeDescriptor::empty(name),
        }
    }

    /// A descriptor with no members.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            methods: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Returns a copy of this descriptor published under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// Returns the conventional setter method name for a writable property.
///
/// `count` is written through `setCount`.
pub fn setter_name(property: &str) -> String {
    let mut chars = property.chars();
    match chars.next() {
        Some(first) => format!("set{}{}", first.to_uppercase(), chars.as_str()),
        None => "set".to_string(),
    }
}

/// Builder for [`TypeDescriptor`].
#[derive(Debug, Clone)]
pub struct TypeDescriptorBuilder {
    descriptor: TypeDescriptor,
}

impl TypeDescriptorBuilder {
    /// Declares a read-only property.
    pub fn property(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.descriptor.properties.push(PropertyDescriptor {
            name: name.into(),
            kind,
            writable: false,
        });
        self
    }

    /// Declares a writable property along with its `set<Name>` method.
    pub fn writable_property(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        let name = name.into();
        let setter = setter_name(&name);
        self.descriptor.properties.push(PropertyDescriptor {
            name,
            kind,
            writable: true,
        });
        self.method(setter, &[kind])
    }

    /// Declares a method.
    pub fn method(mut self, name: impl Into<String>, params: &[ValueKind]) -> Self {
        self.descriptor.methods.push(MethodDescriptor {
            name: name.into(),
            params: params.to_vec(),
        });
        self
    }

    /// Declares a signal with named parameters.
    pub fn signal(mut self, name: impl Into<String>, params: &[(&str, ValueKind)]) -> Self {
        self.descriptor.signals.push(SignalDescriptor {
            name: name.into(),
            params: params
                .iter()
                .map(|(name, kind)| ParamDescriptor {
                    name: (*name).to_string(),
                    kind: *kind,
                })
                .collect(),
        });
        self
    }

    pub fn build(self) -> TypeDescriptor {
        self.descriptor
    }
}

/// Marker sent in place of a descriptor the peer already has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedType {
    pub name: String,
    pub omitted: bool,
}

/// The `type` of an object reference: full or elided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeRef {
    // Must come first: a full descriptor never carries `omitted`.
    Omitted(OmittedType),
    Full(TypeDescriptor),
}

impl TypeRef {
    pub fn omitted(name: impl Into<String>) -> Self {
        TypeRef::Omitted(OmittedType {
            name: name.into(),
            omitted: true,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            TypeRef::Omitted(o) => &o.name,
            TypeRef::Full(d) => &d.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectTag {
    #[serde(rename = "object")]
    Object,
}

/// An object reference embedded in a property value or argument.
///
/// Wire shape: `{"tag":"object","identifier":"...","type":{...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub tag: ObjectTag,
    pub identifier: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_ref: Option<TypeRef>,
}

impl ObjectRef {
    pub fn new(identifier: impl Into<String>, type_ref: Option<TypeRef>) -> Self {
        Self {
            tag: ObjectTag::Object,
            identifier: identifier.into(),
            type_ref,
        }
    }

    /// Returns whether a JSON value is shaped like an object reference.
    pub fn is_reference(value: &Value) -> bool {
        value.get("tag").and_then(Value::as_str) == Some("object")
    }

    /// Parses an embedded reference, or `None` if `value` is ordinary data.
    pub fn from_json(value: &Value) -> Option<Self> {
        if !Self::is_reference(value) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_json(&self) -> Value {
        // Serializing plain strings and enums into a Value cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
