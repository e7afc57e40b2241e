//! Property, argument and return values on the owning side.
//!
//! [`Value`] mirrors JSON but can hold live object handles. Embedded objects
//! are discovered through [`VisitObjects`], which stops at the first object
//! boundary: an object's own properties are never walked from its parent.

use crate::error::MethodError;
use crate::object::{Object, ObjectHandle, BackendObject};
use objsync_protocol::{ObjectRef, ValueKind};
use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;

/// A value that may embed object handles.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectHandle),
}

impl Value {
    /// Name of the value's kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts to JSON, encoding each embedded object with `encode_object`.
    pub fn try_to_json<E>(
        &self,
        encode_object: &mut impl FnMut(&ObjectHandle) -> Result<Json, E>,
    ) -> Result<Json, E> {
        Ok(match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Double(d) => Number::from_f64(*d).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(
                items
                    .iter()
                    .map(|v| v.try_to_json(encode_object))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), v.try_to_json(encode_object)?);
                }
                Json::Object(map)
            }
            Value::Object(handle) => encode_object(handle)?,
        })
    }

    /// Converts from JSON, resolving embedded references with `resolve`.
    ///
    /// References that `resolve` cannot find become [`Value::Null`].
    pub fn from_json(
        json: &Json,
        resolve: &mut impl FnMut(&ObjectRef) -> Option<ObjectHandle>,
    ) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Double(n.as_f64().unwrap_or(0.0)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => {
                Value::Array(items.iter().map(|v| Value::from_json(v, resolve)).collect())
            }
            Json::Object(map) => match ObjectRef::from_json(json) {
                Some(reference) => resolve(&reference).map(Value::Object).unwrap_or(Value::Null),
                None => Value::Map(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v, resolve)))
                        .collect(),
                ),
            },
        }
    }
}

/// Traversal over the objects embedded in a value.
pub trait VisitObjects {
    /// Calls `visitor` for every embedded object, without descending into
    /// the objects themselves.
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle));

    /// Collects the embedded objects, in traversal order.
    fn embedded_objects(&self) -> Vec<ObjectHandle> {
        let mut found = Vec::new();
        self.visit_objects(&mut |handle| found.push(handle.clone()));
        found
    }
}

impl VisitObjects for Value {
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle)) {
        match self {
            Value::Array(items) => items.visit_objects(visitor),
            Value::Map(entries) => entries.visit_objects(visitor),
            Value::Object(handle) => visitor(handle),
            _ => {}
        }
    }
}

impl VisitObjects for ObjectHandle {
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle)) {
        visitor(self)
    }
}

impl<T: VisitObjects> VisitObjects for [T] {
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle)) {
        for item in self {
            item.visit_objects(visitor);
        }
    }
}

impl<T: VisitObjects> VisitObjects for Vec<T> {
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle)) {
        self.as_slice().visit_objects(visitor)
    }
}

impl<T: VisitObjects> VisitObjects for Option<T> {
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle)) {
        if let Some(inner) = self {
            inner.visit_objects(visitor);
        }
    }
}

impl<K, T: VisitObjects> VisitObjects for BTreeMap<K, T> {
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle)) {
        for item in self.values() {
            item.visit_objects(visitor);
        }
    }
}

impl<A: VisitObjects, B: VisitObjects> VisitObjects for (A, B) {
    fn visit_objects(&self, visitor: &mut dyn FnMut(&ObjectHandle)) {
        self.0.visit_objects(visitor);
        self.1.visit_objects(visitor);
    }
}

impl VisitObjects for String {
    fn visit_objects(&self, _visitor: &mut dyn FnMut(&ObjectHandle)) {}
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(<$conv>::from(v))
            }
        })*
    };
}

value_from! {
    bool => Bool as bool,
    i32 => Int as i64,
    i64 => Int as i64,
    u32 => Int as i64,
    f32 => Double as f64,
    f64 => Double as f64,
    String => String as String,
    &str => String as String,
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<ObjectHandle> for Value {
    fn from(handle: ObjectHandle) -> Self {
        Value::Object(handle)
    }
}

impl<T: BackendObject> From<&Object<T>> for Value {
    fn from(object: &Object<T>) -> Self {
        Value::Object(object.handle())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(entries: BTreeMap<String, T>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// Conversion out of a [`Value`], used to decode method arguments.
pub trait FromValue: Sized {
    /// Kind reported when the conversion fails.
    const KIND: ValueKind;

    fn from_value(value: &Value) -> Option<Self>;
}

/// Decodes argument `index` or reports a type mismatch.
pub(crate) fn convert<T: FromValue>(index: usize, value: &Value) -> Result<T, MethodError> {
    T::from_value(value).ok_or(MethodError::WrongArgumentType {
        index,
        expected: T::KIND,
        found: value.kind_name(),
    })
}

impl FromValue for Value {
    const KIND: ValueKind = ValueKind::Var;

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const KIND: ValueKind = ValueKind::Int;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            Value::Double(d) => whole_i64(*d),
            _ => None,
        }
    }
}

impl FromValue for i32 {
    const KIND: ValueKind = ValueKind::Int;

    fn from_value(value: &Value) -> Option<Self> {
        i64::from_value(value).and_then(|i| i32::try_from(i).ok())
    }
}

impl FromValue for usize {
    const KIND: ValueKind = ValueKind::Int;

    fn from_value(value: &Value) -> Option<Self> {
        i64::from_value(value).and_then(|i| usize::try_from(i).ok())
    }
}

impl FromValue for f64 {
    const KIND: ValueKind = ValueKind::Double;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for String {
    const KIND: ValueKind = ValueKind::String;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for ObjectHandle {
    const KIND: ValueKind = ValueKind::Object;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(handle) => Some(handle.clone()),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    const KIND: ValueKind = ValueKind::Array;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => items.iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const KIND: ValueKind = T::KIND;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// 2^63, the first double past the end of the `i64` range.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Converts a whole double that fits an `i64` without saturating.
fn whole_i64(d: f64) -> Option<i64> {
    (d.fract() == 0.0 && (-I64_LIMIT..I64_LIMIT).contains(&d)).then_some(d as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tests::Leaf;
    use serde_json::json;

    #[test]
    fn test_visit_stops_at_objects() {
        let inner = Object::new(Leaf::default());
        let outer = Object::new(Leaf {
            label: "outer".into(),
            next: Some(inner.handle()),
        });

        let value = Value::Map(BTreeMap::from([
            ("list".to_string(), Value::from(vec![Value::from(&outer), Value::Int(1)])),
            ("plain".to_string(), Value::from("text")),
        ]));

        let found = value.embedded_objects();
        assert_eq!(found.len(), 1);
        assert!(found[0].ptr_eq(&outer.handle()));
    }

    #[test]
    fn test_to_json_encodes_objects() {
        let leaf = Object::new(Leaf::default());
        let value = Value::from(vec![Value::from(&leaf), Value::Double(1.5), Value::Null]);
        let json = value
            .try_to_json(&mut |_: &ObjectHandle| Ok::<_, ()>(json!({"tag": "object", "identifier": "x"})))
            .unwrap();
        assert_eq!(json, json!([{"tag": "object", "identifier": "x"}, 1.5, null]));
    }

    #[test]
    fn test_from_json_resolves_references() {
        let leaf = Object::new(Leaf::default());
        let handle = leaf.handle();
        let json = json!({
            "known": {"tag": "object", "identifier": "a"},
            "unknown": {"tag": "object", "identifier": "b"},
            "n": 3,
            "f": 0.5,
        });

        let value = Value::from_json(&json, &mut |r: &ObjectRef| (r.identifier == "a").then(|| handle.clone()));
        let Value::Map(map) = value else { panic!("expected map") };
        assert!(matches!(&map["known"], Value::Object(h) if h.ptr_eq(&handle)));
        assert_eq!(map["unknown"], Value::Null);
        assert_eq!(map["n"], Value::Int(3));
        assert_eq!(map["f"], Value::Double(0.5));
    }

    #[test]
    fn test_from_value_conversions() {
        assert_eq!(i64::from_value(&Value::Double(2.0)), Some(2));
        assert_eq!(i64::from_value(&Value::Double(2.5)), None);
        assert_eq!(i64::from_value(&Value::Double(1e19)), None);
        assert_eq!(i64::from_value(&Value::Double(-9.223372036854775808e18)), Some(i64::MIN));
        assert_eq!(i64::from_value(&Value::Double(f64::INFINITY)), None);
        assert_eq!(f64::from_value(&Value::Int(3)), Some(3.0));
        assert_eq!(Option::<String>::from_value(&Value::Null), Some(None));
        assert_eq!(
            Vec::<i32>::from_value(&Value::from(vec![1, 2])),
            Some(vec![1, 2])
        );
        assert_eq!(String::from_value(&Value::Int(1)), None);

        let err = convert::<bool>(2, &Value::from("yes")).unwrap_err();
        assert_eq!(
            err,
            MethodError::WrongArgumentType {
                index: 2,
                expected: ValueKind::Bool,
                found: "string"
            }
        );
    }
}
