//! Values as seen by the consuming side.

use crate::proxy::Proxy;
use objsync_protocol::ObjectRef;
use serde_json::{Map, Number, Value as Json};
use std::collections::BTreeMap;

/// A JSON-like value whose embedded object references are live proxies.
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
    Object(Proxy),
}

impl Value {
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

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Double(d) => whole_i64(*d),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Value::Object(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Converts from JSON, turning embedded references into proxies with
    /// `resolve`. Unresolvable references become [`Value::Null`].
    pub fn from_json(json: &Json, resolve: &mut impl FnMut(&ObjectRef) -> Option<Proxy>) -> Value {
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
                Some(reference) => resolve(&reference).map(Value::Object).unwrap_or_default(),
                None => Value::Map(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v, resolve)))
                        .collect(),
                ),
            },
        }
    }

    /// Converts to JSON. Proxies are sent as bare references; the owning
    /// side already knows their types.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Double(d) => Number::from_f64(*d).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json());
                }
                Json::Object(map)
            }
            Value::Object(proxy) => ObjectRef::new(proxy.identifier(), None).to_json(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Value::Object(proxy)
    }
}

impl From<&Proxy> for Value {
    fn from(proxy: &Proxy) -> Self {
        Value::Object(proxy.clone())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
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
    use crate::proxy::ProxyTable;
    use objsync_protocol::{TypeDescriptor, TypeRef};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_from_json_resolves_references() {
        let mut table = ProxyTable::new();
        let json = json!({
            "items": [1, 2.5, "x", null],
            "child": {"tag": "object", "identifier": "c1", "type": {"name": "Leaf", "omitted": true}},
            "ghost": {"tag": "object", "identifier": "gone"}
        });

        let mut seen = Vec::new();
        let value = Value::from_json(&json, &mut |r: &ObjectRef| {
            seen.push((r.identifier.clone(), r.type_ref.clone()));
            (r.identifier == "c1")
                .then(|| table.insert(&r.identifier, Arc::new(TypeDescriptor::empty("Leaf")), false))
        });

        let map = value.as_map().unwrap();
        assert_eq!(
            map["items"],
            Value::Array(vec![
                Value::Int(1),
                Value::Double(2.5),
                Value::from("x"),
                Value::Null
            ])
        );
        assert_eq!(map["child"].as_proxy().unwrap().identifier(), "c1");
        assert!(map["ghost"].is_null());
        assert_eq!(seen[0].1, Some(TypeRef::omitted("Leaf")));
    }

    #[test]
    fn test_to_json_sends_bare_references() {
        let mut table = ProxyTable::new();
        let proxy = table.insert("c1", Arc::new(TypeDescriptor::empty("Leaf")), false);
        let value = Value::from(vec![Value::from(&proxy), Value::from(f64::NAN), Value::from(7)]);
        assert_eq!(
            value.to_json(),
            json!([{"tag": "object", "identifier": "c1"}, null, 7])
        );
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Double(4.0).as_i64(), Some(4));
        assert_eq!(Value::Double(4.5).as_i64(), None);
        assert_eq!(Value::Double(9.3e18).as_i64(), None);
        assert_eq!(Value::Double(-1e300).as_i64(), None);
        assert_eq!(Value::Double(-9.223372036854775808e18).as_i64(), Some(i64::MIN));
        assert_eq!(Value::Int(2).as_f64(), Some(2.0));
        assert_eq!(Value::from(Some("a")).as_str(), Some("a"));
        assert!(Value::from(None::<i64>).is_null());
        assert_eq!(Value::from(true).as_bool(), Some(true));
    }
}
