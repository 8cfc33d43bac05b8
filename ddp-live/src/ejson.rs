//! Extended JSON value model.
//!
//! Document fields travel over the wire as plain JSON, but in memory they
//! carry richer types. The mapping is symmetric and versionless:
//!
//! ```text
//! in memory              wire
//! ─────────────────────  ─────────────────────────────────────
//! Value::Date(ms)        {"$date": ms}
//! Value::Binary(bytes)   {"$binary": "<base64>"}
//! Value::Number(±inf)    {"$InfNaN": 1 | -1}
//! Value::Number(NaN)     {"$InfNaN": 0}
//! Value::Custom{..}      {"$type": name, "$value": json}
//! Value::Object(m)       {"$escape": m}   when m looks like one of the above
//! ```

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number};

/// A document's field map. Ordered so that encoding is deterministic.
pub type Fields = BTreeMap<String, Value>;

/// Field-level changes. `None` means the field was cleared.
pub type FieldChanges = BTreeMap<String, Option<Value>>;

/// Errors converting wire JSON into [`Value`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EjsonError {
    #[error("$date must be a number, got {0}")]
    InvalidDate(String),
    #[error("$binary must be base64: {0}")]
    InvalidBinary(String),
    #[error("$InfNaN must be 1, -1 or 0, got {0}")]
    InvalidInfNaN(String),
    #[error("$type must be a string")]
    InvalidTypeName,
    #[error("$escape must wrap an object")]
    InvalidEscape,
}

/// An extended JSON value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// Numbers are IEEE doubles, including infinities and NaN.
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(Fields),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Binary(Vec<u8>),
    /// An application-defined type, carried opaquely as its JSON form.
    Custom {
        type_name: String,
        value: serde_json::Value,
    },
}

impl Value {
    /// Build an object value from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Fields> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert a wire JSON value into its in-memory form.
    pub fn from_json(json: serde_json::Value) -> Result<Self, EjsonError> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(f64::NAN))),
            serde_json::Value::String(s) => Ok(Value::String(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            serde_json::Value::Object(map) => Self::from_json_object(map),
        }
    }

    fn from_json_object(mut map: Map<String, serde_json::Value>) -> Result<Self, EjsonError> {
        if map.len() == 1 {
            if let Some(date) = map.get("$date") {
                return date
                    .as_f64()
                    .map(|ms| Value::Date(ms as i64))
                    .ok_or_else(|| EjsonError::InvalidDate(date.to_string()));
            }
            if let Some(binary) = map.get("$binary") {
                let encoded = binary
                    .as_str()
                    .ok_or_else(|| EjsonError::InvalidBinary(binary.to_string()))?;
                return BASE64
                    .decode(encoded)
                    .map(Value::Binary)
                    .map_err(|e| EjsonError::InvalidBinary(e.to_string()));
            }
            if let Some(sign) = map.get("$InfNaN") {
                return match sign.as_f64() {
                    Some(s) if s > 0.0 => Ok(Value::Number(f64::INFINITY)),
                    Some(s) if s < 0.0 => Ok(Value::Number(f64::NEG_INFINITY)),
                    Some(_) => Ok(Value::Number(f64::NAN)),
                    None => Err(EjsonError::InvalidInfNaN(sign.to_string())),
                };
            }
            if let Some(escaped) = map.remove("$escape") {
                // Only one level is unescaped; nested values still convert normally.
                let serde_json::Value::Object(inner) = escaped else {
                    return Err(EjsonError::InvalidEscape);
                };
                let mut fields = Fields::new();
                for (k, v) in inner {
                    fields.insert(k, Value::from_json(v)?);
                }
                return Ok(Value::Object(fields));
            }
        }

        if map.len() == 2 && map.contains_key("$type") && map.contains_key("$value") {
            let type_name = match map.remove("$type") {
                Some(serde_json::Value::String(name)) => name,
                _ => return Err(EjsonError::InvalidTypeName),
            };
            let value = map.remove("$value").unwrap_or(serde_json::Value::Null);
            return Ok(Value::Custom { type_name, value });
        }

        let mut fields = Fields::new();
        for (k, v) in map {
            fields.insert(k, Value::from_json(v)?);
        }
        Ok(Value::Object(fields))
    }

    /// Convert to the wire JSON form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(fields) => {
                let inner: Map<String, serde_json::Value> =
                    fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                if looks_reserved(fields) {
                    let mut wrapper = Map::new();
                    wrapper.insert("$escape".to_string(), serde_json::Value::Object(inner));
                    serde_json::Value::Object(wrapper)
                } else {
                    serde_json::Value::Object(inner)
                }
            }
            Value::Date(ms) => single("$date", serde_json::Value::Number(Number::from(*ms))),
            Value::Binary(bytes) => single("$binary", serde_json::Value::String(BASE64.encode(bytes))),
            Value::Custom { type_name, value } => {
                let mut map = Map::new();
                map.insert("$type".to_string(), serde_json::Value::String(type_name.clone()));
                map.insert("$value".to_string(), value.clone());
                serde_json::Value::Object(map)
            }
        }
    }
}

fn single(key: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    serde_json::Value::Object(map)
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.is_nan() {
        return single("$InfNaN", serde_json::Value::Number(Number::from(0)));
    }
    if n.is_infinite() {
        let sign = if n > 0.0 { 1 } else { -1 };
        return single("$InfNaN", serde_json::Value::Number(Number::from(sign)));
    }
    // Integral values inside the exact-double range keep their integer spelling.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return serde_json::Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Would this plain object be mistaken for a typed value on the wire?
fn looks_reserved(fields: &Fields) -> bool {
    match fields.len() {
        1 => ["$date", "$binary", "$InfNaN", "$escape"]
            .iter()
            .any(|k| fields.contains_key(*k)),
        2 => fields.contains_key("$type") && fields.contains_key("$value"),
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // NaN equals NaN for document comparison purposes.
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (
                Value::Custom { type_name: ta, value: va },
                Value::Custom { type_name: tb, value: vb },
            ) => ta == tb && va == vb,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).map_err(serde::de::Error::custom)
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Object(fields)
    }
}

/// Build a [`Fields`] map from key/value pairs.
pub fn fields<K, V, I>(entries: I) -> Fields
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json_roundtrip() {
        let wire = json!({"a": 1, "b": [true, null, "x"], "c": {"d": 2.5}});
        let value = Value::from_json(wire.clone()).unwrap();
        assert_eq!(value.to_json(), wire);
    }

    #[test]
    fn test_date_conversion() {
        let value = Value::from_json(json!({"$date": 1_700_000_000_000i64})).unwrap();
        assert_eq!(value, Value::Date(1_700_000_000_000));
        assert_eq!(value.to_json(), json!({"$date": 1_700_000_000_000i64}));
    }

    #[test]
    fn test_binary_conversion() {
        let value = Value::Binary(vec![0, 1, 2, 250]);
        let wire = value.to_json();
        assert_eq!(wire, json!({"$binary": "AAEC+g=="}));
        assert_eq!(Value::from_json(wire).unwrap(), value);
    }

    #[test]
    fn test_inf_nan() {
        assert_eq!(Value::Number(f64::INFINITY).to_json(), json!({"$InfNaN": 1}));
        assert_eq!(Value::Number(f64::NEG_INFINITY).to_json(), json!({"$InfNaN": -1}));
        let nan = Value::from_json(json!({"$InfNaN": 0})).unwrap();
        assert_eq!(nan, Value::Number(f64::NAN));
    }

    #[test]
    fn test_custom_type() {
        let wire = json!({"$type": "point", "$value": {"x": 1, "y": 2}});
        let value = Value::from_json(wire.clone()).unwrap();
        assert!(matches!(&value, Value::Custom { type_name, .. } if type_name == "point"));
        assert_eq!(value.to_json(), wire);
    }

    #[test]
    fn test_escape_reserved_object() {
        // A user object that happens to look like a date must survive.
        let value = Value::object([("$date", Value::from("not a date"))]);
        let wire = value.to_json();
        assert_eq!(wire, json!({"$escape": {"$date": "not a date"}}));
        assert_eq!(Value::from_json(wire).unwrap(), value);
    }

    #[test]
    fn test_invalid_binary_rejected() {
        let err = Value::from_json(json!({"$binary": "***"})).unwrap_err();
        assert!(matches!(err, EjsonError::InvalidBinary(_)));
    }

    #[test]
    fn test_integers_stay_integers() {
        assert_eq!(Value::from(42).to_json().to_string(), "42");
        assert_eq!(Value::from(1.5).to_json().to_string(), "1.5");
    }

    #[test]
    fn test_fields_helper() {
        let f = fields([("name", "Bob")]);
        assert_eq!(f.get("name"), Some(&Value::from("Bob")));
    }
}
