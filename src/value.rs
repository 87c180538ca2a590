//! Host-side value model for data crossing the script boundary.
//!
//! Script -> host conversion lives in each engine backend and always lands
//! here; host -> script goes through [`ScriptValue::to_script_literal`] since
//! the only way into an engine is source text.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Largest integer a script number represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Nesting depth past which engine values are no longer walked.
pub const MAX_CONVERSION_DEPTH: usize = 64;

/// Arrays whose `length` exceeds this are not walked element by element.
pub const MAX_CONVERSION_ELEMENTS: u32 = 1 << 20;

/// The element count to walk for a script array reporting `length`, or
/// `None` when the length is not a valid index count or exceeds
/// [`MAX_CONVERSION_ELEMENTS`].
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn walkable_length(length: f64) -> Option<u32> {
    if (0.0..=f64::from(MAX_CONVERSION_ELEMENTS)).contains(&length) && length.fract() == 0.0 {
        Some(length as u32)
    } else {
        None
    }
}

/// Engine data that has no structural host representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpaqueValue {
    /// Engine type tag, e.g. `function`, `symbol`, `promise`.
    pub kind: String,
    /// The engine's own string coercion of the value.
    pub description: String,
}

impl OpaqueValue {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ScriptValue>),
    /// Ordered entries; keys are unique.
    Map(Vec<(String, ScriptValue)>),
    Opaque(OpaqueValue),
}

impl ScriptValue {
    /// Normalize a script number: integral values within the exact range
    /// become `Int`, everything else stays `Float`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn from_f64(number: f64) -> Self {
        if number.is_finite() && number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER as f64
        {
            Self::Int(number as i64)
        } else {
            Self::Float(number)
        }
    }

    /// Build a map, keeping the first position of a repeated key and the
    /// last value written to it.
    pub fn map_from<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Self)>,
    {
        let mut out: Vec<(String, Self)> = Vec::new();
        for (key, value) in entries {
            let key = key.into();
            if let Some(slot) = out.iter_mut().find(|(existing, _)| *existing == key) {
                slot.1 = value;
            } else {
                out.push((key, value));
            }
        }
        Self::Map(out)
    }

    pub fn opaque(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Opaque(OpaqueValue::new(kind, description))
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&[(String, Self)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a map entry by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        self.as_map()?
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value)
    }

    /// Typed extraction; `None` when the shape does not match `T`.
    #[must_use]
    pub fn convert<T: FromScriptValue>(&self) -> Option<T> {
        T::from_script_value(self)
    }

    /// Extraction through serde for arbitrary deserializable types.
    #[must_use]
    pub fn deserialize_into<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.to_json()).ok()
    }

    /// Render as script source that evaluates back to an equal value.
    ///
    /// Integers beyond `MAX_SAFE_INTEGER` lose precision once parsed by the
    /// engine; opaque values fall back to their quoted description.
    #[must_use]
    pub fn to_script_literal(&self) -> String {
        let mut out = String::new();
        self.write_literal(&mut out);
        out
    }

    fn write_literal(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(value) => out.push_str(if *value { "true" } else { "false" }),
            Self::Int(value) => out.push_str(&value.to_string()),
            Self::Float(value) => out.push_str(&float_literal(*value)),
            Self::Str(value) => out.push_str(&quote(value)),
            Self::List(items) => {
                out.push('[');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.write_literal(out);
                }
                out.push(']');
            }
            Self::Map(entries) => {
                out.push('{');
                for (index, (key, item)) in entries.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    // A literal `__proto__` key sets the prototype; the
                    // computed form defines an own property.
                    if key == "__proto__" {
                        out.push('[');
                        out.push_str(&quote(key));
                        out.push(']');
                    } else {
                        out.push_str(&quote(key));
                    }
                    out.push_str(": ");
                    item.write_literal(out);
                }
                out.push('}');
            }
            Self::Opaque(opaque) => out.push_str(&quote(&opaque.description)),
        }
    }

    /// JSON view. Non-finite floats become `null`, opaque values their
    /// description, and map order follows `serde_json`'s map.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Int(value) => Value::from(*value),
            Self::Float(value) => serde_json::Number::from_f64(*value).map_or(Value::Null, Value::Number),
            Self::Str(value) => Value::String(value.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Self::Opaque(opaque) => Value::String(opaque.description.clone()),
        }
    }
}

fn quote(text: &str) -> String {
    serde_json::Value::from(text).to_string()
}

fn float_literal(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else {
        // Debug gives the shortest round-trip form and switches to exponent
        // notation for very large or small magnitudes.
        format!("{value:?}")
    }
}

impl PartialEq for ScriptValue {
    #[allow(clippy::cast_precision_loss, clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter()
                            .find(|(other_key, _)| other_key == key)
                            .is_some_and(|(_, other_value)| other_value == value)
                    })
            }
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(value) => f.write_str(value),
            Self::Opaque(opaque) => f.write_str(&opaque.description),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for ScriptValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Int(value) => serializer.serialize_i64(*value),
            Self::Float(value) if value.is_finite() => serializer.serialize_f64(*value),
            Self::Float(_) => serializer.serialize_unit(),
            Self::Str(value) => serializer.serialize_str(value),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Self::Opaque(opaque) => serializer.serialize_str(&opaque.description),
        }
    }
}

impl From<serde_json::Value> for ScriptValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Number(number) => number.as_i64().map_or_else(
                || Self::from_f64(number.as_f64().unwrap_or(f64::NAN)),
                Self::Int,
            ),
            Value::String(value) => Self::Str(value),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => {
                Self::Map(entries.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ScriptValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for ScriptValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for ScriptValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Typed extraction from a [`ScriptValue`].
pub trait FromScriptValue: Sized {
    fn from_script_value(value: &ScriptValue) -> Option<Self>;
}

impl FromScriptValue for ScriptValue {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromScriptValue for bool {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FromScriptValue for i64 {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value.as_i64()
    }
}

impl FromScriptValue for i32 {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value.as_i64().and_then(|n| Self::try_from(n).ok())
    }
}

impl FromScriptValue for u64 {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value.as_i64().and_then(|n| Self::try_from(n).ok())
    }
}

impl FromScriptValue for f64 {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value.as_f64()
    }
}

impl FromScriptValue for String {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value.as_str().map(ToString::to_string)
    }
}

impl<T: FromScriptValue> FromScriptValue for Option<T> {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        if value.is_null() {
            Some(None)
        } else {
            T::from_script_value(value).map(Some)
        }
    }
}

impl<T: FromScriptValue> FromScriptValue for Vec<T> {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value.as_list()?.iter().map(T::from_script_value).collect()
    }
}

impl<T: FromScriptValue> FromScriptValue for BTreeMap<String, T> {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value
            .as_map()?
            .iter()
            .map(|(key, item)| T::from_script_value(item).map(|item| (key.clone(), item)))
            .collect()
    }
}

impl<T: FromScriptValue> FromScriptValue for HashMap<String, T> {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        value
            .as_map()?
            .iter()
            .map(|(key, item)| T::from_script_value(item).map(|item| (key.clone(), item)))
            .collect()
    }
}

impl FromScriptValue for serde_json::Value {
    fn from_script_value(value: &ScriptValue) -> Option<Self> {
        Some(value.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_map() -> ScriptValue {
        ScriptValue::map_from([
            ("name", ScriptValue::from("pi")),
            ("digits", ScriptValue::from(vec![3, 1, 4])),
            ("exact", ScriptValue::Bool(false)),
        ])
    }

    #[test]
    fn numbers_normalize_to_int_when_integral() {
        assert_eq!(ScriptValue::from_f64(3.0).as_i64(), Some(3));
        assert!(matches!(ScriptValue::from_f64(3.5), ScriptValue::Float(_)));
        assert!(matches!(ScriptValue::from_f64(1e300), ScriptValue::Float(_)));
        assert!(matches!(ScriptValue::from_f64(f64::NAN), ScriptValue::Float(_)));
        assert_eq!(ScriptValue::from_f64(-0.0).as_i64(), Some(0));
    }

    #[test]
    fn int_and_float_compare_numerically() {
        assert_eq!(ScriptValue::Int(1), ScriptValue::Float(1.0));
        assert_ne!(ScriptValue::Int(1), ScriptValue::Float(1.5));
        assert_ne!(ScriptValue::Int(1), ScriptValue::from("1"));
    }

    #[test]
    fn map_equality_ignores_key_order() {
        let forward = ScriptValue::map_from([("a", ScriptValue::Int(1)), ("b", ScriptValue::Int(2))]);
        let reverse = ScriptValue::map_from([("b", ScriptValue::Int(2)), ("a", ScriptValue::Int(1))]);
        assert_eq!(forward, reverse);

        let different = ScriptValue::map_from([("a", ScriptValue::Int(1)), ("c", ScriptValue::Int(2))]);
        assert_ne!(forward, different);
    }

    #[test]
    fn map_from_keeps_keys_unique() {
        let value = ScriptValue::map_from([
            ("a", ScriptValue::Int(1)),
            ("b", ScriptValue::Int(2)),
            ("a", ScriptValue::Int(3)),
        ]);
        let entries = value.as_map().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "a");
        assert_eq!(value.get("a"), Some(&ScriptValue::Int(3)));
    }

    #[test]
    fn proto_key_renders_as_computed_property() {
        let value = ScriptValue::map_from([("__proto__", ScriptValue::Int(1)), ("a", ScriptValue::Null)]);
        assert_eq!(value.to_script_literal(), r#"{["__proto__"]: 1, "a": null}"#);
    }

    #[test]
    fn walkable_length_rejects_oversized_and_invalid_lengths() {
        assert_eq!(walkable_length(0.0), Some(0));
        assert_eq!(walkable_length(3.0), Some(3));
        assert_eq!(walkable_length(f64::from(MAX_CONVERSION_ELEMENTS)), Some(MAX_CONVERSION_ELEMENTS));
        assert_eq!(walkable_length(f64::from(MAX_CONVERSION_ELEMENTS) + 1.0), None);
        assert_eq!(walkable_length(4_294_967_295.0), None);
        assert_eq!(walkable_length(-1.0), None);
        assert_eq!(walkable_length(1.5), None);
        assert_eq!(walkable_length(f64::NAN), None);
    }

    #[test]
    fn literal_rendering_covers_every_shape() {
        assert_eq!(ScriptValue::Null.to_script_literal(), "null");
        assert_eq!(ScriptValue::Bool(true).to_script_literal(), "true");
        assert_eq!(ScriptValue::Int(-7).to_script_literal(), "-7");
        assert_eq!(ScriptValue::Float(0.1).to_script_literal(), "0.1");
        assert_eq!(ScriptValue::Float(f64::NAN).to_script_literal(), "NaN");
        assert_eq!(
            ScriptValue::Float(f64::NEG_INFINITY).to_script_literal(),
            "-Infinity"
        );
        assert_eq!(
            sample_map().to_script_literal(),
            r#"{"name": "pi", "digits": [3, 1, 4], "exact": false}"#
        );
    }

    #[test]
    fn literal_rendering_escapes_quotes_and_control_characters() {
        let value = ScriptValue::from("say \"hi\"\n\\done");
        assert_eq!(value.to_script_literal(), r#""say \"hi\"\n\\done""#);

        let keyed = ScriptValue::map_from([("it's \"quoted\"", ScriptValue::Null)]);
        assert_eq!(keyed.to_script_literal(), r#"{"it's \"quoted\"": null}"#);
    }

    #[test]
    fn opaque_literal_falls_back_to_quoted_description() {
        let value = ScriptValue::opaque("function", "function f() {}");
        assert_eq!(value.to_script_literal(), r#""function f() {}""#);
    }

    #[test]
    fn json_conversion_preserves_structure() {
        let value = ScriptValue::from(json!({
            "list": [1, 2.5, "x", null, true],
            "nested": { "k": [] },
            "big": 18_446_744_073_709_551_615_u64,
        }));
        assert_eq!(value.get("list").unwrap().as_list().unwrap().len(), 5);
        assert!(matches!(value.get("big"), Some(ScriptValue::Float(_))));
        assert_eq!(
            value.to_json()["nested"],
            json!({ "k": [] }),
        );
    }

    #[test]
    fn serialize_preserves_map_order() {
        let rendered = serde_json::to_string(&sample_map()).unwrap();
        assert_eq!(rendered, r#"{"name":"pi","digits":[3,1,4],"exact":false}"#);

        let parsed: ScriptValue = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, sample_map());
    }

    #[test]
    fn typed_extraction_returns_none_on_shape_mismatch() {
        let value = sample_map();
        assert_eq!(value.get("name").and_then(ScriptValue::convert::<String>), Some("pi".to_string()));
        assert_eq!(
            value.get("digits").and_then(ScriptValue::convert::<Vec<i64>>),
            Some(vec![3, 1, 4])
        );
        assert_eq!(value.get("digits").and_then(ScriptValue::convert::<Vec<String>>), None);
        assert_eq!(value.convert::<bool>(), None);
        assert_eq!(ScriptValue::Null.convert::<Option<i64>>(), Some(None));
        assert_eq!(ScriptValue::Int(5).convert::<f64>(), Some(5.0));
        assert_eq!(ScriptValue::Int(-1).convert::<u64>(), None);

        let map: BTreeMap<String, ScriptValue> = value.convert().unwrap();
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn deserialize_into_user_types() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Pi {
            name: String,
            digits: Vec<u8>,
        }

        let pi: Pi = sample_map().deserialize_into().unwrap();
        assert_eq!(
            pi,
            Pi {
                name: "pi".to_string(),
                digits: vec![3, 1, 4]
            }
        );
    }

    #[test]
    fn display_renders_strings_raw_and_structures_as_json() {
        assert_eq!(ScriptValue::from("plain").to_string(), "plain");
        assert_eq!(ScriptValue::from(vec![1, 2]).to_string(), "[1,2]");
        assert_eq!(ScriptValue::Null.to_string(), "null");
    }
}
