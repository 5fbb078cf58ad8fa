//! # Attribute Conversion
//!
//! The editor model carries attributes as JSON values, the shared document
//! carries them as `yrs::Any`. All conversions between the two worlds live
//! here, together with the helpers for the synthetic `ychange`
//! attribute/mark injected during historical renders.

use manuscript_model::{Attrs, Mark};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use yrs::{Any, Out};

/// Formatting attribute map as the shared text type consumes it.
pub(crate) type FormatAttrs = HashMap<Arc<str>, Any>;

pub(crate) fn value_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        // Numbers travel as doubles, matching the JSON data model of the
        // shared document.
        Value::Number(n) => Any::Number(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(
            items
                .iter()
                .map(value_to_any)
                .collect::<Vec<_>>()
                .into(),
        ),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_any(v)))
                .collect(),
        )),
    }
}

pub(crate) fn any_to_value(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => {
            // Doubles that are exact integers read back as integers so that
            // round trips stay structurally equal.
            if n.fract() == 0.0 && n.abs() < 9.0e15 {
                Value::from(*n as i64)
            } else {
                Value::from(*n)
            }
        }
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::from(s.as_ref()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_value).collect()),
        Any::Map(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map.iter() {
                object.insert(key.clone(), any_to_value(value));
            }
            Value::Object(object)
        }
    }
}

/// Attribute values read from the shared document. Non-plain values (nested
/// shared types) cannot appear as element attributes and read as null.
pub(crate) fn out_to_value(out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_value(any),
        _ => Value::Null,
    }
}

/// Element attributes are stored as JSON-encoded strings (the shared XML
/// attribute API only carries `String`), so attribute values round-trip
/// through `serde_json` rather than through `Any`/`Out` directly.
pub(crate) fn any_to_attr_string(any: &Any) -> String {
    let mut buf = String::new();
    any.to_json(&mut buf);
    buf
}

pub(crate) fn attr_string_to_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

pub(crate) fn attrs_to_any(attrs: &Attrs) -> Any {
    Any::Map(Arc::new(
        attrs
            .iter()
            .map(|(k, v)| (k.clone(), value_to_any(v)))
            .collect(),
    ))
}

/// JSON object → model attribute map; anything else → empty.
pub(crate) fn value_to_attrs(value: &Value) -> Attrs {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Attrs::new(),
    }
}

/// Per-mark attribute maps of a text delta chunk, keyed by mark name.
pub(crate) fn format_attr_map(attrs: Option<&FormatAttrs>) -> BTreeMap<String, Attrs> {
    let mut out = BTreeMap::new();
    if let Some(attrs) = attrs {
        for (name, value) in attrs.iter() {
            out.insert(name.to_string(), value_to_attrs(&any_to_value(value)));
        }
    }
    out
}

/// Marks of a text node as shared-text formatting attributes, skipping the
/// synthetic `ychange` mark.
pub(crate) fn marks_to_attrs(marks: &[Mark]) -> FormatAttrs {
    marks
        .iter()
        .filter(|mark| mark.name != crate::YCHANGE)
        .map(|mark| {
            (
                Arc::<str>::from(mark.name.as_str()),
                attrs_to_any(&mark.attrs),
            )
        })
        .collect()
}
