//! Plain JSON <-> `yrs` values.
//!
//! Notebook structure (cells, sources, metadata maps, output arrays) is built
//! by [`NotebookDoc`](crate::NotebookDoc); everything below that level, such as
//! an output's `data` bundle or a metadata value, is stored as a plain `Any`.

use std::collections::HashMap;

use base64::Engine as _;
use serde_json::Value;
use yrs::types::ToJson;
use yrs::{Any, Array, GetString, Out, ReadTxn};

pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => n.as_f64().map(Any::Number).unwrap_or(Any::Null),
        },
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(entries) => Any::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<HashMap<_, _>>()
                .into(),
        ),
    }
}

pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::Number((*i).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b.as_ref())),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

pub fn out_to_json<T: ReadTxn>(value: &Out, txn: &T) -> Value {
    match value {
        Out::Any(any) => any_to_json(any),
        Out::YText(text) => Value::String(text.get_string(txn)),
        Out::YArray(array) => Value::Array(array.iter(txn).map(|v| out_to_json(&v, txn)).collect()),
        Out::YMap(map) => any_to_json(&map.to_json(txn)),
        _ => Value::Null,
    }
}

/// nbformat allows multiline strings either whole or split into lines.
pub fn source_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(lines)) => lines.iter().filter_map(Value::as_str).collect(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_values_convert_both_ways() {
        let value = json!({
            "text/plain": "4",
            "count": 3,
            "ratio": 0.5,
            "flags": [true, null],
            "nested": {"a": {"b": "c"}}
        });
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }

    #[test]
    fn test_buffers_become_base64() {
        let any = Any::Buffer(vec![1u8, 2, 3].into());
        assert_eq!(any_to_json(&any), json!("AQID"));
    }

    #[test]
    fn test_source_text_joins_lines() {
        assert_eq!(source_text(Some(&json!(["a\n", "b"]))), "a\nb");
        assert_eq!(source_text(Some(&json!("x = 1"))), "x = 1");
        assert_eq!(source_text(None), "");
    }
}
