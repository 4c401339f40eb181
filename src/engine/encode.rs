//! Result encoder — the Rust half of the success-path serialization
//! contract.
//!
//! The JS bridge owns structural encoding (cycle markers, BigInt/function/
//! symbol placeholders, the unserializable fallback) because only the
//! engine side can see the live values. This half owns the
//! undefined-vs-value tri-state, the size cap, and the conversion back to
//! `serde_json::Value` — plus the JS↔JSON converters the capability bridge
//! uses.

use rquickjs::{Ctx, IntoJs, Object, Value};

/// Message placed in the truncation wrapper that replaces an oversized
/// result.
const PREVIEW_NOTE: &str = "Result exceeded the size cap and was truncated";

/// Decoded success outcome. `value` is what lands in `envelope.result`.
pub struct DecodedResult {
    pub value: serde_json::Value,
    pub truncated: bool,
    pub was_undefined: bool,
}

/// Turns the settle payload (already safely serialized by the bridge) into
/// the envelope's `result`. `None` means the script completed without an
/// explicit return value.
///
/// This never fails: an oversized payload becomes a truncation wrapper
/// carrying the original size and a prefix preview, and unparseable text
/// becomes an unserializable marker.
pub fn decode_result(payload: Option<String>, max_chars: usize) -> DecodedResult {
    let Some(encoded) = payload else {
        return DecodedResult {
            value: serde_json::Value::Null,
            truncated: false,
            was_undefined: true,
        };
    };

    let char_count = encoded.chars().count();
    if char_count > max_chars {
        let cut = encoded
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(encoded.len());
        let preview = encoded[..cut].to_string();
        return DecodedResult {
            value: serde_json::json!({
                "truncated": true,
                "originalSize": char_count,
                "preview": preview,
                "message": PREVIEW_NOTE,
            }),
            truncated: true,
            was_undefined: false,
        };
    }

    match serde_json::from_str(&encoded) {
        Ok(value) => DecodedResult {
            value,
            truncated: false,
            was_undefined: false,
        },
        // The bridge only emits JSON.stringify output, so this is a
        // should-not-happen path; degrade to a marker rather than failing.
        Err(_) => DecodedResult {
            value: serde_json::json!({
                "_unserializable": true,
                "preview": encoded.chars().take(500).collect::<String>(),
            }),
            truncated: false,
            was_undefined: false,
        },
    }
}

/// Convert a serde_json::Value to a rquickjs Value.
pub fn json_to_js<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Ok(Value::new_int(ctx.clone(), i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::new_float(ctx.clone(), f))
            } else {
                Ok(Value::new_null(ctx.clone()))
            }
        }
        serde_json::Value::String(s) => s.clone().into_js(ctx),
        serde_json::Value::Array(arr) => {
            let js_arr = rquickjs::Array::new(ctx.clone())?;
            for (i, v) in arr.iter().enumerate() {
                let js_v = json_to_js(ctx, v)?;
                js_arr.set(i, js_v)?;
            }
            Ok(js_arr.into_value())
        }
        serde_json::Value::Object(obj) => {
            let js_obj = Object::new(ctx.clone())?;
            for (k, v) in obj {
                let js_v = json_to_js(ctx, v)?;
                js_obj.set(k.as_str(), js_v)?;
            }
            Ok(js_obj.into_value())
        }
    }
}

/// Convert a rquickjs Value to a serde_json::Value.
pub fn js_to_json(value: &Value<'_>) -> rquickjs::Result<serde_json::Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(serde_json::json!(f));
    }
    if let Some(s) = value.as_string() {
        let s = s.to_string()?;
        return Ok(serde_json::Value::String(s));
    }
    if let Some(arr) = value.as_array() {
        let mut result = Vec::new();
        for i in 0..arr.len() {
            let v: Value<'_> = arr.get(i)?;
            result.push(js_to_json(&v)?);
        }
        return Ok(serde_json::Value::Array(result));
    }
    if let Some(obj) = value.as_object() {
        let mut result = serde_json::Map::new();
        for item in obj.props::<String, Value<'_>>() {
            let (k, v) = item?;
            result.insert(k, js_to_json(&v)?);
        }
        return Ok(serde_json::Value::Object(result));
    }
    // Fallback for functions, symbols, etc.
    Ok(serde_json::Value::Null)
}
