use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("payload has no \"{0}\" field")]
    MissingField(String),
}

/// Pull the reading out of a Victron payload.
///
/// `{"value": 12.3}` yields the scalar. `{"value": [{"soc": 87.4}, ...]}`
/// yields the named field of the first element, or nothing if that element
/// lacks it. Every other shape of `value` yields nothing.
pub fn decode_value(payload: &[u8], field: Option<&str>) -> Result<Option<Value>, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::InvalidJson("empty payload".to_string()));
    }

    let doc = serde_json::from_slice::<Value>(payload)
                .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let value = match doc.get("value") {
        Some(v) => v,
        None => { return Err(DecodeError::MissingField("value".to_string())); }
    };

    match value {
        Value::Array(list) => {
            let Some(first) = list.first() else {
                return Ok(None);
            };
            let Some(field) = field else {
                return Ok(None);
            };
            return Ok(first.get(field).filter(|v| is_scalar(v)).cloned());
        },
        v if is_scalar(v) => {
            return Ok(Some(v.clone()));
        },
        _ => {
            return Ok(None);
        }
    }
}

fn is_scalar(v: &Value) -> bool {
    return matches!(v, Value::Number(_) | Value::String(_) | Value::Bool(_));
}

pub fn decode_number(payload: &[u8], field: Option<&str>) -> Result<Option<f64>, DecodeError> {
    let value = decode_value(payload, field)?;
    return Ok(value.and_then(|v| v.as_f64()));
}

/// Relay state, `1` or `true` is on and everything else off
pub fn decode_switch(payload: &[u8]) -> Result<Option<bool>, DecodeError> {
    let value = decode_value(payload, Some("value"))?;
    let on = match value {
        Some(Value::Bool(b)) => Some(b),
        Some(v) => v.as_f64().map(|v| v == 1.0),
        None => None,
    };
    return Ok(on);
}
