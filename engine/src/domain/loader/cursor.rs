//! Opaque pagination cursors
//!
//! A cursor is the URL-safe base64 of a JSON object holding the sort values of
//! one row, keyed by sortable name.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

use crate::data::error::{EngineError, Result};

pub fn encode_cursor(values: &Map<String, Value>) -> String {
    URL_SAFE_NO_PAD.encode(Value::Object(values.clone()).to_string())
}

pub fn decode_cursor(cursor: &str) -> Result<Map<String, Value>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|e| EngineError::InvalidCursor(e.to_string()))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(EngineError::InvalidCursor(format!(
            "expected an object, got {}",
            other
        ))),
        Err(e) => Err(EngineError::InvalidCursor(e.to_string())),
    }
}
