//! Outbound payload staging.
//!
//! Senders do not build envelopes directly: they append values to a
//! [`StagingBuffer`] and a later send drains everything staged so far into
//! one payload. The fold keeps the envelope within the five wire kinds:
//!
//! | Staged                  | Payload                                  |
//! |-------------------------|------------------------------------------|
//! | nothing                 | `None`                                   |
//! | one text value          | `Text`                                   |
//! | one binary value        | `Binary`                                 |
//! | one JSON object/array   | `JsonObject` / `JsonArray`               |
//! | one JSON scalar         | single-element `JsonArray`               |
//! | two or more values      | `JsonArray` (text → JSON string, binary → base64 JSON string) |
//!
//! Draining always clears the buffer, even when the send that follows fails,
//! so a retry never resends stale fragments.

use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::protocol::binary;
use crate::protocol::envelope::Payload;

/// One value staged for the next send.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedValue {
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

impl StagedValue {
    /// The JSON form this value takes inside a multi-value array.
    fn into_json(self) -> Value {
        match self {
            StagedValue::Text(text) => Value::String(text),
            StagedValue::Json(value) => value,
            StagedValue::Binary(bytes) => Value::String(binary::encode(&bytes)),
        }
    }
}

/// Thread-safe buffer of pending outgoing values.
#[derive(Default)]
pub struct StagingBuffer {
    values: Mutex<Vec<StagedValue>>,
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one value for the next send.
    pub fn stage(&self, value: StagedValue) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    /// Number of values currently staged.
    pub fn len(&self) -> usize {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes everything staged so far and folds it into one payload,
    /// leaving the buffer empty.
    pub fn drain(&self) -> Payload {
        let values = std::mem::take(
            &mut *self
                .values
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        fold(values)
    }
}

fn fold(mut values: Vec<StagedValue>) -> Payload {
    match values.len() {
        0 => Payload::None,
        1 => match values.remove(0) {
            StagedValue::Text(text) => Payload::Text(text),
            StagedValue::Binary(bytes) => Payload::Binary(bytes),
            StagedValue::Json(Value::Object(map)) => Payload::JsonObject(map),
            StagedValue::Json(Value::Array(items)) => Payload::JsonArray(items),
            // A lone scalar still has to travel as one of the five wire
            // kinds; a single-element array keeps it losslessly typed.
            StagedValue::Json(scalar) => Payload::JsonArray(vec![scalar]),
        },
        _ => Payload::JsonArray(values.into_iter().map(StagedValue::into_json).collect()),
    }
}
