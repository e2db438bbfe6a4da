//! Caller-supplied job parameters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Opaque map of named job parameters.
///
/// Values may be scalars or nested structures. The core only needs a
/// stable serialization for fingerprinting and scalar lookups for path
/// templates; everything else is interpreted by the collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDescriptor {
    params: Map<String, Value>,
}

impl JobDescriptor {
    /// Build a descriptor from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(params) => Ok(Self { params }),
            other => Err(CoreError::Validation(format!(
                "Job descriptor must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// The underlying parameter map.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Look up a parameter by dotted path (`"solver.tolerance"`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.params.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Render a scalar parameter as plain text, for path templates.
    ///
    /// Returns `None` for missing parameters and for arrays/objects.
    pub fn scalar_text(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.params.clone())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
