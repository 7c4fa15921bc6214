//! The schema subset providers may use to describe tool inputs and outputs.
//!
//! This is a JSON Schema-style dialect restricted to records, lists,
//! primitives, string enumerations, and `anyOf` sums. Properties are kept in
//! a `BTreeMap` so that everything derived from a schema (validation error
//! paths, generated source files) is deterministic.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Schema>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,

    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,

    #[serde(rename = "anyOf", skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<Schema>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<i64>,
}

/// A validation failure, pointing at the offending location in the argument
/// tree (`args.user.name` style paths, `args` for the root).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl Schema {
    pub fn primitive(schema_type: &str) -> Self {
        Schema {
            schema_type: Some(schema_type.to_string()),
            ..Default::default()
        }
    }

    /// Validates `value` against this schema. The error carries the path of
    /// the first mismatch; callers report it verbatim and never retry.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        self.validate_at("args", value)
    }

    fn validate_at(&self, path: &str, value: &Value) -> Result<(), SchemaError> {
        if let Some(variants) = &self.any_of {
            if variants.iter().any(|s| s.validate_at(path, value).is_ok()) {
                return Ok(());
            }
            return Err(SchemaError {
                path: path.to_string(),
                message: "value matches no variant of the sum type".to_string(),
            });
        }

        if let Some(allowed) = &self.enum_values {
            if allowed.contains(value) {
                return Ok(());
            }
            return Err(SchemaError {
                path: path.to_string(),
                message: format!(
                    "value {value} is not one of the allowed values {}",
                    serde_json::to_string(allowed).unwrap_or_default()
                ),
            });
        }

        let Some(ty) = self.schema_type.as_deref() else {
            // An unconstrained schema accepts anything.
            return Ok(());
        };

        match ty {
            "object" => {
                let Value::Object(map) = value else {
                    return Err(type_error(path, "object", value));
                };
                if let Some(required) = &self.required {
                    for field in required {
                        if !map.contains_key(field) {
                            return Err(SchemaError {
                                path: format!("{path}.{field}"),
                                message: "missing required field".to_string(),
                            });
                        }
                    }
                }
                if let Some(properties) = &self.properties {
                    for (field, schema) in properties {
                        if let Some(field_value) = map.get(field) {
                            // Explicit null on an optional field counts as absent.
                            if field_value.is_null() && !self.is_required(field) {
                                continue;
                            }
                            schema.validate_at(&format!("{path}.{field}"), field_value)?;
                        }
                    }
                }
                Ok(())
            }
            "array" => {
                let Value::Array(entries) = value else {
                    return Err(type_error(path, "array", value));
                };
                if let Some(items) = &self.items {
                    for (idx, entry) in entries.iter().enumerate() {
                        items.validate_at(&format!("{path}[{idx}]"), entry)?;
                    }
                }
                Ok(())
            }
            "string" => match value {
                Value::String(_) => Ok(()),
                _ => Err(type_error(path, "string", value)),
            },
            "integer" => {
                let Some(n) = value.as_i64() else {
                    return Err(type_error(path, "integer", value));
                };
                if let Some(min) = self.minimum {
                    if n < min {
                        return Err(SchemaError {
                            path: path.to_string(),
                            message: format!("{n} is below the minimum {min}"),
                        });
                    }
                }
                if let Some(max) = self.maximum {
                    if n > max {
                        return Err(SchemaError {
                            path: path.to_string(),
                            message: format!("{n} is above the maximum {max}"),
                        });
                    }
                }
                Ok(())
            }
            "number" => match value {
                Value::Number(_) => Ok(()),
                _ => Err(type_error(path, "number", value)),
            },
            "boolean" => match value {
                Value::Bool(_) => Ok(()),
                _ => Err(type_error(path, "boolean", value)),
            },
            "null" => match value {
                Value::Null => Ok(()),
                _ => Err(type_error(path, "null", value)),
            },
            other => Err(SchemaError {
                path: path.to_string(),
                message: format!("schema declares unsupported type `{other}`"),
            }),
        }
    }

    fn is_required(&self, field: &str) -> bool {
        self.required
            .as_ref()
            .is_some_and(|r| r.iter().any(|f| f == field))
    }
}

fn type_error(path: &str, expected: &str, got: &Value) -> SchemaError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    SchemaError {
        path: path.to_string(),
        message: format!("expected {expected}, got {got}"),
    }
}
