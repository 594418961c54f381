//! Stage option schema: field types, defaults and validation.
//!
//! A stage's `describe` output is consulted for submission-time validation and
//! introspection only; dispatch never branches on it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::types::{Error, Result};

// =============================================================================
// Field types
// =============================================================================

/// Option field type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    List,
    Object,
    Enum(Vec<String>),
    Any,
}

impl FieldType {
    /// Validate a JSON value against this field type.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        let ok = match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::List => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
            FieldType::Enum(variants) => {
                return match value.as_str() {
                    Some(s) if variants.iter().any(|v| v == s) => Ok(()),
                    Some(s) => Err(format!(
                        "invalid enum value '{}', expected one of: {}",
                        s,
                        variants.join(", ")
                    )),
                    None => Err(format!(
                        "expected string for enum, got {}",
                        value_type_name(value)
                    )),
                };
            }
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "expected {}, got {}",
                self.display_name(),
                value_type_name(value)
            ))
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            FieldType::String => "string".to_string(),
            FieldType::Int => "integer".to_string(),
            FieldType::Float => "number".to_string(),
            FieldType::Bool => "boolean".to_string(),
            FieldType::List => "array".to_string(),
            FieldType::Object => "object".to_string(),
            FieldType::Enum(variants) => format!("enum({})", variants.join("|")),
            FieldType::Any => "any".to_string(),
        }
    }
}

fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Option schema returned by `Stage::describe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSchema {
    pub name: String,
    pub description: String,
    pub required_fields: Vec<String>,
    pub optional_fields: Vec<String>,
    pub field_types: BTreeMap<String, FieldType>,
    pub defaults: Map<String, Value>,
}

impl StageSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn required(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        let field = field.into();
        self.field_types.insert(field.clone(), ty);
        self.required_fields.push(field);
        self
    }

    pub fn optional(mut self, field: impl Into<String>, ty: FieldType, default: Option<Value>) -> Self {
        let field = field.into();
        self.field_types.insert(field.clone(), ty);
        if let Some(default) = default {
            self.defaults.insert(field.clone(), default);
        }
        self.optional_fields.push(field);
        self
    }

    /// Check `options` against the schema. Unknown fields are allowed; an
    /// explicit `null` on an optional field counts as absent.
    pub fn validate(&self, options: &Map<String, Value>) -> Result<()> {
        let mut problems = Vec::new();

        for field in &self.required_fields {
            match options.get(field) {
                None | Some(Value::Null) => problems.push(format!("missing required field '{field}'")),
                Some(value) => {
                    if let Some(ty) = self.field_types.get(field) {
                        if let Err(e) = ty.validate(value) {
                            problems.push(format!("field '{field}': {e}"));
                        }
                    }
                }
            }
        }

        for field in &self.optional_fields {
            if let Some(value) = options.get(field).filter(|v| !v.is_null()) {
                if let Some(ty) = self.field_types.get(field) {
                    if let Err(e) = ty.validate(value) {
                        problems.push(format!("field '{field}': {e}"));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "stage '{}' options invalid: {}",
                self.name,
                problems.join("; ")
            )))
        }
    }

    /// Fill absent optional fields with their defaults.
    pub fn apply_defaults(&self, options: &mut Map<String, Value>) {
        for (field, default) in &self.defaults {
            if options.get(field).map_or(true, Value::is_null) {
                options.insert(field.clone(), default.clone());
            }
        }
    }
}
