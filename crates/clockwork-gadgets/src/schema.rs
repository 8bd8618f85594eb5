//! The schema capability. Schemas are opaque to the engine beyond
//! `validate`; the bundled `ObjectSchema` coerces the parser's all-string
//! leaves into numbers and booleans.

use serde_json::{json, Map, Value};

/// One rejected path in a validation failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaIssue {
    /// Slash-delimited path into the parameter tree; empty for whole-value
    /// issues.
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Validation capability a gadget's input schema exposes.
pub trait Schema: Send + Sync {
    /// Validate and coerce a raw parameter value. All scalar leaves arrive
    /// as strings; implementations decode numerics and booleans.
    fn validate(&self, raw: &Value) -> Result<Value, Vec<SchemaIssue>>;

    /// JSON-Schema-shaped description for prompts and docs.
    fn describe(&self) -> Value {
        json!({ "type": "object" })
    }
}

/// Leaf and container kinds `ObjectSchema` understands.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Text,
    Integer,
    Number,
    Boolean,
    /// Homogeneous array with the given element kind.
    List(Box<FieldKind>),
    /// Nested object validated by its own field specs.
    Object(Vec<FieldSpec>),
    /// Accept anything as-is.
    Raw,
}

impl FieldKind {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::List(_) => "array",
            Self::Object(_) => "object",
            Self::Raw => "any",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub description: String,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: description.into(),
        }
    }
}

/// Object schema over named fields with string-leaf coercion.
#[derive(Clone, Debug, Default)]
pub struct ObjectSchema {
    fields: Vec<FieldSpec>,
}

impl ObjectSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    fn coerce(kind: &FieldKind, path: &str, value: &Value, issues: &mut Vec<SchemaIssue>) -> Value {
        match kind {
            FieldKind::Raw => value.clone(),
            FieldKind::Text => match value {
                Value::String(_) => value.clone(),
                other => Value::String(other.to_string()),
            },
            FieldKind::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => value.clone(),
                Value::String(s) => match s.trim().parse::<i64>() {
                    Ok(n) => json!(n),
                    Err(_) => {
                        issues.push(SchemaIssue::new(path, format!("expected integer, got \"{s}\"")));
                        Value::Null
                    }
                },
                other => {
                    issues.push(SchemaIssue::new(path, format!("expected integer, got {other}")));
                    Value::Null
                }
            },
            FieldKind::Number => match value {
                Value::Number(_) => value.clone(),
                Value::String(s) => match s.trim().parse::<f64>() {
                    Ok(n) => json!(n),
                    Err(_) => {
                        issues.push(SchemaIssue::new(path, format!("expected number, got \"{s}\"")));
                        Value::Null
                    }
                },
                other => {
                    issues.push(SchemaIssue::new(path, format!("expected number, got {other}")));
                    Value::Null
                }
            },
            FieldKind::Boolean => match value {
                Value::Bool(_) => value.clone(),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => json!(true),
                    "false" => json!(false),
                    _ => {
                        issues.push(SchemaIssue::new(path, format!("expected boolean, got \"{s}\"")));
                        Value::Null
                    }
                },
                other => {
                    issues.push(SchemaIssue::new(path, format!("expected boolean, got {other}")));
                    Value::Null
                }
            },
            FieldKind::List(item) => match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, v)| Self::coerce(item, &format!("{path}/{i}"), v, issues))
                        .collect(),
                ),
                other => {
                    issues.push(SchemaIssue::new(path, format!("expected array, got {other}")));
                    Value::Null
                }
            },
            FieldKind::Object(fields) => match value {
                Value::Object(_) => Self::coerce_object(fields, path, value, issues),
                other => {
                    issues.push(SchemaIssue::new(path, format!("expected object, got {other}")));
                    Value::Null
                }
            },
        }
    }

    fn coerce_object(
        fields: &[FieldSpec],
        base: &str,
        value: &Value,
        issues: &mut Vec<SchemaIssue>,
    ) -> Value {
        let map = value.as_object().cloned().unwrap_or_default();
        let mut out = Map::new();
        for field in fields {
            let path = if base.is_empty() {
                field.name.clone()
            } else {
                format!("{base}/{}", field.name)
            };
            match map.get(&field.name) {
                Some(v) => {
                    out.insert(field.name.clone(), Self::coerce(&field.kind, &path, v, issues));
                }
                None if field.required => {
                    issues.push(SchemaIssue::new(path, "missing required field"));
                }
                None => {}
            }
        }
        // Unknown fields pass through untouched.
        for (k, v) in map {
            if !fields.iter().any(|f| f.name == k) {
                out.insert(k, v);
            }
        }
        Value::Object(out)
    }

    fn describe_kind(kind: &FieldKind) -> Value {
        match kind {
            FieldKind::List(item) => json!({
                "type": "array",
                "items": Self::describe_kind(item),
            }),
            FieldKind::Object(fields) => Self::describe_fields(fields),
            other => json!({ "type": other.type_name() }),
        }
    }

    fn describe_fields(fields: &[FieldSpec]) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in fields {
            let mut spec = Self::describe_kind(&field.kind);
            if !field.description.is_empty() {
                spec["description"] = json!(field.description);
            }
            properties.insert(field.name.clone(), spec);
            if field.required {
                required.push(json!(field.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

impl Schema for ObjectSchema {
    fn validate(&self, raw: &Value) -> Result<Value, Vec<SchemaIssue>> {
        if !raw.is_object() {
            return Err(vec![SchemaIssue::new("", format!("expected object, got {raw}"))]);
        }
        let mut issues = Vec::new();
        let coerced = Self::coerce_object(&self.fields, "", raw, &mut issues);
        if issues.is_empty() {
            Ok(coerced)
        } else {
            Err(issues)
        }
    }

    fn describe(&self) -> Value {
        Self::describe_fields(&self.fields)
    }
}
