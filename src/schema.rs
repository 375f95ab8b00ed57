//! Output schema: resolved once per run into an immutable field list, then
//! used both to build the response-format contract and to parse replies.

use crate::{
    catalog::{JobDefinition, QuestionDef},
    input::{Row, SharedContext},
};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

/// Sentinel appended to every enumerated field's permitted values.
pub const NO_MATCH: &str = "No Match";

static SCHEMA_NAME_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("static regex"));

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("job {job:?} defines no output fields")]
    EmptySchema { job: String },

    #[error("field {key:?} has unsupported type {kind:?}")]
    UnknownType { key: String, kind: String },

    #[error("field {key:?} is declared more than once")]
    DuplicateField { key: String },

    #[error("enum field {key:?} has no enum_source")]
    MissingEnumSource { key: String },

    #[error("enum field {key:?}: enum source {table:?} does not match any context table")]
    UnresolvedEnumSource { key: String, table: String },

    #[error("enum field {key:?}: enum source {table:?} has no values")]
    EmptyEnumSource { key: String, table: String },
}

/// Why a reply could not be projected onto the schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseFailure {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("response has no `results` array")]
    MissingResults,

    #[error("response `results` array is empty")]
    EmptyResults,

    #[error("first `results` entry is not an object")]
    NotAnObject,

    #[error("missing required field {0:?}")]
    MissingField(String),

    #[error("field {key:?} is not of type {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("field {key:?} value {value:?} is not a permitted enum value")]
    NotInEnum { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Enum(Vec<String>),
}

impl FieldKind {
    fn type_name(&self) -> &'static str {
        match self {
            FieldKind::String | FieldKind::Enum(_) => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldKind::String, Value::String(_)) => true,
            (FieldKind::Enum(allowed), Value::String(s)) => allowed.iter().any(|a| a == s),
            (FieldKind::Number, Value::Number(_)) => true,
            (FieldKind::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldKind::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub key: String,
    pub description: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub description: String,
    pub fields: Vec<FieldSpec>,
}

/// Resolves a job's questions, including enum sources, against the loaded
/// example context.
pub fn resolve<'a>(
    job: &JobDefinition,
    questions: impl IntoIterator<Item = &'a QuestionDef>,
    context: &SharedContext,
) -> Result<OutputSchema, SchemaError> {
    let mut fields: Vec<FieldSpec> = Vec::new();

    for q in questions {
        if fields.iter().any(|f| f.key == q.key) {
            return Err(SchemaError::DuplicateField { key: q.key.clone() });
        }
        let kind = match q.kind.trim().to_ascii_lowercase().as_str() {
            "string" => FieldKind::String,
            "number" => FieldKind::Number,
            "integer" => FieldKind::Integer,
            "boolean" => FieldKind::Boolean,
            "enum" => FieldKind::Enum(resolve_enum(q, context)?),
            other => {
                return Err(SchemaError::UnknownType {
                    key: q.key.clone(),
                    kind: other.to_string(),
                });
            }
        };
        fields.push(FieldSpec {
            key: q.key.clone(),
            description: q.description.clone(),
            kind,
        });
    }

    if fields.is_empty() {
        return Err(SchemaError::EmptySchema {
            job: job.name.clone(),
        });
    }

    Ok(OutputSchema {
        name: schema_name(&job.name),
        description: job.tool_description.clone(),
        fields,
    })
}

fn resolve_enum(q: &QuestionDef, context: &SharedContext) -> Result<Vec<String>, SchemaError> {
    let table_name = q
        .enum_source
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SchemaError::MissingEnumSource { key: q.key.clone() })?;

    let table = context
        .table(table_name)
        .ok_or_else(|| SchemaError::UnresolvedEnumSource {
            key: q.key.clone(),
            table: table_name.to_string(),
        })?;

    let mut values = table.first_column_values();
    if values.is_empty() {
        return Err(SchemaError::EmptyEnumSource {
            key: q.key.clone(),
            table: table_name.to_string(),
        });
    }
    values.retain(|v| v != NO_MATCH);
    values.push(NO_MATCH.to_string());
    Ok(values)
}

fn schema_name(job_name: &str) -> String {
    let name = SCHEMA_NAME_INVALID.replace_all(job_name.trim(), "_");
    let name: String = name.chars().take(64).collect();
    if name.is_empty() {
        "results".to_string()
    } else {
        name
    }
}

impl OutputSchema {
    /// Structured-output contract: one object holding a `results` array of
    /// strictly typed items.
    pub fn response_format(&self) -> Value {
        let mut properties = Map::new();
        for f in &self.fields {
            let mut prop = json!({
                "type": f.kind.type_name(),
                "description": f.description,
            });
            if let FieldKind::Enum(values) = &f.kind {
                prop["enum"] = json!(values);
            }
            properties.insert(f.key.clone(), prop);
        }
        let required: Vec<&str> = self.fields.iter().map(|f| f.key.as_str()).collect();

        json!({
            "type": "json_schema",
            "json_schema": {
                "name": self.name,
                "description": self.description,
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {
                        "results": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": properties,
                                "required": required,
                                "additionalProperties": false,
                            }
                        }
                    },
                    "required": ["results"],
                    "additionalProperties": false,
                }
            }
        })
    }

    /// Projects the first `results` entry of a reply onto the schema fields.
    /// Extra fields in the reply are ignored.
    pub fn parse_results(&self, content: &str) -> Result<Row, ParseFailure> {
        let payload: Value = serde_json::from_str(content)
            .map_err(|e| ParseFailure::InvalidJson(e.to_string()))?;
        let results = payload
            .get("results")
            .and_then(Value::as_array)
            .ok_or(ParseFailure::MissingResults)?;
        let first = results.first().ok_or(ParseFailure::EmptyResults)?;
        let entry = first.as_object().ok_or(ParseFailure::NotAnObject)?;

        let mut out = Row::new();
        for f in &self.fields {
            let value = entry
                .get(&f.key)
                .ok_or_else(|| ParseFailure::MissingField(f.key.clone()))?;
            if !f.kind.accepts(value) {
                return Err(match (&f.kind, value) {
                    (FieldKind::Enum(_), Value::String(s)) => ParseFailure::NotInEnum {
                        key: f.key.clone(),
                        value: s.clone(),
                    },
                    _ => ParseFailure::WrongType {
                        key: f.key.clone(),
                        expected: f.kind.type_name(),
                    },
                });
            }
            out.insert(f.key.clone(), value.clone());
        }
        Ok(out)
    }
}
