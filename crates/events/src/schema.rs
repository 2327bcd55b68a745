//! Schema authority: expected shape of each (event type, version).
//!
//! Schemas are deliberately small: a list of field rules addressed by path.
//! Paths are dotted (`shipping_address.city`) and `[]` applies the rest of the
//! path to every element of an array (`items[].quantity`).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Type constraint for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    /// Integer strictly greater than zero.
    PositiveInteger,
    Number,
    /// Decimal number, as a JSON string or number, with at most `max_scale`
    /// digits after the point.
    Decimal { max_scale: u32 },
    Boolean,
    Array,
    Object,
    /// RFC 3339 timestamp, or a naive ISO-8601 date-time (assumed UTC).
    Timestamp,
    /// ISO-8601 calendar date (`YYYY-MM-DD`).
    Date,
    /// String equal to one of the listed values.
    OneOf { values: Vec<String> },
    Any,
}

impl FieldKind {
    pub fn money() -> Self {
        Self::Decimal { max_scale: 2 }
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::OneOf {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `value` satisfies this constraint.
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::PositiveInteger => {
                value.as_u64().map(|v| v > 0).unwrap_or(false)
            }
            FieldKind::Number => value.is_number(),
            FieldKind::Decimal { max_scale } => match value {
                JsonValue::String(s) => is_decimal(s, *max_scale),
                JsonValue::Number(n) => is_decimal(&n.to_string(), *max_scale),
                _ => false,
            },
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Timestamp => value.as_str().map(is_timestamp).unwrap_or(false),
            FieldKind::Date => value
                .as_str()
                .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
                .unwrap_or(false),
            FieldKind::OneOf { values } => value
                .as_str()
                .map(|s| values.iter().any(|v| v == s))
                .unwrap_or(false),
            FieldKind::Any => true,
        }
    }
}

impl core::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FieldKind::String => f.write_str("string"),
            FieldKind::Integer => f.write_str("integer"),
            FieldKind::PositiveInteger => f.write_str("positive integer"),
            FieldKind::Number => f.write_str("number"),
            FieldKind::Decimal { max_scale } => write!(f, "decimal (scale <= {max_scale})"),
            FieldKind::Boolean => f.write_str("boolean"),
            FieldKind::Array => f.write_str("array"),
            FieldKind::Object => f.write_str("object"),
            FieldKind::Timestamp => f.write_str("timestamp"),
            FieldKind::Date => f.write_str("date"),
            FieldKind::OneOf { values } => write!(f, "one of [{}]", values.join(", ")),
            FieldKind::Any => f.write_str("any"),
        }
    }
}

fn is_decimal(s: &str, max_scale: u32) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match frac_part {
        None => true,
        Some(f) => {
            !f.is_empty() && f.len() <= max_scale as usize && f.bytes().all(|b| b.is_ascii_digit())
        }
    }
}

fn is_timestamp(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

/// A rule for one field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub path: String,
    pub kind: FieldKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Expected shape of one event type at one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSchema {
    pub event_type: String,
    pub version: u32,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

impl EventSchema {
    pub fn new(event_type: impl Into<String>, version: u32) -> Self {
        Self {
            event_type: event_type.into(),
            version,
            fields: Vec::new(),
        }
    }

    pub fn required(mut self, path: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            path: path.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, path: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            path: path.into(),
            kind,
            required: false,
        });
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("failed to parse schema document: {0}")]
    Parse(String),

    #[error("invalid schema: {0}")]
    Invalid(String),
}

/// Read-only lookup of expected schemas, consulted by the validator.
pub trait SchemaRegistry: Send + Sync {
    fn lookup(&self, event_type: &str, version: u32) -> Option<Arc<EventSchema>>;

    /// Versions registered for `event_type`, ascending. Empty if unknown.
    fn known_versions(&self, event_type: &str) -> Vec<u32>;
}

impl<R> SchemaRegistry for Arc<R>
where
    R: SchemaRegistry + ?Sized,
{
    fn lookup(&self, event_type: &str, version: u32) -> Option<Arc<EventSchema>> {
        (**self).lookup(event_type, version)
    }

    fn known_versions(&self, event_type: &str) -> Vec<u32> {
        (**self).known_versions(event_type)
    }
}

/// In-process schema registry.
#[derive(Debug, Default)]
pub struct InMemorySchemaRegistry {
    schemas: RwLock<HashMap<String, BTreeMap<u32, Arc<EventSchema>>>>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the order lifecycle schemas.
    ///
    /// # Panics
    ///
    /// Never in practice: the built-in order schemas all have a non-empty
    /// event type, a version of at least 1 and non-empty field paths.
    pub fn with_order_schemas() -> Self {
        let registry = Self::new();
        for schema in crate::orders::order_schemas() {
            registry
                .register(schema)
                .expect("built-in order schemas are valid");
        }
        registry
    }

    /// Register (or replace) a schema.
    pub fn register(&self, schema: EventSchema) -> Result<(), SchemaError> {
        if schema.event_type.trim().is_empty() {
            return Err(SchemaError::Invalid("event_type must not be empty".into()));
        }
        if schema.version == 0 {
            return Err(SchemaError::Invalid(format!(
                "{}: version must be >= 1",
                schema.event_type
            )));
        }
        if let Some(rule) = schema.fields.iter().find(|r| r.path.trim().is_empty()) {
            return Err(SchemaError::Invalid(format!(
                "{} v{}: empty field path (kind {})",
                schema.event_type, schema.version, rule.kind
            )));
        }

        let mut guard = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(schema.event_type.clone())
            .or_default()
            .insert(schema.version, Arc::new(schema));
        Ok(())
    }

    /// Register every schema in a JSON array document.
    pub fn extend_from_json(&self, document: &str) -> Result<usize, SchemaError> {
        let schemas: Vec<EventSchema> =
            serde_json::from_str(document).map_err(|e| SchemaError::Parse(e.to_string()))?;
        let count = schemas.len();
        for schema in schemas {
            self.register(schema)?;
        }
        Ok(count)
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn lookup(&self, event_type: &str, version: u32) -> Option<Arc<EventSchema>> {
        let guard = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        guard.get(event_type)?.get(&version).cloned()
    }

    fn known_versions(&self, event_type: &str) -> Vec<u32> {
        let guard = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(event_type)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }
}
