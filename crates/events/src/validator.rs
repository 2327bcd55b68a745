//! Event envelope validation.
//!
//! `validate` is a pure function from a raw record and the schema it is
//! expected to satisfy to either an [`EventEnvelope`] or the first rule the
//! record violates. [`Validator`] adds schema resolution through a
//! [`SchemaRegistry`].

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::record::{CORRELATION_ID_HEADER, EVENT_TYPE_HEADER, SCHEMA_VERSION_HEADER, SourceRecord};
use crate::schema::{EventSchema, FieldRule, SchemaRegistry};
use crate::EventEnvelope;

/// Schema version assumed when a record carries no `schema_version` header.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// The rule a record violated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Payload (or a header value) could not be decoded at all.
    #[error("decode error: {0}")]
    Decode(String),

    /// A header needed to resolve the schema is absent.
    #[error("missing header `{0}`")]
    MissingHeader(&'static str),

    /// No schema of any version exists for the event type.
    #[error("no schema registered for event type `{0}`")]
    UnknownEventType(String),

    /// The record declares a different event type or version than expected.
    #[error(
        "schema mismatch: expected {expected_type} v{expected_version}, found {found_type} v{found_version}"
    )]
    SchemaMismatch {
        expected_type: String,
        expected_version: u32,
        found_type: String,
        found_version: u32,
    },

    /// A required field is absent or null.
    #[error("missing required field `{0}`")]
    MissingField(String),

    /// A field is present but does not satisfy its constraint.
    #[error("field `{field}` is not a valid {expected}")]
    InvalidField { field: String, expected: String },
}

impl ValidationError {
    /// Stable machine-readable name of the violated rule.
    pub fn rule(&self) -> &'static str {
        match self {
            ValidationError::Decode(_) => "decode_error",
            ValidationError::MissingHeader(_) => "missing_header",
            ValidationError::UnknownEventType(_) => "unknown_event_type",
            ValidationError::SchemaMismatch { .. } => "schema_mismatch",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::InvalidField { .. } => "invalid_field",
        }
    }
}

/// Validate `record` against `schema`.
///
/// Headers are optional here: an absent `event_type` is taken to be the
/// schema's, an absent `schema_version` is [`DEFAULT_SCHEMA_VERSION`].
pub fn validate(record: &SourceRecord, schema: &EventSchema) -> Result<EventEnvelope, ValidationError> {
    let found_type = record.event_type().unwrap_or(schema.event_type.as_str());
    let found_version = declared_version(record)?;

    if found_type != schema.event_type || found_version != schema.version {
        return Err(ValidationError::SchemaMismatch {
            expected_type: schema.event_type.clone(),
            expected_version: schema.version,
            found_type: found_type.to_string(),
            found_version,
        });
    }

    let payload: JsonValue = serde_json::from_slice(&record.payload)
        .map_err(|e| ValidationError::Decode(e.to_string()))?;
    if !payload.is_object() {
        return Err(ValidationError::Decode("payload must be a JSON object".into()));
    }

    for rule in &schema.fields {
        let segments: Vec<&str> = rule.path.split('.').collect();
        check_rule(&payload, &segments, rule, String::new())?;
    }

    Ok(EventEnvelope::new(
        schema.event_type.clone(),
        schema.version,
        payload,
        record.partition,
        record.offset,
        record.timestamp,
        record.key_str().map(str::to_string),
        record.header(CORRELATION_ID_HEADER).map(str::to_string),
    ))
}

fn declared_version(record: &SourceRecord) -> Result<u32, ValidationError> {
    match record.header(SCHEMA_VERSION_HEADER) {
        None => Ok(DEFAULT_SCHEMA_VERSION),
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
            ValidationError::Decode(format!("invalid {SCHEMA_VERSION_HEADER} header `{raw}`"))
        }),
    }
}

fn join_path(trail: &str, name: &str) -> String {
    if trail.is_empty() {
        name.to_string()
    } else {
        format!("{trail}.{name}")
    }
}

fn check_rule(
    value: &JsonValue,
    segments: &[&str],
    rule: &FieldRule,
    trail: String,
) -> Result<(), ValidationError> {
    let Some((head, rest)) = segments.split_first() else {
        return if rule.kind.accepts(value) {
            Ok(())
        } else {
            Err(ValidationError::InvalidField {
                field: trail,
                expected: rule.kind.to_string(),
            })
        };
    };

    let Some(object) = value.as_object() else {
        return Err(ValidationError::InvalidField {
            field: if trail.is_empty() { "$".to_string() } else { trail },
            expected: "object".to_string(),
        });
    };

    let (name, each) = match head.strip_suffix("[]") {
        Some(name) => (name, true),
        None => (*head, false),
    };
    let path = join_path(&trail, name);

    match object.get(name) {
        None | Some(JsonValue::Null) => {
            if rule.required {
                Err(ValidationError::MissingField(path))
            } else {
                Ok(())
            }
        }
        Some(child) if each => {
            let items = child.as_array().ok_or_else(|| ValidationError::InvalidField {
                field: path.clone(),
                expected: "array".to_string(),
            })?;
            for (i, item) in items.iter().enumerate() {
                check_rule(item, rest, rule, format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        Some(child) => check_rule(child, rest, rule, path),
    }
}

/// Resolves schemas through a registry and validates records against them.
#[derive(Debug, Clone)]
pub struct Validator<R> {
    registry: R,
}

impl<R> Validator<R>
where
    R: SchemaRegistry,
{
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Validate a record against the schema named by its headers.
    pub fn validate(&self, record: &SourceRecord) -> Result<EventEnvelope, ValidationError> {
        let event_type = record
            .event_type()
            .ok_or(ValidationError::MissingHeader(EVENT_TYPE_HEADER))?;
        let version = declared_version(record)?;

        match self.registry.lookup(event_type, version) {
            Some(schema) => validate(record, &schema),
            None => {
                let known = self.registry.known_versions(event_type);
                match known.last() {
                    None => Err(ValidationError::UnknownEventType(event_type.to_string())),
                    Some(&latest) => Err(ValidationError::SchemaMismatch {
                        expected_type: event_type.to_string(),
                        expected_version: latest,
                        found_type: event_type.to_string(),
                        found_version: version,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, InMemorySchemaRegistry};
    use chrono::{TimeZone, Utc};
    use orderflow_core::{Offset, PartitionId};
    use proptest::prelude::*;
    use serde_json::json;

    fn shipment_schema() -> EventSchema {
        EventSchema::new("ParcelShipped", 1)
            .required("parcel_id", FieldKind::String)
            .required("lines", FieldKind::Array)
            .required("lines[].quantity", FieldKind::PositiveInteger)
            .required("destination.city", FieldKind::String)
            .optional("note", FieldKind::String)
    }

    fn record(payload: JsonValue) -> SourceRecord {
        SourceRecord::new(PartitionId::new(2), Offset::new(17), payload.to_string())
            .with_header(EVENT_TYPE_HEADER, "ParcelShipped")
            .with_timestamp(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
    }

    fn valid_payload() -> JsonValue {
        json!({
            "parcel_id": "p-1",
            "lines": [{"quantity": 1}, {"quantity": 4}],
            "destination": {"city": "Austin"}
        })
    }

    #[test]
    fn valid_record_becomes_envelope_with_input_fields() {
        let rec = record(valid_payload())
            .with_key("cust_1")
            .with_header(CORRELATION_ID_HEADER, "ord_1");

        let env = validate(&rec, &shipment_schema()).unwrap();

        assert_eq!(env.event_type(), "ParcelShipped");
        assert_eq!(env.schema_version(), 1);
        assert_eq!(env.payload(), &valid_payload());
        assert_eq!(env.partition(), PartitionId::new(2));
        assert_eq!(env.offset(), Offset::new(17));
        assert_eq!(env.ingested_at(), rec.timestamp);
        assert_eq!(env.key(), Some("cust_1"));
        assert_eq!(env.correlation_id(), Some("ord_1"));
    }

    #[test]
    fn non_json_payload_is_a_decode_error() {
        let rec = SourceRecord::new(PartitionId::new(0), Offset::ZERO, "{\"parcel_id\": ");
        let err = validate(&rec, &shipment_schema()).unwrap_err();
        assert_eq!(err.rule(), "decode_error");
    }

    #[test]
    fn json_array_payload_is_a_decode_error() {
        let err = validate(&record(json!([1, 2])), &shipment_schema()).unwrap_err();
        assert!(matches!(err, ValidationError::Decode(_)));
    }

    #[test]
    fn missing_nested_field_reports_full_path() {
        let mut payload = valid_payload();
        payload["destination"] = json!({});
        let err = validate(&record(payload), &shipment_schema()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("destination.city".into()));
    }

    #[test]
    fn array_element_rule_reports_index() {
        let mut payload = valid_payload();
        payload["lines"] = json!([{"quantity": 2}, {"quantity": 0}]);
        let err = validate(&record(payload), &shipment_schema()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidField {
                field: "lines[1].quantity".into(),
                expected: "positive integer".into(),
            }
        );
    }

    #[test]
    fn null_required_field_counts_as_missing() {
        let mut payload = valid_payload();
        payload["parcel_id"] = JsonValue::Null;
        let err = validate(&record(payload), &shipment_schema()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("parcel_id".into()));
    }

    #[test]
    fn optional_field_is_still_type_checked() {
        let mut payload = valid_payload();
        payload["note"] = json!(42);
        let err = validate(&record(payload), &shipment_schema()).unwrap_err();
        assert_eq!(err.rule(), "invalid_field");
    }

    #[test]
    fn version_header_mismatch_is_schema_mismatch() {
        let rec = record(valid_payload()).with_header(SCHEMA_VERSION_HEADER, "2");
        let err = validate(&rec, &shipment_schema()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::SchemaMismatch {
                expected_type: "ParcelShipped".into(),
                expected_version: 1,
                found_type: "ParcelShipped".into(),
                found_version: 2,
            }
        );
    }

    #[test]
    fn garbage_version_header_is_a_decode_error() {
        let rec = record(valid_payload()).with_header(SCHEMA_VERSION_HEADER, "v1");
        let err = validate(&rec, &shipment_schema()).unwrap_err();
        assert!(matches!(err, ValidationError::Decode(_)));
    }

    #[test]
    fn validator_requires_event_type_header() {
        let validator = Validator::new(InMemorySchemaRegistry::new());
        let rec = SourceRecord::new(PartitionId::new(0), Offset::ZERO, "{}");
        assert_eq!(
            validator.validate(&rec).unwrap_err(),
            ValidationError::MissingHeader(EVENT_TYPE_HEADER)
        );
    }

    #[test]
    fn validator_distinguishes_unknown_type_from_unknown_version() {
        let registry = InMemorySchemaRegistry::new();
        registry.register(shipment_schema()).unwrap();
        let validator = Validator::new(registry);

        let unknown = record(valid_payload()).with_header(EVENT_TYPE_HEADER, "ParcelLost");
        assert_eq!(
            validator.validate(&unknown).unwrap_err(),
            ValidationError::UnknownEventType("ParcelLost".into())
        );

        let newer = record(valid_payload()).with_header(SCHEMA_VERSION_HEADER, "3");
        assert_eq!(validator.validate(&newer).unwrap_err().rule(), "schema_mismatch");

        assert!(validator.validate(&record(valid_payload())).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: any well-formed payload produces an envelope carrying
        /// exactly the input payload and coordinates.
        #[test]
        fn valid_payloads_round_trip_into_envelopes(
            parcel_id in "[a-z0-9_]{1,16}",
            quantities in prop::collection::vec(1u32..1000, 0..6),
            city in "[A-Za-z ]{1,20}",
            partition in 0u32..64,
            offset in any::<u64>(),
        ) {
            let lines: Vec<JsonValue> = quantities.iter().map(|q| json!({"quantity": q})).collect();
            let payload = json!({
                "parcel_id": parcel_id,
                "lines": lines,
                "destination": {"city": city},
            });
            let rec = SourceRecord::new(PartitionId::new(partition), Offset::new(offset), payload.to_string())
                .with_header(EVENT_TYPE_HEADER, "ParcelShipped");

            let env = validate(&rec, &shipment_schema()).unwrap();
            prop_assert_eq!(env.payload(), &payload);
            prop_assert_eq!(env.partition(), PartitionId::new(partition));
            prop_assert_eq!(env.offset(), Offset::new(offset));
        }

        /// Property: arbitrary bytes never yield an envelope unless they
        /// happen to be a payload that satisfies every rule.
        #[test]
        fn arbitrary_bytes_are_rejected(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
            let rec = SourceRecord::new(PartitionId::new(0), Offset::ZERO, bytes);
            let result = validate(&rec, &shipment_schema());
            prop_assert!(result.is_err());
        }
    }
}
