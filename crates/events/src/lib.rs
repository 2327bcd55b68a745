//! Event records, envelopes, schemas, and validation.
//!
//! A [`SourceRecord`] is what the log hands us; an [`EventEnvelope`] is what
//! survives validation. Nothing in this crate does I/O.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod envelope;
pub mod event;
pub mod orders;
pub mod record;
pub mod schema;
pub mod validator;

pub use envelope::EventEnvelope;
pub use event::{Event, to_record};
pub use record::{
    CORRELATION_ID_HEADER, EVENT_TYPE_HEADER, SCHEMA_VERSION_HEADER, SOURCE_HEADER, SourceRecord,
};
pub use schema::{EventSchema, FieldKind, FieldRule, InMemorySchemaRegistry, SchemaError, SchemaRegistry};
pub use validator::{DEFAULT_SCHEMA_VERSION, ValidationError, Validator, validate};
