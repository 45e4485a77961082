//! StashDB Core - Models, Schemas and Errors
//!
//! Data types shared by every other StashDB crate: the dynamic [`Value`],
//! the [`Model`] trait and its declared metadata, the Schema Mapper,
//! attribute converters, dialects, request context and configuration.
//! Nothing in this crate performs I/O against a database.

pub mod clock;
pub mod config;
pub mod converter;
pub mod dialect;
pub mod error;
pub mod mapping;
pub mod model;
pub mod request;
pub mod schema;
pub mod tickets;
pub mod value;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use clock::{Clock, SystemClock};
pub use config::{DbConfig, SyncPolicy};
pub use converter::{
    AttributeConverter, ConverterRegistry, JsonListConverter, JsonMapConverter,
    JsonObjectConverter, JsonSetConverter,
};
pub use dialect::{Dialect, MIGRATIONS_TABLE, TICKETS_SEQUENCE, TICKET_BLOCK_SIZE};
pub use error::{ConfigError, StashError, StashResult, StorageError, UsageError};
pub use mapping::{apply_column, backfill_defaults, convert_column_arg};
pub use model::{
    Accessor, ColumnAttrs, FieldDef, FieldSource, Model, ModelDefinition, SortDirection,
};
pub use request::{RequestContext, RequestKind, RECENT_POSTBACK_COOKIE};
pub use schema::{
    model_to_schema, schema_from_definition, Col, Schema, SchemaRegistry, ID_COLUMN,
    ROW_UPDATED_AT,
};
pub use tickets::{InMemoryTickets, TicketGenerator};
pub use value::{Value, ValueKind};

/// Milliseconds since the Unix epoch, UTC.
pub type Millis = i64;
