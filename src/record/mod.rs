//! Runtime-defined binary records.
//!
//! Record types are registered once as immutable [`RecordDefinition`]s built
//! with [`SchemaBuilder`]. A [`RecordObject`] interprets a byte buffer through
//! its definition and serializes to the wire form `type_name \0 data`
//! (CCSDS packets omit the prefix; their header identifies the type).
//!
//! ```rust
//! use trackline::record::{FieldType, RecordObject, RecordRegistry, SchemaBuilder, SerialMode};
//!
//! let registry = RecordRegistry::new();
//! registry
//!     .define_with(
//!         SchemaBuilder::new("gps")
//!             .field("week", FieldType::UInt16, 1)
//!             .field("seconds", FieldType::Double, 1),
//!     )
//!     .unwrap();
//!
//! let mut rec = RecordObject::new(&registry, "gps").unwrap();
//! rec.set_integer("week", 0, 2301).unwrap();
//! let wire = rec.serialize(SerialMode::Copy);
//! assert!(wire.starts_with(b"gps\0"));
//! ```

pub mod ccsds;
pub mod container;
pub mod exception;
mod field;
mod object;
mod registry;
mod schema;
mod value;

pub use container::ContainerRecord;
pub use exception::ExceptionRecord;
pub use field::{Field, FieldDef, FieldFlags, FieldType};
pub use object::{MAX_TYPE_NAME, RecordObject, SerialMode, peek_type};
pub use registry::RecordRegistry;
pub use schema::{DefinitionError, RecordDefinition, RecordKind, SchemaBuilder};
pub use value::{FieldData, Value};
