// ABOUTME: Schema resolution for replicated entity types
// ABOUTME: Declarative descriptors, cached per-type resolution, and mapped row access

pub mod descriptor;
pub mod resolver;
pub mod row;

pub use descriptor::{Entity, EntityDescriptor, Field};
pub use resolver::{ColumnBinding, SchemaRegistry, TypeSchema, CONVENTIONAL_KEY_MEMBER};
pub use row::MappedRow;
