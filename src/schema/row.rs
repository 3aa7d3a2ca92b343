// ABOUTME: Row view that resolves entity members to their bound columns
// ABOUTME: Missing columns and type mismatches surface as mapping errors

use super::resolver::TypeSchema;
use crate::error::{ReplicaError, ReplicaResult};
use crate::value::{FromValue, Row, Value};

/// A fetched row seen through an entity's column bindings.
pub struct MappedRow<'a> {
    row: &'a Row,
    schema: &'a TypeSchema,
    table: &'a str,
}

impl<'a> MappedRow<'a> {
    pub fn new(row: &'a Row, schema: &'a TypeSchema, table: &'a str) -> Self {
        Self { row, schema, table }
    }

    /// Read a member through its column binding.
    pub fn get<V: FromValue>(&self, member: &str) -> ReplicaResult<V> {
        let binding = self.schema.binding(member).ok_or_else(|| {
            ReplicaError::mapping(
                self.table,
                member,
                format!(
                    "member `{}` is not bound to a column on {}",
                    member,
                    self.schema.type_name()
                ),
            )
        })?;
        self.column(&binding.column)
    }

    /// Read a column directly by name.
    pub fn column<V: FromValue>(&self, column: &str) -> ReplicaResult<V> {
        let value = self.raw(column)?;
        V::from_value(value).map_err(|reason| ReplicaError::mapping(self.table, column, reason))
    }

    pub fn raw(&self, column: &str) -> ReplicaResult<&'a Value> {
        self.row.get(column).ok_or_else(|| {
            ReplicaError::mapping(self.table, column, "column missing from fetched row")
        })
    }

    pub fn schema(&self) -> &TypeSchema {
        self.schema
    }
}
