// ABOUTME: Statically declared entity metadata: table, field/column bindings, row key
// ABOUTME: Types implement Entity and describe themselves with EntityDescriptor

use super::row::MappedRow;
use crate::error::ReplicaResult;
use crate::value::Value;

/// A value type that can be replicated from a source table.
///
/// `describe` is consulted once per type per [`SchemaRegistry`]; the result is
/// cached, so it should be a pure function.
///
/// ```
/// use memreplica::{Entity, EntityDescriptor, Field, MappedRow, ReplicaResult, Value};
///
/// #[derive(Debug, Clone)]
/// struct User {
///     id: i64,
///     first_name: String,
/// }
///
/// impl Entity for User {
///     fn describe() -> EntityDescriptor {
///         EntityDescriptor::new("User")
///             .table("users")
///             .field(Field::new("id"))
///             .field(Field::new("first_name").column("FirstName"))
///     }
///
///     fn from_row(row: &MappedRow<'_>) -> ReplicaResult<Self> {
///         Ok(Self {
///             id: row.get("id")?,
///             first_name: row.get("first_name")?,
///         })
///     }
///
///     fn member(&self, name: &str) -> Option<Value> {
///         match name {
///             "id" => Some(self.id.into()),
///             "first_name" => Some(self.first_name.clone().into()),
///             _ => None,
///         }
///     }
/// }
/// ```
///
/// [`SchemaRegistry`]: crate::schema::SchemaRegistry
pub trait Entity: Sized + Send + Sync + 'static {
    /// Declared metadata for this type.
    fn describe() -> EntityDescriptor;

    /// Build a value from one fetched row.
    fn from_row(row: &MappedRow<'_>) -> ReplicaResult<Self>;

    /// Read a member back out; used to derive default keys.
    fn member(&self, name: &str) -> Option<Value>;
}

/// Builder for an entity's declared metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub(crate) type_name: String,
    pub(crate) table: Option<String>,
    pub(crate) namespace: Option<String>,
    pub(crate) fields: Vec<Field>,
    pub(crate) tombstone_column: Option<String>,
    pub(crate) version_column: Option<String>,
}

impl EntityDescriptor {
    /// Start a descriptor. `type_name` doubles as the table name unless
    /// [`table`](Self::table) overrides it.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            table: None,
            namespace: None,
            fields: Vec::new(),
            tombstone_column: None,
            version_column: None,
        }
    }

    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table = Some(name.into());
        self
    }

    /// Schema/namespace prefix joined to the table name with `.`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Column flagging logically deleted rows, overriding the reader default.
    pub fn tombstone(mut self, column: impl Into<String>) -> Self {
        self.tombstone_column = Some(column.into());
        self
    }

    /// Version counter column, overriding the reader default.
    pub fn version_column(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// One member of an entity and how it binds to a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub(crate) member: String,
    pub(crate) column: Option<String>,
    pub(crate) row_key: bool,
    pub(crate) ignored: bool,
}

impl Field {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            column: None,
            row_key: false,
            ignored: false,
        }
    }

    /// Bind to a column whose name differs from the member name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column = Some(name.into());
        self
    }

    /// Designate this member as the row key.
    pub fn row_key(mut self) -> Self {
        self.row_key = true;
        self
    }

    /// Exclude this member from column binding.
    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }
}
