// ABOUTME: Schema resolution from entity descriptors, cached per type
// ABOUTME: Resolves table identifier, column bindings and the single row-key column

use super::descriptor::{Entity, EntityDescriptor};
use crate::error::{ReplicaError, ReplicaResult};
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Member used as row key when no field is explicitly designated. Matched
/// ignoring ASCII case, an exact match winning.
pub const CONVENTIONAL_KEY_MEMBER: &str = "id";

/// Separator between namespace and table segments.
pub const NAMESPACE_SEPARATOR: char = '.';

/// A member bound to a source column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub member: String,
    pub column: String,
}

/// Resolved, immutable metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    type_name: String,
    table: String,
    bindings: Vec<ColumnBinding>,
    row_key: Option<ColumnBinding>,
    tombstone_column: Option<String>,
    version_column: Option<String>,
}

fn conventional_key(
    type_name: &str,
    bindings: &[ColumnBinding],
) -> ReplicaResult<Option<ColumnBinding>> {
    if let Some(exact) = bindings.iter().find(|b| b.member == CONVENTIONAL_KEY_MEMBER) {
        return Ok(Some(exact.clone()));
    }
    let candidates: Vec<&ColumnBinding> = bindings
        .iter()
        .filter(|b| b.member.eq_ignore_ascii_case(CONVENTIONAL_KEY_MEMBER))
        .collect();
    match candidates.as_slice() {
        [] => Ok(None),
        [single] => Ok(Some((*single).clone())),
        many => Err(ReplicaError::AmbiguousRowKey {
            type_name: type_name.to_string(),
            members: many.iter().map(|b| b.member.clone()).collect(),
        }),
    }
}

impl TypeSchema {
    /// Resolve a descriptor.
    ///
    /// Fails with [`ReplicaError::AmbiguousRowKey`] when more than one member
    /// is designated as row key. A type without any row key resolves; the
    /// absence surfaces from [`row_key`](Self::row_key) where a key is needed.
    pub fn resolve(desc: EntityDescriptor) -> ReplicaResult<Self> {
        let mut seen = HashSet::new();
        for field in &desc.fields {
            if !seen.insert(field.member.as_str()) {
                return Err(ReplicaError::invalid_argument(
                    "fields",
                    format!(
                        "member `{}` declared twice on type {}",
                        field.member, desc.type_name
                    ),
                ));
            }
        }

        let members: Vec<_> = desc.fields.iter().filter(|f| !f.ignored).collect();

        let bindings: Vec<ColumnBinding> = members
            .iter()
            .map(|f| ColumnBinding {
                member: f.member.clone(),
                column: f.column.clone().unwrap_or_else(|| f.member.clone()),
            })
            .collect();

        let designated: Vec<&ColumnBinding> = members
            .iter()
            .zip(&bindings)
            .filter(|(f, _)| f.row_key)
            .map(|(_, b)| b)
            .collect();

        let row_key = match designated.as_slice() {
            [] => conventional_key(&desc.type_name, &bindings)?,
            [single] => Some((*single).clone()),
            many => {
                return Err(ReplicaError::AmbiguousRowKey {
                    type_name: desc.type_name.clone(),
                    members: many.iter().map(|b| b.member.clone()).collect(),
                })
            }
        };

        let base = desc.table.clone().unwrap_or_else(|| desc.type_name.clone());
        let table = match &desc.namespace {
            Some(ns) => format!("{}{}{}", ns, NAMESPACE_SEPARATOR, base),
            None => base,
        };

        Ok(Self {
            type_name: desc.type_name,
            table,
            bindings,
            row_key,
            tombstone_column: desc.tombstone_column,
            version_column: desc.version_column,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Table identifier, possibly namespace-qualified.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn bindings(&self) -> &[ColumnBinding] {
        &self.bindings
    }

    pub fn binding(&self, member: &str) -> Option<&ColumnBinding> {
        self.bindings.iter().find(|b| b.member == member)
    }

    pub fn has_row_key(&self) -> bool {
        self.row_key.is_some()
    }

    /// The row-key binding, or [`ReplicaError::RowKeyNotSpecified`].
    pub fn row_key(&self) -> ReplicaResult<&ColumnBinding> {
        self.row_key
            .as_ref()
            .ok_or_else(|| ReplicaError::RowKeyNotSpecified {
                type_name: self.type_name.clone(),
            })
    }

    pub fn tombstone_column(&self) -> Option<&str> {
        self.tombstone_column.as_deref()
    }

    pub fn version_column(&self) -> Option<&str> {
        self.version_column.as_deref()
    }
}

/// Thread-safe, read-mostly cache of resolved schemas keyed by type.
///
/// Entries are built lazily on first use and never change afterwards.
/// Concurrent first access may resolve a descriptor twice; only one result
/// is stored and both callers observe it.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<TypeId, Arc<TypeSchema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `T`, using the cached schema when present.
    pub fn resolve<T: Entity>(&self) -> ReplicaResult<Arc<TypeSchema>> {
        let type_id = TypeId::of::<T>();
        if let Some(schema) = self.schemas.read().get(&type_id) {
            return Ok(Arc::clone(schema));
        }

        // Resolve outside the lock; describe() is user code.
        let resolved = Arc::new(TypeSchema::resolve(T::describe())?);
        tracing::debug!(
            "Resolved schema for {} -> table {} ({} columns)",
            resolved.type_name(),
            resolved.table(),
            resolved.bindings().len()
        );

        let mut schemas = self.schemas.write();
        Ok(Arc::clone(schemas.entry(type_id).or_insert(resolved)))
    }

    /// Number of cached schemas.
    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, MappedRow};
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user_descriptor() -> EntityDescriptor {
        EntityDescriptor::new("User")
            .field(Field::new("id"))
            .field(Field::new("first_name").column("FirstName"))
            .field(Field::new("scratch").ignored())
    }

    #[test]
    fn test_bindings_skip_ignored_members() {
        let schema = TypeSchema::resolve(user_descriptor()).unwrap();
        let columns: Vec<&str> = schema.bindings().iter().map(|b| b.column.as_str()).collect();
        assert_eq!(columns, vec!["id", "FirstName"]);
        assert!(schema.binding("scratch").is_none());
    }

    #[test]
    fn test_row_key_falls_back_to_id_member() {
        let schema = TypeSchema::resolve(user_descriptor()).unwrap();
        assert_eq!(schema.row_key().unwrap().member, "id");
    }

    #[test]
    fn test_row_key_fallback_ignores_case() {
        let desc = EntityDescriptor::new("Customer")
            .field(Field::new("Id"))
            .field(Field::new("Name"));
        let schema = TypeSchema::resolve(desc).unwrap();
        assert_eq!(schema.row_key().unwrap().column, "Id");

        let both = EntityDescriptor::new("Customer2")
            .field(Field::new("ID"))
            .field(Field::new("id"));
        let schema = TypeSchema::resolve(both).unwrap();
        assert_eq!(schema.row_key().unwrap().member, "id");

        let clash = EntityDescriptor::new("Customer3")
            .field(Field::new("Id"))
            .field(Field::new("ID"));
        assert!(matches!(
            TypeSchema::resolve(clash),
            Err(ReplicaError::AmbiguousRowKey { .. })
        ));
    }

    #[test]
    fn test_explicit_row_key_uses_column_override() {
        let desc = EntityDescriptor::new("User2")
            .field(Field::new("id"))
            .field(Field::new("user_id").column("Id2").row_key());
        let schema = TypeSchema::resolve(desc).unwrap();
        let key = schema.row_key().unwrap();
        assert_eq!(key.member, "user_id");
        assert_eq!(key.column, "Id2");
    }

    #[test]
    fn test_two_row_keys_are_ambiguous() {
        let desc = EntityDescriptor::new("User3")
            .field(Field::new("a").row_key())
            .field(Field::new("b").row_key());
        match TypeSchema::resolve(desc) {
            Err(ReplicaError::AmbiguousRowKey { type_name, members }) => {
                assert_eq!(type_name, "User3");
                assert_eq!(members, vec!["a", "b"]);
            }
            other => panic!("expected ambiguous row key, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_row_key_names_type() {
        let desc = EntityDescriptor::new("User4").field(Field::new("name"));
        let schema = TypeSchema::resolve(desc).unwrap();
        let err = schema.row_key().unwrap_err();
        assert!(matches!(err, ReplicaError::RowKeyNotSpecified { .. }));
        assert!(err.to_string().contains("User4"));
    }

    #[test]
    fn test_table_name_resolution() {
        let plain = TypeSchema::resolve(EntityDescriptor::new("User")).unwrap();
        assert_eq!(plain.table(), "User");

        let renamed = TypeSchema::resolve(EntityDescriptor::new("User").table("Users")).unwrap();
        assert_eq!(renamed.table(), "Users");

        let qualified = TypeSchema::resolve(
            EntityDescriptor::new("User").table("Users").namespace("dbo"),
        )
        .unwrap();
        assert_eq!(qualified.table(), "dbo.Users");
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let desc = EntityDescriptor::new("Dup")
            .field(Field::new("id"))
            .field(Field::new("id"));
        assert!(matches!(
            TypeSchema::resolve(desc),
            Err(ReplicaError::InvalidArgument { .. })
        ));
    }

    static DESCRIBE_CALLS: AtomicUsize = AtomicUsize::new(0);

    struct Counted;

    impl Entity for Counted {
        fn describe() -> EntityDescriptor {
            DESCRIBE_CALLS.fetch_add(1, Ordering::SeqCst);
            EntityDescriptor::new("Counted").field(Field::new("id"))
        }

        fn from_row(_row: &MappedRow<'_>) -> ReplicaResult<Self> {
            Ok(Counted)
        }

        fn member(&self, _name: &str) -> Option<Value> {
            None
        }
    }

    #[test]
    fn test_registry_caches_per_type() {
        let registry = SchemaRegistry::new();
        let first = registry.resolve::<Counted>().unwrap();
        let second = registry.resolve::<Counted>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(DESCRIBE_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    struct Contended;

    impl Entity for Contended {
        fn describe() -> EntityDescriptor {
            EntityDescriptor::new("Contended").field(Field::new("id"))
        }

        fn from_row(_row: &MappedRow<'_>) -> ReplicaResult<Self> {
            Ok(Contended)
        }

        fn member(&self, _name: &str) -> Option<Value> {
            None
        }
    }

    #[test]
    fn test_registry_concurrent_first_access_converges() {
        let registry = Arc::new(SchemaRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.resolve::<Contended>().unwrap())
            })
            .collect();
        let schemas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let cached = registry.resolve::<Contended>().unwrap();
        assert!(schemas.iter().all(|s| **s == *cached));
        assert_eq!(registry.len(), 1);
    }
}
