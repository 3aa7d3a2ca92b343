// ABOUTME: Shared fixtures for replica unit tests
// ABOUTME: An `items` SQLite table with integer version and tombstone columns

use crate::config::{ReplicaConfig, WatermarkMode};
use crate::error::ReplicaResult;
use crate::schema::{Entity, EntityDescriptor, Field, MappedRow};
use crate::source::SqliteSource;
use crate::value::Value;
use crate::watermark::WatermarkCodec;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Item {
    pub id: i64,
    pub name: String,
}

impl Entity for Item {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Item")
            .table("items")
            .field(Field::new("id"))
            .field(Field::new("name"))
    }

    fn from_row(row: &MappedRow<'_>) -> ReplicaResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }

    fn member(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "name" => Some(self.name.clone().into()),
            _ => None,
        }
    }
}

/// Same table, but without a row key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Unkeyed {
    pub name: String,
}

impl Entity for Unkeyed {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Unkeyed")
            .table("items")
            .field(Field::new("name"))
    }

    fn from_row(row: &MappedRow<'_>) -> ReplicaResult<Self> {
        Ok(Self {
            name: row.get("name")?,
        })
    }

    fn member(&self, name: &str) -> Option<Value> {
        (name == "name").then(|| self.name.clone().into())
    }
}

pub(crate) fn item_config() -> ReplicaConfig {
    ReplicaConfig {
        watermark: WatermarkMode::VersionColumn {
            column: "version".to_string(),
            codec: WatermarkCodec::Integer,
        },
        tombstone_column: Some("deleted".to_string()),
        poll_delay: Duration::from_millis(10),
        batch_size: 100,
        ..Default::default()
    }
}

pub(crate) async fn item_source() -> SqliteSource {
    let source = SqliteSource::from_connection(
        rusqlite::Connection::open_in_memory().expect("in-memory database"),
    );
    source
        .execute_batch(
            "CREATE TABLE items (
                id INTEGER PRIMARY KEY,
                name TEXT,
                version INTEGER NOT NULL,
                deleted INTEGER DEFAULT 0
            );",
        )
        .await
        .expect("create items table");
    source
}
