// ABOUTME: Integration tests for replicating from PostgreSQL
// ABOUTME: Require TEST_SOURCE_URL; run with `cargo test -- --ignored`

use memreplica::{
    Entity, EntityDescriptor, Field, MappedRow, PostgresSource, ReplicaConfig, ReplicaResult,
    SchemaRegistry, Table, TableOptions, Value, WatermarkCodec, WatermarkMode,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Helper to get the test database URL from environment
fn get_test_url() -> Option<String> {
    env::var("TEST_SOURCE_URL").ok()
}

#[derive(Debug, Clone)]
struct Account {
    id: i64,
    email: String,
    balance: f64,
}

impl Entity for Account {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("Account")
            .table("memreplica_accounts")
            .namespace("public")
            .field(Field::new("id"))
            .field(Field::new("email"))
            .field(Field::new("balance"))
    }

    fn from_row(row: &MappedRow<'_>) -> ReplicaResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            email: row.get("email")?,
            balance: row.get("balance")?,
        })
    }

    fn member(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "email" => Some(self.email.clone().into()),
            "balance" => Some(self.balance.into()),
            _ => None,
        }
    }
}

async fn setup(source: &PostgresSource) -> anyhow::Result<()> {
    source
        .client()
        .batch_execute(
            r#"
            DROP TABLE IF EXISTS "public"."memreplica_accounts";
            CREATE SEQUENCE IF NOT EXISTS memreplica_accounts_version;
            CREATE TABLE "public"."memreplica_accounts" (
                id BIGSERIAL PRIMARY KEY,
                email TEXT NOT NULL,
                balance DOUBLE PRECISION NOT NULL DEFAULT 0,
                version BIGINT NOT NULL DEFAULT nextval('memreplica_accounts_version'),
                is_deleted BOOLEAN
            );
            INSERT INTO "public"."memreplica_accounts" (email, balance)
            SELECT 'user' || g || '@example.com', g FROM generate_series(1, 250) g;
            "#,
        )
        .await?;
    Ok(())
}

async fn cleanup(source: &PostgresSource) {
    let _ = source
        .client()
        .batch_execute(r#"DROP TABLE IF EXISTS "public"."memreplica_accounts" CASCADE"#)
        .await;
}

fn config() -> ReplicaConfig {
    ReplicaConfig {
        watermark: WatermarkMode::VersionColumn {
            column: "version".to_string(),
            codec: WatermarkCodec::Integer,
        },
        tombstone_column: Some("is_deleted".to_string()),
        batch_size: 100,
        poll_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Test: initial load and a tombstone delete through a real PostgreSQL source
#[tokio::test]
#[ignore]
async fn test_postgres_initial_load_and_delete() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let source = Arc::new(
        PostgresSource::connect(&url, true)
            .await
            .expect("Failed to connect to source"),
    );
    setup(&source).await.expect("Failed to create test table");

    let table = Table::<i64, Account>::new(
        source.clone(),
        &SchemaRegistry::new(),
        &config(),
        TableOptions::new(),
    )
    .unwrap();
    table.start(CancellationToken::new()).unwrap();
    table.when_initial_read_finished().wait().await.unwrap();
    assert_eq!(table.len(), 250);
    assert_eq!(table.progress().batches, 3);

    source
        .client()
        .batch_execute(
            r#"UPDATE "public"."memreplica_accounts"
               SET is_deleted = true, version = nextval('memreplica_accounts_version')
               WHERE id = 7"#,
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while table.contains_key(&7) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("delete not replicated");
    assert_eq!(table.len(), 249);

    table.shutdown().await;
    cleanup(&source).await;
}

/// Test: batch query quoting works for a namespace-qualified table
#[tokio::test]
#[ignore]
async fn test_postgres_row_key_watermark() {
    let url = get_test_url().expect("TEST_SOURCE_URL must be set");
    let source = Arc::new(
        PostgresSource::connect(&url, true)
            .await
            .expect("Failed to connect to source"),
    );
    setup(&source).await.expect("Failed to create test table");

    let table = Table::<i64, Account>::new(
        source.clone(),
        &SchemaRegistry::new(),
        &config(),
        TableOptions::new()
            .watermark(WatermarkMode::RowKey)
            .without_tombstone(),
    )
    .unwrap();
    table.start(CancellationToken::new()).unwrap();
    table.when_initial_read_finished().wait().await.unwrap();
    assert_eq!(table.len(), 250);
    assert_eq!(table.get(&250).unwrap().email, "user250@example.com");

    table.shutdown().await;
    cleanup(&source).await;
}
