//! pgtemp-backed test harness.
//!
//! Spins up a throwaway Postgres, applies the migrations, and seeds one
//! account so tests can attach integrations to it. Available to this crate's
//! in-tree tests and, behind the `test-support` feature, to downstream
//! crates' tests.

use pgtemp::PgTempDB;
use uuid::Uuid;

use crate::{DEFAULT_POOL_SIZE, WarehouseDb, integrations::IntegrationKind};

/// A temporary warehouse with one seeded account.
pub struct TestWarehouse {
    pub db: WarehouseDb,
    pub account_id: Uuid,
    // Dropping the temp DB tears down the server; keep it alive with the pool.
    _temp: PgTempDB,
}

impl TestWarehouse {
    /// Boot a temp database, run migrations, seed an account.
    pub async fn new() -> TestWarehouse {
        let temp = PgTempDB::new();
        let db = WarehouseDb::connect(&temp.connection_uri(), DEFAULT_POOL_SIZE)
            .await
            .expect("failed to connect to temp warehouse");
        db.run_migrations().await.expect("failed to run migrations");

        let account_id: Uuid = sqlx::query_scalar(
            "INSERT INTO accounts (name, currency) VALUES ('Test Account', 'AUD') RETURNING id",
        )
        .fetch_one(db.pool())
        .await
        .expect("failed to seed account");

        TestWarehouse {
            db,
            account_id,
            _temp: temp,
        }
    }

    /// Seed a connected integration for the test account.
    pub async fn add_integration(&self, kind: IntegrationKind, external_ref: &str) -> Uuid {
        sqlx::query_scalar(
            "INSERT INTO integrations (account_id, kind, external_ref) \
             VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(self.account_id)
        .bind(kind)
        .bind(external_ref)
        .fetch_one(self.db.pool())
        .await
        .expect("failed to seed integration")
    }

    /// Seed a secret for an integration.
    pub async fn add_secret(&self, integration_id: Uuid, key: &str, value: &str) {
        sqlx::query(
            "INSERT INTO integration_secrets (integration_id, key, value) VALUES ($1, $2, $3)",
        )
        .bind(integration_id)
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await
        .expect("failed to seed secret");
    }
}
