// The relational side the core still owns directly (spec.md §0): endpoint
// registry, receipts, the subscription table, and the audit timeline
// overflow store. Pool creation and migration running follow the teacher's
// `db.rs` shape; per-table query functions live in `repo/`, one file per
// table, using runtime `sqlx::query()` + `.bind()` / `.get()` rather than
// the compile-time `query!` macro (this workspace carries no live database
// for macro verification).

pub mod repo;

use crate::error::StorageError;
use crate::traits::RelationalStore;
use apix_protocol::{AuditRecord, DeliveryEndpoint, DeliveryReceipt, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(StorageError::from)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StorageError::Operation(e.to_string()))
}

/// `RelationalStore` backed by a live Postgres pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresStore { pool }
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn put_endpoint(&self, endpoint: &DeliveryEndpoint) -> Result<(), StorageError> {
        repo::endpoints::put(&self.pool, endpoint).await.map_err(StorageError::from)
    }

    async fn get_endpoint(
        &self,
        org_id: &str,
        endpoint_id: &str,
    ) -> Result<Option<DeliveryEndpoint>, StorageError> {
        repo::endpoints::get(&self.pool, org_id, endpoint_id)
            .await
            .map_err(StorageError::from)
    }

    async fn list_endpoints(&self, org_id: &str) -> Result<Vec<DeliveryEndpoint>, StorageError> {
        repo::endpoints::list(&self.pool, org_id).await.map_err(StorageError::from)
    }

    async fn delete_endpoint(&self, org_id: &str, endpoint_id: &str) -> Result<(), StorageError> {
        repo::endpoints::delete(&self.pool, org_id, endpoint_id)
            .await
            .map_err(StorageError::from)
    }

    async fn put_receipt(&self, receipt: &DeliveryReceipt) -> Result<(), StorageError> {
        repo::receipts::put(&self.pool, receipt).await.map_err(StorageError::from)
    }

    async fn get_receipt(
        &self,
        org_id: &str,
        receipt_id: &str,
    ) -> Result<Option<DeliveryReceipt>, StorageError> {
        repo::receipts::get(&self.pool, org_id, receipt_id)
            .await
            .map_err(StorageError::from)
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        repo::subscriptions::put(&self.pool, subscription)
            .await
            .map_err(StorageError::from)
    }

    async fn deactivate_subscription(
        &self,
        org_id: &str,
        subscription_id: &str,
    ) -> Result<(), StorageError> {
        repo::subscriptions::deactivate(&self.pool, org_id, subscription_id)
            .await
            .map_err(StorageError::from)
    }

    async fn list_subscriptions(&self, org_id: &str) -> Result<Vec<Subscription>, StorageError> {
        repo::subscriptions::list(&self.pool, org_id)
            .await
            .map_err(StorageError::from)
    }

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StorageError> {
        repo::audit::insert(&self.pool, record).await.map_err(StorageError::from)
    }

    async fn query_audit_records(
        &self,
        org_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        max_n: usize,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        repo::audit::query(&self.pool, org_id, t0, t1, max_n)
            .await
            .map_err(StorageError::from)
    }
}
