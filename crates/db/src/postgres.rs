//! Postgres-backed [`Store`].

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        ActivityRecord, ApprovalRecord, NewActivity, NewApproval, NewStageInstance, NewWorkItem,
        StageInstanceRecord, WorkItemRecord,
    },
    repository::{activity, approvals, stage_instances, work_items},
    store::{Store, StoreTx},
};

/// Type alias for the shared Postgres pool.
pub type DbPool = PgPool;

/// A [`Store`] over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with at most `max_connections` connections.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        info!("Connecting to database (max_connections={})", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded migrations from the workspace `migrations/` directory.
    pub async fn migrate(&self) -> Result<(), DbError> {
        info!("Running database migrations");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Register a work item outside of any orchestration transaction.
    pub async fn insert_work_item(&self, new: NewWorkItem) -> Result<WorkItemRecord, DbError> {
        let mut conn = self.pool.acquire().await?;
        work_items::insert_work_item(&mut conn, new).await
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, DbError> {
        Ok(PgTx { tx: self.pool.begin().await? })
    }
}

/// An open Postgres transaction.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn get_work_item(&mut self, id: Uuid) -> Result<WorkItemRecord, DbError> {
        work_items::get_work_item(&mut self.tx, id).await
    }

    async fn update_work_item(&mut self, item: &WorkItemRecord) -> Result<(), DbError> {
        work_items::update_work_item(&mut self.tx, item).await
    }

    async fn create_stage_instance(
        &mut self,
        new: NewStageInstance,
    ) -> Result<StageInstanceRecord, DbError> {
        stage_instances::create_stage_instance(&mut self.tx, new).await
    }

    async fn get_stage_instance(&mut self, id: Uuid) -> Result<StageInstanceRecord, DbError> {
        stage_instances::get_stage_instance(&mut self.tx, id).await
    }

    async fn update_stage_instance(
        &mut self,
        instance: &StageInstanceRecord,
    ) -> Result<(), DbError> {
        stage_instances::update_stage_instance(&mut self.tx, instance).await
    }

    async fn create_approval(&mut self, new: NewApproval) -> Result<ApprovalRecord, DbError> {
        approvals::create_approval(&mut self.tx, new).await
    }

    async fn append_activity(&mut self, new: NewActivity) -> Result<ActivityRecord, DbError> {
        activity::append_activity(&mut self.tx, new).await
    }

    async fn commit(self) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DbError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
