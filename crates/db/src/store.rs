//! The transactional store seam consumed by the engine.
//!
//! A [`Store`] hands out [`StoreTx`] units of work. Everything done through a
//! `StoreTx` becomes visible together on [`StoreTx::commit`]; dropping the
//! transaction (or calling [`StoreTx::rollback`]) discards all of it.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        ActivityRecord, ApprovalRecord, NewActivity, NewApproval, NewStageInstance,
        StageInstanceRecord, WorkItemRecord,
    },
};

/// A backing store able to open transactions.
#[async_trait]
pub trait Store: Send + Sync {
    type Tx: StoreTx;

    /// Open a new unit of work.
    async fn begin(&self) -> Result<Self::Tx, DbError>;
}

/// One open unit of work.
#[async_trait]
pub trait StoreTx: Send {
    async fn get_work_item(&mut self, id: Uuid) -> Result<WorkItemRecord, DbError>;

    /// Overwrite the stored work item with `item` (matched by `item.id`).
    async fn update_work_item(&mut self, item: &WorkItemRecord) -> Result<(), DbError>;

    async fn create_stage_instance(
        &mut self,
        new: NewStageInstance,
    ) -> Result<StageInstanceRecord, DbError>;

    async fn get_stage_instance(&mut self, id: Uuid) -> Result<StageInstanceRecord, DbError>;

    async fn update_stage_instance(
        &mut self,
        instance: &StageInstanceRecord,
    ) -> Result<(), DbError>;

    async fn create_approval(&mut self, new: NewApproval) -> Result<ApprovalRecord, DbError>;

    async fn append_activity(&mut self, new: NewActivity) -> Result<ActivityRecord, DbError>;

    async fn commit(self) -> Result<(), DbError>;

    async fn rollback(self) -> Result<(), DbError>;
}
