//! In-process [`Store`] used by tests, the CLI simulator, and embedders that
//! do not need durability.
//!
//! Transactions are fully serialized: `begin` takes an owned lock on the
//! committed state and works on a private copy of it. `commit` swaps the copy
//! in; dropping the transaction throws it away. Never hold two transactions
//! from the same `MemoryStore` in one task; the second `begin` would wait on
//! the first forever.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        ActivityRecord, ApprovalRecord, NewActivity, NewApproval, NewStageInstance, NewWorkItem,
        StageInstanceRecord, WorkItemRecord,
    },
    store::{Store, StoreTx},
};

/// Operations at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    UpdateWorkItem,
    CreateStageInstance,
    UpdateStageInstance,
    CreateApproval,
    AppendActivity,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    work_items: Vec<WorkItemRecord>,
    stage_instances: Vec<StageInstanceRecord>,
    approvals: Vec<ApprovalRecord>,
    activity: Vec<ActivityRecord>,
}

/// Shared handle to an in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    armed: Arc<StdMutex<Option<FailPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a work item outside of any orchestration transaction.
    pub async fn insert_work_item(&self, new: NewWorkItem) -> WorkItemRecord {
        let record = new.into_record();
        self.state.lock().await.work_items.push(record.clone());
        record
    }

    /// Make the next call to `point` (in any transaction) fail once.
    pub fn fail_next(&self, point: FailPoint) {
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = Some(point);
    }

    // ------ committed-state readers ------

    pub async fn work_item(&self, id: Uuid) -> Option<WorkItemRecord> {
        self.state.lock().await.work_items.iter().find(|w| w.id == id).cloned()
    }

    /// Stage instances of a work item in creation order.
    pub async fn stage_instances(&self, work_item_id: Uuid) -> Vec<StageInstanceRecord> {
        self.state
            .lock()
            .await
            .stage_instances
            .iter()
            .filter(|s| s.work_item_id == work_item_id)
            .cloned()
            .collect()
    }

    pub async fn approvals(&self, work_item_id: Uuid) -> Vec<ApprovalRecord> {
        self.state
            .lock()
            .await
            .approvals
            .iter()
            .filter(|a| a.work_item_id == work_item_id)
            .cloned()
            .collect()
    }

    /// Activity entries of a work item in append order.
    pub async fn activity(&self, work_item_id: Uuid) -> Vec<ActivityRecord> {
        self.state
            .lock()
            .await
            .activity
            .iter()
            .filter(|a| a.work_item_id == work_item_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, DbError> {
        let committed = self.state.clone().lock_owned().await;
        let working = committed.clone();
        Ok(MemoryTx {
            committed,
            working,
            armed: self.armed.clone(),
        })
    }
}

/// A serialized in-memory transaction.
pub struct MemoryTx {
    committed: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    armed: Arc<StdMutex<Option<FailPoint>>>,
}

impl MemoryTx {
    fn trip(&self, point: FailPoint) -> Result<(), DbError> {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        if *armed == Some(point) {
            *armed = None;
            return Err(DbError::Unavailable(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_work_item(&mut self, id: Uuid) -> Result<WorkItemRecord, DbError> {
        self.working
            .work_items
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or(DbError::NotFound { entity: "work item", id })
    }

    async fn update_work_item(&mut self, item: &WorkItemRecord) -> Result<(), DbError> {
        self.trip(FailPoint::UpdateWorkItem)?;
        let slot = self
            .working
            .work_items
            .iter_mut()
            .find(|w| w.id == item.id)
            .ok_or(DbError::NotFound { entity: "work item", id: item.id })?;
        *slot = item.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn create_stage_instance(
        &mut self,
        new: NewStageInstance,
    ) -> Result<StageInstanceRecord, DbError> {
        self.trip(FailPoint::CreateStageInstance)?;
        let record = new.into_record();
        self.working.stage_instances.push(record.clone());
        Ok(record)
    }

    async fn get_stage_instance(&mut self, id: Uuid) -> Result<StageInstanceRecord, DbError> {
        self.working
            .stage_instances
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(DbError::NotFound { entity: "stage instance", id })
    }

    async fn update_stage_instance(
        &mut self,
        instance: &StageInstanceRecord,
    ) -> Result<(), DbError> {
        self.trip(FailPoint::UpdateStageInstance)?;
        let slot = self
            .working
            .stage_instances
            .iter_mut()
            .find(|s| s.id == instance.id)
            .ok_or(DbError::NotFound { entity: "stage instance", id: instance.id })?;
        *slot = instance.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn create_approval(&mut self, new: NewApproval) -> Result<ApprovalRecord, DbError> {
        self.trip(FailPoint::CreateApproval)?;
        let record = new.into_record();
        self.working.approvals.push(record.clone());
        Ok(record)
    }

    async fn append_activity(&mut self, new: NewActivity) -> Result<ActivityRecord, DbError> {
        self.trip(FailPoint::AppendActivity)?;
        let record = new.into_record();
        self.working.activity.push(record.clone());
        Ok(record)
    }

    async fn commit(mut self) -> Result<(), DbError> {
        self.trip(FailPoint::Commit)?;
        *self.committed = std::mem::take(&mut self.working);
        debug!("memory transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), DbError> {
        debug!("memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, WorkItemRecord) {
        let store = MemoryStore::new();
        let item = store.insert_work_item(NewWorkItem::titled("Add login page")).await;
        (store, item)
    }

    #[tokio::test]
    async fn committed_changes_become_visible() {
        let (store, item) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        tx.append_activity(NewActivity::new(item.id, "workflow.started", json!({})))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let activity = store.activity(item.id).await;
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].action, "workflow.started");
    }

    #[tokio::test]
    async fn dropped_transaction_discards_changes() {
        let (store, item) = seeded().await;

        {
            let mut tx = store.begin().await.unwrap();
            let mut changed = tx.get_work_item(item.id).await.unwrap();
            changed.title = "renamed".into();
            tx.update_work_item(&changed).await.unwrap();
            // no commit
        }

        assert_eq!(store.work_item(item.id).await.unwrap().title, "Add login page");
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let (store, item) = seeded().await;
        store.fail_next(FailPoint::AppendActivity);

        let mut tx = store.begin().await.unwrap();
        let first = tx
            .append_activity(NewActivity::new(item.id, "a", json!({})))
            .await;
        assert!(matches!(first, Err(DbError::Unavailable(_))));
        let second = tx
            .append_activity(NewActivity::new(item.id, "b", json!({})))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn missing_work_item_is_not_found() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let missing = Uuid::new_v4();
        assert!(matches!(
            tx.get_work_item(missing).await,
            Err(DbError::NotFound { id, .. }) if id == missing
        ));
    }
}
