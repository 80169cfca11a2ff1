//! `work_items` table operations.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use super::{get_opt_u32, get_parsed, get_u32, to_i32};
use crate::{
    DbError,
    models::{NewWorkItem, WorkItemRecord},
};

const COLUMNS: &str = "id, title, goal, priority, tags, metadata, status, workflow_id, \
    current_stage_index, current_stage_instance_id, iteration_count, loop_iterations, \
    blocked_reason, initial_context, created_at, updated_at";

fn decode(row: &PgRow) -> Result<WorkItemRecord, DbError> {
    Ok(WorkItemRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        goal: row.try_get("goal")?,
        priority: row.try_get("priority")?,
        tags: row.try_get("tags")?,
        metadata: row.try_get("metadata")?,
        status: get_parsed(row, "status")?,
        workflow_id: row.try_get("workflow_id")?,
        current_stage_index: get_opt_u32(row, "current_stage_index")?,
        current_stage_instance_id: row.try_get("current_stage_instance_id")?,
        iteration_count: get_u32(row, "iteration_count")?,
        loop_iterations: row.try_get::<Json<BTreeMap<String, u32>>, _>("loop_iterations")?.0,
        blocked_reason: row.try_get("blocked_reason")?,
        initial_context: row.try_get("initial_context")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Register a new work item in `pending` status.
pub async fn insert_work_item(
    conn: &mut PgConnection,
    new: NewWorkItem,
) -> Result<WorkItemRecord, DbError> {
    let record = new.into_record();

    sqlx::query(
        r#"
        INSERT INTO work_items
            (id, title, goal, priority, tags, metadata, status, iteration_count, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $8)
        "#,
    )
    .bind(record.id)
    .bind(&record.title)
    .bind(&record.goal)
    .bind(&record.priority)
    .bind(&record.tags)
    .bind(&record.metadata)
    .bind(record.status.as_str())
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(record)
}

/// Fetch a work item, locking its row for the rest of the transaction.
pub async fn get_work_item(conn: &mut PgConnection, id: Uuid) -> Result<WorkItemRecord, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM work_items WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DbError::NotFound { entity: "work item", id })?;

    decode(&row)
}

/// Persist every mutable orchestration column of `item`.
pub async fn update_work_item(conn: &mut PgConnection, item: &WorkItemRecord) -> Result<(), DbError> {
    let stage_index = item
        .current_stage_index
        .map(|i| to_i32(i, "current_stage_index"))
        .transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE work_items
        SET status = $1,
            workflow_id = $2,
            current_stage_index = $3,
            current_stage_instance_id = $4,
            iteration_count = $5,
            loop_iterations = $6,
            blocked_reason = $7,
            initial_context = $8,
            updated_at = $9
        WHERE id = $10
        "#,
    )
    .bind(item.status.as_str())
    .bind(&item.workflow_id)
    .bind(stage_index)
    .bind(item.current_stage_instance_id)
    .bind(to_i32(item.iteration_count, "iteration_count")?)
    .bind(Json(&item.loop_iterations))
    .bind(&item.blocked_reason)
    .bind(&item.initial_context)
    .bind(Utc::now())
    .bind(item.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "work item", id: item.id });
    }

    Ok(())
}
