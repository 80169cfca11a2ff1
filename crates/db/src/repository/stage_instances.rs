//! `stage_instances` table operations.

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use super::{get_parsed, get_u32, to_i32};
use crate::{
    DbError,
    models::{NewStageInstance, StageInstanceRecord},
};

const COLUMNS: &str = "id, work_item_id, workflow_id, stage_ref, stage_index, agent_role, \
    status, iteration, label, input, output, feedback, artifacts, created_at, updated_at";

fn decode(row: &PgRow) -> Result<StageInstanceRecord, DbError> {
    Ok(StageInstanceRecord {
        id: row.try_get("id")?,
        work_item_id: row.try_get("work_item_id")?,
        workflow_id: row.try_get("workflow_id")?,
        stage_ref: row.try_get("stage_ref")?,
        stage_index: get_u32(row, "stage_index")?,
        agent_role: row.try_get("agent_role")?,
        status: get_parsed(row, "status")?,
        iteration: get_u32(row, "iteration")?,
        label: row.try_get("label")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        feedback: row.try_get("feedback")?,
        artifacts: row.try_get("artifacts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new `in_progress` stage instance.
pub async fn create_stage_instance(
    conn: &mut PgConnection,
    new: NewStageInstance,
) -> Result<StageInstanceRecord, DbError> {
    let record = new.into_record();

    sqlx::query(
        r#"
        INSERT INTO stage_instances
            (id, work_item_id, workflow_id, stage_ref, stage_index, agent_role, status,
             iteration, label, input, artifacts, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
        "#,
    )
    .bind(record.id)
    .bind(record.work_item_id)
    .bind(&record.workflow_id)
    .bind(&record.stage_ref)
    .bind(to_i32(record.stage_index, "stage_index")?)
    .bind(&record.agent_role)
    .bind(record.status.as_str())
    .bind(to_i32(record.iteration, "iteration")?)
    .bind(&record.label)
    .bind(&record.input)
    .bind(&record.artifacts)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(record)
}

pub async fn get_stage_instance(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<StageInstanceRecord, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM stage_instances WHERE id = $1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DbError::NotFound { entity: "stage instance", id })?;

    decode(&row)
}

/// Record the outcome columns (status, output, feedback, artifacts).
pub async fn update_stage_instance(
    conn: &mut PgConnection,
    instance: &StageInstanceRecord,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE stage_instances
        SET status = $1, output = $2, feedback = $3, artifacts = $4, updated_at = $5
        WHERE id = $6
        "#,
    )
    .bind(instance.status.as_str())
    .bind(&instance.output)
    .bind(&instance.feedback)
    .bind(&instance.artifacts)
    .bind(Utc::now())
    .bind(instance.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: "stage instance", id: instance.id });
    }

    Ok(())
}
