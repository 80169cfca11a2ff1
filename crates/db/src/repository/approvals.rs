//! `approvals` table operations.

use sqlx::PgConnection;

use crate::{
    DbError,
    models::{ApprovalRecord, NewApproval},
};

/// Insert a `pending` approval request.
pub async fn create_approval(
    conn: &mut PgConnection,
    new: NewApproval,
) -> Result<ApprovalRecord, DbError> {
    let record = new.into_record();

    sqlx::query(
        r#"
        INSERT INTO approvals
            (id, work_item_id, stage_instance_id, kind, reason, status, message, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(record.id)
    .bind(record.work_item_id)
    .bind(record.stage_instance_id)
    .bind(&record.kind)
    .bind(&record.reason)
    .bind(record.status.as_str())
    .bind(&record.message)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(record)
}
