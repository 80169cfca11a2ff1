//! `activity_log` table operations. The log is append-only.

use sqlx::PgConnection;

use crate::{
    DbError,
    models::{ActivityRecord, NewActivity},
};

pub async fn append_activity(
    conn: &mut PgConnection,
    new: NewActivity,
) -> Result<ActivityRecord, DbError> {
    let record = new.into_record();

    sqlx::query(
        r#"
        INSERT INTO activity_log (id, work_item_id, action, details, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(record.id)
    .bind(record.work_item_id)
    .bind(&record.action)
    .bind(&record.details)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(record)
}
