//! Postgres repository functions: one function per database operation.
//!
//! Every function takes a `&mut PgConnection` (usually the inside of an open
//! transaction) and returns a `Result<T, DbError>`. No orchestration logic,
//! no workflow definitions, just SQL plus row decoding.

pub mod work_items;
pub mod stage_instances;
pub mod approvals;
pub mod activity;

use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::DbError;

/// Read a non-negative INTEGER column as `u32`.
pub(crate) fn get_u32(row: &PgRow, column: &'static str) -> Result<u32, DbError> {
    let raw: i32 = row.try_get(column)?;
    u32::try_from(raw).map_err(|e| DbError::Decode { column, message: e.to_string() })
}

pub(crate) fn get_opt_u32(row: &PgRow, column: &'static str) -> Result<Option<u32>, DbError> {
    let raw: Option<i32> = row.try_get(column)?;
    raw.map(|v| u32::try_from(v).map_err(|e| DbError::Decode { column, message: e.to_string() }))
        .transpose()
}

/// Read a TEXT column and parse it into one of the status enums.
pub(crate) fn get_parsed<T>(row: &PgRow, column: &'static str) -> Result<T, DbError>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|message| DbError::Decode { column, message })
}

/// Bind-side counterpart of [`get_u32`].
pub(crate) fn to_i32(value: u32, column: &'static str) -> Result<i32, DbError> {
    i32::try_from(value).map_err(|e| DbError::Decode { column, message: e.to_string() })
}
