//! Shared row mapping helpers for the SQLite repositories
//!
//! Identifiers are stored as TEXT and structured fields as JSON TEXT.

use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use taskmesh_core::{SchedulerError, SchedulerResult};

pub(crate) fn uuid_column(row: &SqliteRow, column: &str) -> SchedulerResult<Uuid> {
    let raw: String = row.try_get(column)?;
    parse_uuid(&raw, column)
}

pub(crate) fn optional_uuid_column(row: &SqliteRow, column: &str) -> SchedulerResult<Option<Uuid>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| parse_uuid(&value, column)).transpose()
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> SchedulerResult<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| SchedulerError::Serialization(format!("解析字段 {column} 失败: {e}")))
}

pub(crate) fn optional_json_column<T: DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> SchedulerResult<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        serde_json::from_str(&value)
            .map_err(|e| SchedulerError::Serialization(format!("解析字段 {column} 失败: {e}")))
    })
    .transpose()
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> SchedulerResult<String> {
    serde_json::to_string(value)
        .map_err(|e| SchedulerError::Serialization(format!("序列化{what}失败: {e}")))
}

fn parse_uuid(raw: &str, column: &str) -> SchedulerResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| SchedulerError::Serialization(format!("字段 {column} 不是有效的UUID: {e}")))
}
