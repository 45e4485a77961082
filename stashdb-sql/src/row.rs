//! Reading Postgres rows back into values, records and models.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use stashdb_core::{
    apply_column, ConverterRegistry, Model, Schema, StashResult, StorageError, Value, ID_COLUMN,
    ROW_UPDATED_AT,
};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row;

/// A raw row, keyed by column name.
pub type Record = BTreeMap<String, Value>;

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> StashResult<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        StorageError::Conversion {
            column: row.columns()[idx].name().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Read column `idx` as a [`Value`], choosing the variant from the column's
/// Postgres type.
pub fn column_value(row: &Row, idx: usize) -> StashResult<Value> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(|i| Value::Int(i32::from(i))),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::Int),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::BigInt),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(Value::Float),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(Value::Double),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            get::<String>(row, idx)?.map(Value::Text)
        }
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)?.map(Value::Timestamp),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?.map(Value::LocalDateTime),
        Type::DATE => get::<NaiveDate>(row, idx)?.map(Value::Date),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.map(Value::Json),
        other => {
            return Err(StorageError::Conversion {
                column: row.columns()[idx].name().to_string(),
                reason: format!("unsupported column type {}", other.name()),
            }
            .into())
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn column_index(row: &Row, name: &str) -> Option<usize> {
    row.columns().iter().position(|c| c.name() == name)
}

/// Every column of `row` as a [`Record`].
pub fn row_to_record(row: &Row) -> StashResult<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), column_value(row, idx)?);
    }
    Ok(record)
}

/// Deserialize a record into any serde type, matching fields by column name.
pub fn record_to_bean<T: DeserializeOwned>(record: &Record) -> StashResult<T> {
    let object: serde_json::Map<String, serde_json::Value> = record
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    Ok(serde_json::from_value(serde_json::Value::Object(object))?)
}

/// Map a row onto a fresh `M` through its schema.
///
/// Columns the query did not select are left at the model default.
pub fn row_to_model<M: Model>(
    row: &Row,
    schema: &Schema,
    converters: &ConverterRegistry,
) -> StashResult<M> {
    let mut model = M::default();
    for col in &schema.columns {
        let Some(idx) = column_index(row, &col.name) else {
            continue;
        };
        let stored = column_value(row, idx)?;
        apply_column(&mut model, col, stored, converters)?;
    }
    if let Some(idx) = column_index(row, ID_COLUMN) {
        if let Some(id) = column_value(row, idx)?.as_i64() {
            model.set_id(id);
        }
    }
    if let Some(idx) = column_index(row, ROW_UPDATED_AT) {
        if let Some(updated_at) = column_value(row, idx)?.as_timestamp() {
            model.set_last_modified_millis(updated_at.timestamp_millis());
        }
    }
    Ok(model)
}
