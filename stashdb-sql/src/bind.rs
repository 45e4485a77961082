//! Binding [`Value`]s as Postgres parameters.
//!
//! The target type comes from the prepared statement, so one `Value` can
//! bind to any compatible column type (an `Int` into `int8`, a `Timestamp`
//! into `timestamp`, and so on).

use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use stashdb_core::Value;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

type BindResult = Result<IsNull, Box<dyn Error + Sync + Send>>;

/// A borrowed [`Value`] that binds to whatever type the statement expects.
#[derive(Debug, Clone, Copy)]
pub struct PgArg<'a>(pub &'a Value);

/// Wrap each value for binding.
pub fn pg_args(values: &[Value]) -> Vec<PgArg<'_>> {
    values.iter().map(PgArg).collect()
}

/// Borrow wrapped values as the parameter slice `tokio-postgres` expects.
pub fn as_params<'a>(args: &'a [PgArg<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    args.iter().map(|arg| arg as &(dyn ToSql + Sync)).collect()
}

fn mismatch(value: &Value, ty: &Type) -> Box<dyn Error + Sync + Send> {
    format!("cannot bind {} to column type {}", value.type_name(), ty.name()).into()
}

fn is_text(ty: &Type) -> bool {
    matches!(*ty, Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN)
}

fn bind_int(i: i64, ty: &Type, out: &mut BytesMut) -> BindResult {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::INT8 => i.to_sql(ty, out),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::BOOL => (i != 0).to_sql(ty, out),
        _ if is_text(ty) => i.to_string().to_sql(ty, out),
        _ => Err(mismatch(&Value::BigInt(i), ty)),
    }
}

fn bind_float(f: f64, ty: &Type, out: &mut BytesMut) -> BindResult {
    match *ty {
        Type::FLOAT4 => (f as f32).to_sql(ty, out),
        Type::FLOAT8 => f.to_sql(ty, out),
        _ if is_text(ty) => f.to_string().to_sql(ty, out),
        _ => Err(mismatch(&Value::Double(f), ty)),
    }
}

fn bind_timestamp(t: DateTime<Utc>, ty: &Type, out: &mut BytesMut) -> BindResult {
    match *ty {
        Type::TIMESTAMPTZ => t.to_sql(ty, out),
        Type::TIMESTAMP => t.naive_utc().to_sql(ty, out),
        Type::DATE => t.date_naive().to_sql(ty, out),
        _ if is_text(ty) => t.to_rfc3339().to_sql(ty, out),
        _ => Err(mismatch(&Value::Timestamp(t), ty)),
    }
}

fn bind_naive(t: NaiveDateTime, ty: &Type, out: &mut BytesMut) -> BindResult {
    match *ty {
        Type::TIMESTAMP => t.to_sql(ty, out),
        Type::TIMESTAMPTZ => t.and_utc().to_sql(ty, out),
        Type::DATE => t.date().to_sql(ty, out),
        _ if is_text(ty) => t.to_string().to_sql(ty, out),
        _ => Err(mismatch(&Value::LocalDateTime(t), ty)),
    }
}

fn bind_date(d: NaiveDate, ty: &Type, out: &mut BytesMut) -> BindResult {
    match *ty {
        Type::DATE => d.to_sql(ty, out),
        Type::TIMESTAMP | Type::TIMESTAMPTZ => bind_naive(d.and_time(NaiveTime::MIN), ty, out),
        _ if is_text(ty) => d.to_string().to_sql(ty, out),
        _ => Err(mismatch(&Value::Date(d), ty)),
    }
}

impl ToSql for PgArg<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> BindResult {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => bind_int(i64::from(*b), ty, out),
                _ if is_text(ty) => b.to_string().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Int(i) => bind_int(i64::from(*i), ty, out),
            Value::BigInt(i) => bind_int(*i, ty, out),
            Value::Float(f) => bind_float(f64::from(*f), ty, out),
            Value::Double(f) => bind_float(*f, ty, out),
            Value::Text(s) | Value::Enum(s) => match *ty {
                Type::JSON | Type::JSONB => {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
                }
                _ if is_text(ty) => s.as_str().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
            Value::Timestamp(t) => bind_timestamp(*t, ty, out),
            Value::LocalDateTime(t) => bind_naive(*t, ty, out),
            Value::Date(d) => bind_date(*d, ty, out),
            Value::Json(v) => match *ty {
                Type::JSON | Type::JSONB => v.to_sql(ty, out),
                _ if is_text(ty) => v.to_string().to_sql(ty, out),
                _ => Err(mismatch(self.0, ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
