//! Statement builders for the CRUD Engine.
//!
//! These are pure: they read a schema and a model and produce SQL text plus
//! converted arguments. Nothing here touches a connection.

use chrono::{DateTime, Utc};
use stashdb_core::{
    convert_column_arg, ConverterRegistry, Dialect, Model, Schema, SortDirection, StashResult,
    UsageError, Value, ID_COLUMN, ROW_UPDATED_AT,
};

/// SQL text with its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

fn require_id<M: Model>(model: &M, schema: &Schema) -> StashResult<i64> {
    model.id().ok_or_else(|| {
        UsageError::InvalidField {
            field: ID_COLUMN.to_string(),
            table: schema.name.clone(),
        }
        .into()
    })
}

/// `INSERT INTO t (id, c1, ...) VALUES (...)` over the insertable columns,
/// in schema order. The model must already carry its id.
pub fn build_insert<M: Model>(
    model: &M,
    schema: &Schema,
    dialect: Dialect,
    converters: &ConverterRegistry,
) -> StashResult<Statement> {
    let id = require_id(model, schema)?;
    let mut names = vec![dialect.quote(ID_COLUMN)];
    let mut args = vec![Value::BigInt(id)];
    for col in schema.insertable_columns() {
        names.push(dialect.quote(&col.name));
        args.push(convert_column_arg(model, col, converters)?);
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote(&schema.name),
        names.join(", "),
        dialect.placeholders(1, args.len())
    );
    Ok(Statement::new(sql, args))
}

/// `UPDATE t SET c1 = ?, ... WHERE id = ?` over the updateable columns.
pub fn build_update<M: Model>(
    model: &M,
    schema: &Schema,
    dialect: Dialect,
    converters: &ConverterRegistry,
) -> StashResult<Statement> {
    let id = require_id(model, schema)?;
    let mut sets = Vec::new();
    let mut args = Vec::new();
    for col in schema.updateable_columns() {
        args.push(convert_column_arg(model, col, converters)?);
        sets.push(format!(
            "{} = {}",
            dialect.quote(&col.name),
            dialect.placeholder(args.len())
        ));
    }
    if sets.is_empty() {
        // Still touch the row so the affected count reports existence.
        sets.push(format!(
            "{} = {}",
            dialect.quote(ID_COLUMN),
            dialect.quote(ID_COLUMN)
        ));
    }
    args.push(Value::BigInt(id));
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        dialect.quote(&schema.name),
        sets.join(", "),
        dialect.quote(ID_COLUMN),
        dialect.placeholder(args.len())
    );
    Ok(Statement::new(sql, args))
}

pub fn build_delete(schema: &Schema, dialect: Dialect, id: i64) -> Statement {
    let sql = format!(
        "DELETE FROM {} WHERE {} = {}",
        dialect.quote(&schema.name),
        dialect.quote(ID_COLUMN),
        dialect.placeholder(1)
    );
    Statement::new(sql, vec![Value::BigInt(id)])
}

pub fn select_all(schema: &Schema, dialect: Dialect) -> Statement {
    Statement::new(
        format!("SELECT * FROM {}", dialect.quote(&schema.name)),
        Vec::new(),
    )
}

pub fn select_by_id(schema: &Schema, dialect: Dialect, id: i64) -> Statement {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = {}",
        dialect.quote(&schema.name),
        dialect.quote(ID_COLUMN),
        dialect.placeholder(1)
    );
    Statement::new(sql, vec![Value::BigInt(id)])
}

/// `SELECT * FROM t WHERE field = ?`. The field must be a column of `t`.
pub fn select_by_field(
    schema: &Schema,
    dialect: Dialect,
    field: &str,
    value: Value,
) -> StashResult<Statement> {
    if !schema.has_column(field) {
        return Err(UsageError::InvalidField {
            field: field.to_string(),
            table: schema.name.clone(),
        }
        .into());
    }
    let sql = format!(
        "SELECT * FROM {} WHERE {} = {}",
        dialect.quote(&schema.name),
        dialect.quote(field),
        dialect.placeholder(1)
    );
    Ok(Statement::new(sql, vec![value]))
}

/// `SELECT * FROM t ORDER BY field dir`.
///
/// Only `id`, `row_updated_at` and key columns may be sorted on.
pub fn select_sorted(
    schema: &Schema,
    dialect: Dialect,
    field: &str,
    direction: &str,
) -> StashResult<Statement> {
    let direction = SortDirection::parse(direction).ok_or_else(|| UsageError::InvalidSortDirection {
        direction: direction.to_string(),
    })?;
    if !schema.is_sortable(field) {
        return Err(UsageError::InvalidSortField {
            field: field.to_string(),
            model: schema.model.clone(),
        }
        .into());
    }
    let sql = format!(
        "SELECT * FROM {} ORDER BY {} {}",
        dialect.quote(&schema.name),
        dialect.quote(field),
        direction.as_sql()
    );
    Ok(Statement::new(sql, Vec::new()))
}

/// Every row touched at or after `since`.
pub fn select_updated_since(schema: &Schema, dialect: Dialect, since: DateTime<Utc>) -> Statement {
    let sql = format!(
        "SELECT * FROM {} WHERE {} >= {}",
        dialect.quote(&schema.name),
        dialect.quote(ROW_UPDATED_AT),
        dialect.placeholder(1)
    );
    Statement::new(sql, vec![Value::Timestamp(since)])
}

/// `SELECT * FROM t WHERE <clause>`. Placeholders in `clause` are the
/// caller's.
pub fn where_clause(schema: &Schema, dialect: Dialect, clause: &str, args: Vec<Value>) -> Statement {
    let sql = format!("SELECT * FROM {} WHERE {}", dialect.quote(&schema.name), clause);
    Statement::new(sql, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use stashdb_core::{model_to_schema, FieldDef, ModelDefinition, ValueKind};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Gadget {
        id: Option<i64>,
        name: String,
        count: i32,
        tags: serde_json::Value,
        serial: String,
        deleted: bool,
    }

    impl Model for Gadget {
        fn definition() -> ModelDefinition {
            ModelDefinition::table("gadgets")
                .field(FieldDef::column("name", ValueKind::String).not_null())
                .field(FieldDef::column("count", ValueKind::Int).not_null())
                .field(FieldDef::column("tags", ValueKind::List))
                .field(
                    FieldDef::column("serial", ValueKind::String)
                        .not_null()
                        .read_only()
                        .alternative_key(),
                )
        }

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }

        fn is_deleted(&self) -> bool {
            self.deleted
        }

        fn set_deleted(&mut self, deleted: bool) {
            self.deleted = deleted;
        }

        fn property(&self, name: &str) -> Option<Value> {
            match name {
                "name" => Some(Value::Text(self.name.clone())),
                "count" => Some(Value::Int(self.count)),
                "tags" if self.tags.is_null() => Some(Value::Null),
                "tags" => Some(Value::Json(self.tags.clone())),
                "serial" => Some(Value::Text(self.serial.clone())),
                _ => None,
            }
        }

        fn set_property(&mut self, name: &str, value: Value) -> StashResult<()> {
            match (name, value) {
                ("name", Value::Text(s)) => self.name = s,
                ("count", Value::Int(i)) => self.count = i,
                ("tags", Value::Json(v)) => self.tags = v,
                ("tags", Value::Null) => self.tags = serde_json::Value::Null,
                ("serial", Value::Text(s)) => self.serial = s,
                (property, _) => {
                    return Err(UsageError::UnknownProperty {
                        model: "Gadget".into(),
                        property: property.into(),
                    }
                    .into())
                }
            }
            Ok(())
        }
    }

    fn gadget() -> Gadget {
        Gadget {
            id: Some(100_001),
            name: "sprocket".into(),
            count: 3,
            tags: serde_json::json!(["a", "b"]),
            serial: "S-1".into(),
            deleted: false,
        }
    }

    #[test]
    fn test_insert_lists_id_then_insertable_columns() {
        let schema = model_to_schema::<Gadget>().unwrap();
        let converters = ConverterRegistry::default();
        let stmt = build_insert(&gadget(), &schema, Dialect::Postgres, &converters).unwrap();
        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "gadgets" ("id", "name", "count", "tags") VALUES ($1, $2, $3, $4)"#
        );
        assert_eq!(stmt.args[0], Value::BigInt(100_001));
        assert_eq!(stmt.args[2], Value::Int(3));
        // Collections without a converter are stored as JSON text.
        assert_eq!(stmt.args[3], Value::Text(r#"["a","b"]"#.into()));
    }

    #[test]
    fn test_insert_requires_an_id() {
        let schema = model_to_schema::<Gadget>().unwrap();
        let mut g = gadget();
        g.id = None;
        let err = build_insert(&g, &schema, Dialect::Postgres, &ConverterRegistry::default())
            .unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn test_update_skips_read_only_columns() {
        let schema = model_to_schema::<Gadget>().unwrap();
        let stmt = build_update(
            &gadget(),
            &schema,
            Dialect::Postgres,
            &ConverterRegistry::default(),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            r#"UPDATE "gadgets" SET "name" = $1, "count" = $2, "tags" = $3 WHERE "id" = $4"#
        );
        assert_eq!(stmt.args.last(), Some(&Value::BigInt(100_001)));
    }

    #[test]
    fn test_mysql_uses_backticks_and_question_marks() {
        let schema = model_to_schema::<Gadget>().unwrap();
        let stmt = build_delete(&schema, Dialect::MySql, 9);
        assert_eq!(stmt.sql, "DELETE FROM `gadgets` WHERE `id` = ?");
        assert_eq!(stmt.args, vec![Value::BigInt(9)]);
    }

    #[test]
    fn test_select_by_field_rejects_unknown_columns() {
        let schema = model_to_schema::<Gadget>().unwrap();
        let err = select_by_field(&schema, Dialect::Postgres, "color", Value::from("red"))
            .unwrap_err();
        assert!(err.to_string().contains("color"));

        let stmt = select_by_field(&schema, Dialect::Postgres, "serial", Value::from("S-1"))
            .unwrap();
        assert_eq!(stmt.sql, r#"SELECT * FROM "gadgets" WHERE "serial" = $1"#);
    }

    #[test]
    fn test_sorted_fetch_only_on_keys() {
        let schema = model_to_schema::<Gadget>().unwrap();
        let stmt = select_sorted(&schema, Dialect::Postgres, "serial", "desc").unwrap();
        assert_eq!(stmt.sql, r#"SELECT * FROM "gadgets" ORDER BY "serial" DESC"#);
        assert!(select_sorted(&schema, Dialect::Postgres, "row_updated_at", "ASC").is_ok());

        let err = select_sorted(&schema, Dialect::Postgres, "count", "ASC").unwrap_err();
        assert!(err.to_string().contains("Sort field must be a database key"));

        let err = select_sorted(&schema, Dialect::Postgres, "id", "sideways").unwrap_err();
        assert!(matches!(
            err,
            stashdb_core::StashError::Usage(UsageError::InvalidSortDirection { .. })
        ));
    }

    #[test]
    fn test_updated_since_binds_timestamp() {
        let schema = model_to_schema::<Gadget>().unwrap();
        let since = DateTime::<Utc>::UNIX_EPOCH;
        let stmt = select_updated_since(&schema, Dialect::Postgres, since);
        assert_eq!(
            stmt.sql,
            r#"SELECT * FROM "gadgets" WHERE "row_updated_at" >= $1"#
        );
        assert_eq!(stmt.args, vec![Value::Timestamp(since)]);
    }
}
