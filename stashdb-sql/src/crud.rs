//! CRUD Engine.
//!
//! Schema-driven insert/update/delete/fetch on [`Db`], the raw query
//! primitives, and the cached query variants that sit in front of the
//! Smart Query Cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use stashdb_core::{backfill_defaults, Model, RequestContext, StashResult, Value};
use stashdb_storage::{cache_key, DeltaSource};
use tokio_postgres::types::FromSqlOwned;
use tokio_postgres::Row;

use crate::bind::{as_params, pg_args};
use crate::error::{insert_error, query_error};
use crate::pool::Db;
use crate::row::{record_to_bean, row_to_model, row_to_record, Record};
use crate::sql::{self, Statement};

/// What [`Db::save`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Updated,
}

impl Db {
    // ========================================================================
    // RAW PRIMITIVES
    // ========================================================================

    async fn rows(&self, sql: &str, args: &[Value]) -> StashResult<Vec<Row>> {
        let conn = self.get_conn().await?;
        let stmt = conn.prepare_cached(sql).await.map_err(query_error)?;
        let bound = pg_args(args);
        tracing::debug!(sql = %sql, args = args.len(), "Query");
        conn.query(&stmt, &as_params(&bound))
            .await
            .map_err(query_error)
    }

    /// Run a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, args: &[Value]) -> StashResult<u64> {
        let conn = self.get_conn().await?;
        let stmt = conn.prepare_cached(sql).await.map_err(query_error)?;
        let bound = pg_args(args);
        tracing::debug!(sql = %sql, args = args.len(), "Execute");
        conn.execute(&stmt, &as_params(&bound))
            .await
            .map_err(query_error)
    }

    /// Run one or more semicolon-separated statements with no arguments.
    pub async fn batch_execute(&self, sql: &str) -> StashResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(sql).await.map_err(query_error)
    }

    /// First column of the first row, or `None` when nothing matched.
    pub async fn query_scalar<T: FromSqlOwned>(
        &self,
        sql: &str,
        args: &[Value],
    ) -> StashResult<Option<T>> {
        let rows = self.rows(sql, args).await?;
        match rows.first() {
            Some(row) => row.try_get::<_, Option<T>>(0).map_err(query_error),
            None => Ok(None),
        }
    }

    pub async fn find_records(&self, sql: &str, args: &[Value]) -> StashResult<Vec<Record>> {
        self.rows(sql, args).await?.iter().map(row_to_record).collect()
    }

    pub async fn find_record(&self, sql: &str, args: &[Value]) -> StashResult<Option<Record>> {
        Ok(self.find_records(sql, args).await?.into_iter().next())
    }

    /// Rows deserialized into any serde type, matched by column name. For
    /// result shapes that are not registered models.
    pub async fn query_bean<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: &[Value],
    ) -> StashResult<Vec<T>> {
        self.find_records(sql, args)
            .await?
            .iter()
            .map(record_to_bean)
            .collect()
    }

    pub async fn table_exists(&self, table: &str) -> StashResult<bool> {
        let rows = self
            .rows(self.dialect().table_exists_query(), &[Value::from(table)])
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> StashResult<bool> {
        let rows = self
            .rows(
                self.dialect().column_exists_query(),
                &[Value::from(table), Value::from(column)],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert or update.
    ///
    /// A model without an id, or flagged as a fresh insert, is inserted.
    /// Otherwise an update is tried first and an insert follows when no row
    /// was affected.
    pub async fn save<M: Model>(&self, model: &mut M) -> StashResult<SaveOutcome> {
        if model.id().is_none() {
            self.insert(model).await?;
            return Ok(SaveOutcome::Inserted);
        }
        if model.is_new_insert() {
            self.insert(model).await?;
            model.set_new_insert(false);
            return Ok(SaveOutcome::Inserted);
        }
        if self.update(model).await? == 0 {
            self.insert(model).await?;
            return Ok(SaveOutcome::Inserted);
        }
        Ok(SaveOutcome::Updated)
    }

    /// Insert `model`, assigning an id from the ticket generator if it has
    /// none. Null properties with a column default take that default.
    pub async fn insert<M: Model>(&self, model: &mut M) -> StashResult<i64> {
        let schema = self.schema::<M>()?;
        let id = match model.id() {
            Some(id) => id,
            None => {
                let id = self.tickets().next_id().await?;
                model.set_id(id);
                id
            }
        };
        backfill_defaults(model, &schema)?;
        let stmt = sql::build_insert(model, &schema, self.dialect(), self.converters())?;

        let conn = self.get_conn().await?;
        let prepared = conn.prepare_cached(&stmt.sql).await.map_err(query_error)?;
        let bound = pg_args(&stmt.args);
        conn.execute(&prepared, &as_params(&bound))
            .await
            .map_err(|e| insert_error(e, &schema.name, id))?;

        self.cache().clear_bucket(schema.bucket());
        tracing::debug!(table = %schema.name, id, "Inserted row");
        Ok(id)
    }

    /// Update the updateable columns of `model`. Returns the affected row
    /// count; 0 means the row does not exist.
    pub async fn update<M: Model>(&self, model: &M) -> StashResult<u64> {
        let schema = self.schema::<M>()?;
        let stmt = sql::build_update(model, &schema, self.dialect(), self.converters())?;
        let affected = self.execute(&stmt.sql, &stmt.args).await?;
        if affected > 0 {
            self.cache().clear_bucket(schema.bucket());
        }
        Ok(affected)
    }

    /// Hard-delete the row and mark the model deleted.
    pub async fn delete<M: Model>(&self, model: &mut M) -> StashResult<u64> {
        let schema = self.schema::<M>()?;
        let Some(id) = model.id() else {
            model.set_deleted(true);
            return Ok(0);
        };
        let stmt = sql::build_delete(&schema, self.dialect(), id);
        let affected = self.execute(&stmt.sql, &stmt.args).await?;
        model.set_deleted(true);
        self.cache().clear_bucket(schema.bucket());
        tracing::debug!(table = %schema.name, id, affected, "Deleted row");
        Ok(affected)
    }

    // ========================================================================
    // MODEL FETCHES
    // ========================================================================

    async fn models<M: Model>(&self, stmt: &Statement) -> StashResult<Vec<M>> {
        let schema = self.schema::<M>()?;
        let rows = self.rows(&stmt.sql, &stmt.args).await?;
        rows.iter()
            .map(|row| row_to_model::<M>(row, &schema, self.converters()))
            .collect()
    }

    pub async fn fetch_one<M: Model>(&self, id: i64) -> StashResult<Option<M>> {
        let schema = self.schema::<M>()?;
        let stmt = sql::select_by_id(&schema, self.dialect(), id);
        Ok(self.models::<M>(&stmt).await?.into_iter().next())
    }

    /// First row whose column `field` equals `value`.
    pub async fn fetch_one_by<M: Model>(
        &self,
        field: &str,
        value: impl Into<Value>,
    ) -> StashResult<Option<M>> {
        let schema = self.schema::<M>()?;
        let stmt = sql::select_by_field(&schema, self.dialect(), field, value.into())?;
        Ok(self.models::<M>(&stmt).await?.into_iter().next())
    }

    pub async fn fetch_all<M: Model>(&self) -> StashResult<Vec<M>> {
        let schema = self.schema::<M>()?;
        self.models::<M>(&sql::select_all(&schema, self.dialect()))
            .await
    }

    /// Every row ordered by `field`, which must be `id`, `row_updated_at`
    /// or a key column. `direction` is `ASC` or `DESC`.
    pub async fn fetch_all_sorted<M: Model>(
        &self,
        field: &str,
        direction: &str,
    ) -> StashResult<Vec<M>> {
        let schema = self.schema::<M>()?;
        let stmt = sql::select_sorted(&schema, self.dialect(), field, direction)?;
        self.models::<M>(&stmt).await
    }

    /// Arbitrary SQL mapped through `M`'s schema.
    pub async fn query<M: Model>(&self, sql: &str, args: &[Value]) -> StashResult<Vec<M>> {
        self.models::<M>(&Statement::new(sql, args.to_vec())).await
    }

    pub async fn query_for_one<M: Model>(
        &self,
        sql: &str,
        args: &[Value],
    ) -> StashResult<Option<M>> {
        Ok(self.query::<M>(sql, args).await?.into_iter().next())
    }

    /// `SELECT * FROM <M's table> WHERE <clause>`.
    pub async fn where_clause<M: Model>(
        &self,
        clause: &str,
        args: &[Value],
    ) -> StashResult<Vec<M>> {
        let schema = self.schema::<M>()?;
        let stmt = sql::where_clause(&schema, self.dialect(), clause, args.to_vec());
        self.models::<M>(&stmt).await
    }

    /// Rows touched at or after `since`, for the sync protocol.
    pub async fn fetch_updated_since<M: Model>(
        &self,
        since: DateTime<Utc>,
    ) -> StashResult<Vec<M>> {
        let schema = self.schema::<M>()?;
        let stmt = sql::select_updated_since(&schema, self.dialect(), since);
        self.models::<M>(&stmt).await
    }

    // ========================================================================
    // CACHED VARIANTS
    // ========================================================================

    /// [`Db::query`] through the Smart Query Cache, bucketed by `M`'s table.
    pub async fn cached_query<M: Model>(
        &self,
        ctx: &RequestContext,
        sql: &str,
        args: &[Value],
    ) -> StashResult<Vec<M>> {
        let schema = self.schema::<M>()?;
        let key = cache_key(schema.bucket(), sql, args);
        if let Some(hit) = self.cache().get_smart::<Vec<M>>(ctx, schema.bucket(), &key) {
            return Ok(hit);
        }
        let items = self.query::<M>(sql, args).await?;
        self.cache().set(schema.bucket(), &key, items.clone());
        Ok(items)
    }

    /// [`Db::where_clause`] through the Smart Query Cache.
    pub async fn cached_where<M: Model>(
        &self,
        ctx: &RequestContext,
        clause: &str,
        args: &[Value],
    ) -> StashResult<Vec<M>> {
        let schema = self.schema::<M>()?;
        let stmt = sql::where_clause(&schema, self.dialect(), clause, args.to_vec());
        self.cached_query::<M>(ctx, &stmt.sql, &stmt.args).await
    }

    /// [`Db::query_scalar`] through the Smart Query Cache under `bucket`.
    pub async fn cached_scalar<T>(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        sql: &str,
        args: &[Value],
    ) -> StashResult<Option<T>>
    where
        T: FromSqlOwned + Clone + Send + Sync + 'static,
    {
        let key = cache_key(bucket, sql, args);
        if let Some(hit) = self.cache().get_smart::<Option<T>>(ctx, bucket, &key) {
            return Ok(hit);
        }
        let value = self.query_scalar::<T>(sql, args).await?;
        self.cache().set(bucket, &key, value.clone());
        Ok(value)
    }
}

#[async_trait]
impl<M: Model> DeltaSource<M> for Db {
    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> StashResult<Vec<M>> {
        Db::fetch_updated_since::<M>(self, since).await
    }
}
