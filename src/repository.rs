//! Repository facade over the query plan
//!
//! Thin CRUD wrappers plus the two listing modes. Every by-id operation
//! validates the id before touching the pool and reports a missing target as
//! [`RepoError::NotFound`]; listing operations never fail on malformed
//! filter input.

use std::marker::PhantomData;

use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;

use crate::entity::{now_iso8601, Entity, FromSqlRow, IntoSqlRow, SqlValue};
use crate::error::RepoError;
use crate::filter::{is_safe_identifier, ListFilter};
use crate::plan::QueryPlan;

/// One page of a paginated listing, with the effective (normalized)
/// pagination bounds echoed back.
#[derive(Debug, Clone, Serialize)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// Generic data access for one entity type, backed by a shared SQLite pool.
pub struct Repository<E> {
    pool: SqlitePool,
    _marker: PhantomData<E>,
}

impl<E> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// The underlying pool, for queries this layer does not cover.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch the most recent row with the given id.
    ///
    /// Soft-deleted rows are out of scope here; listing with
    /// `include_deleted` is the only way to see them.
    pub async fn get_by_id(&self, id: i64) -> Result<E, RepoError>
    where
        E: FromSqlRow,
    {
        if id == 0 {
            return Err(RepoError::InvalidId);
        }

        let mut sql = format!(
            "{} WHERE {}.{} = ?",
            E::select_sql(),
            E::TABLE_NAME,
            E::PRIMARY_KEY
        );
        if let Some(col) = E::DELETED_AT_COLUMN {
            sql.push_str(&format!(" AND {}.{} IS NULL", E::TABLE_NAME, col));
        }
        sql.push_str(&format!(
            " ORDER BY {}.{} DESC LIMIT 1",
            E::TABLE_NAME,
            E::PRIMARY_KEY
        ));
        tracing::debug!(sql = %sql, id, "fetching record by id");

        match sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? {
            Some(row) => Ok(E::from_row(&row)?),
            None => Err(RepoError::NotFound),
        }
    }

    /// Insert one record.
    pub async fn create(&self, record: &E) -> Result<(), RepoError>
    where
        E: IntoSqlRow,
    {
        let columns = E::insert_columns();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            E::TABLE_NAME,
            columns.join(", "),
            placeholders
        );
        tracing::debug!(sql = %sql, "inserting record");

        let values = record.insert_values();
        let mut query = sqlx::query(&sql);
        for value in &values {
            query = value.bind_to_query(query);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Update the given columns on one row.
    ///
    /// Column names that do not look like plain identifiers are skipped the
    /// same way the filter compiler skips them. Array and object values are
    /// stored as JSON text. `updated_at` is stamped automatically when the
    /// table has that column and the caller did not set it. An update map
    /// with nothing usable in it is a no-op.
    pub async fn update_by_id(&self, id: i64, changes: &Map<String, Value>) -> Result<(), RepoError> {
        if id == 0 {
            return Err(RepoError::InvalidId);
        }

        let mut sets: Vec<String> = Vec::new();
        let mut binds: Vec<SqlValue> = Vec::new();
        for (column, value) in changes {
            if !is_safe_identifier(column) {
                tracing::debug!(column = %column, "unsafe column name in update map, skipped");
                continue;
            }
            let bind = match value {
                Value::Array(_) | Value::Object(_) => SqlValue::String(value.to_string()),
                scalar => match SqlValue::from_json(scalar) {
                    Some(bind) => bind,
                    None => continue,
                },
            };
            sets.push(format!("{column} = ?"));
            binds.push(bind);
        }
        if sets.is_empty() {
            return Ok(());
        }

        if E::column_names().contains(&"updated_at") && !changes.contains_key("updated_at") {
            sets.push("updated_at = ?".to_string());
            binds.push(SqlValue::String(now_iso8601()));
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            E::TABLE_NAME,
            sets.join(", "),
            E::PRIMARY_KEY
        );
        tracing::debug!(sql = %sql, id, "updating record");

        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = value.bind_to_query(query);
        }
        let result = query.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    /// Flag one row as deleted by setting its flag column to 1.
    ///
    /// The flag does not remove the row from default query scope; tables
    /// without a flag column fall back to a hard DELETE.
    pub async fn delete_by_id(&self, id: i64) -> Result<(), RepoError> {
        if id == 0 {
            return Err(RepoError::InvalidId);
        }

        let sql = match E::DELETED_FLAG_COLUMN {
            Some(col) => format!(
                "UPDATE {} SET {} = 1 WHERE {} = ?",
                E::TABLE_NAME,
                col,
                E::PRIMARY_KEY
            ),
            None => format!("DELETE FROM {} WHERE {} = ?", E::TABLE_NAME, E::PRIMARY_KEY),
        };
        tracing::debug!(sql = %sql, id, "flag-deleting record");

        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    /// Stamp one row's deletion timestamp, taking it out of default scope.
    ///
    /// Rows already carrying a timestamp are not restamped and report
    /// [`RepoError::NotFound`]; tables without the column fall back to a
    /// hard DELETE.
    pub async fn soft_delete_by_id(&self, id: i64) -> Result<(), RepoError> {
        if id == 0 {
            return Err(RepoError::InvalidId);
        }

        let result = match E::DELETED_AT_COLUMN {
            Some(col) => {
                let sql = format!(
                    "UPDATE {} SET {} = ? WHERE {} = ? AND {} IS NULL",
                    E::TABLE_NAME,
                    col,
                    E::PRIMARY_KEY,
                    col
                );
                tracing::debug!(sql = %sql, id, "soft-deleting record");
                sqlx::query(&sql)
                    .bind(now_iso8601())
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("DELETE FROM {} WHERE {} = ?", E::TABLE_NAME, E::PRIMARY_KEY);
                tracing::debug!(sql = %sql, id, "deleting record");
                sqlx::query(&sql).bind(id).execute(&self.pool).await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    /// All rows matching the filter, sorted and paginated, without a count.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<E>, RepoError>
    where
        E: FromSqlRow,
    {
        let mut plan = QueryPlan::<E>::compile(filter);
        plan.apply_sort_and_pagination(filter);
        if let Some(trace) = plan.trace() {
            tracing::debug!(trace = %trace, "compiled list query");
        }
        Ok(plan.fetch_all(&self.pool).await?)
    }

    /// One page of rows plus the total count under the filter's scope.
    ///
    /// The count runs first against the pre-pagination scope; a zero count
    /// short-circuits without issuing the fetch.
    pub async fn list_paginated(&self, filter: &ListFilter) -> Result<Page<E>, RepoError>
    where
        E: FromSqlRow,
    {
        let page = filter.effective_page();
        let page_size = filter.effective_page_size();

        let mut plan = QueryPlan::<E>::compile(filter);
        let total = plan.count(&self.pool).await?;
        if total == 0 {
            return Ok(Page {
                items: Vec::new(),
                total: 0,
                page,
                page_size,
            });
        }

        plan.apply_sort_and_pagination(filter);
        if let Some(trace) = plan.trace() {
            tracing::debug!(trace = %trace, "compiled paginated query");
        }
        let items = plan.fetch_all(&self.pool).await?;
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Row count under the filter's predicate scope.
    pub async fn count(&self, filter: &ListFilter) -> Result<i64, RepoError> {
        let plan = QueryPlan::<E>::compile(filter);
        Ok(plan.count(&self.pool).await?)
    }

    /// Compile a plan without executing it, for inspection or handwritten
    /// execution.
    pub fn plan(&self, filter: &ListFilter) -> QueryPlan<E> {
        QueryPlan::compile(filter)
    }
}
