//! Filter-to-query compilation
//!
//! [`QueryPlan`] turns a [`ListFilter`] into a parameterized SQLite query in
//! a fixed pipeline order: soft-delete scope, joins, static conditions,
//! dynamic conditions, then sort and pagination. Each stage is a no-op when
//! its filter field is empty. Field names are validated before they reach
//! SQL text; values are always bound, never interpolated.
//!
//! Input that fails validation (disallowed field, unknown operator, wrong
//! `between` arity, unparseable dynamic query) narrows to "clause omitted"
//! and is reported at `tracing::debug!` rather than as an error.

use std::marker::PhantomData;

use serde_json::{Map, Value};
use sqlx::SqlitePool;

use crate::entity::{Entity, FromSqlRow, SqlValue};
use crate::filter::{JoinSpec, ListFilter};
use crate::trace::QueryTrace;

/// Comparison operators accepted inside a nested condition map, keyed by
/// their JSON spelling.
const COMPARE_OPS: &[(&str, &str)] = &[
    ("eq", "="),
    ("neq", "!="),
    ("gt", ">"),
    ("gte", ">="),
    ("lt", "<"),
    ("lte", "<="),
];

/// A composed, not-yet-executed query against one entity's table.
///
/// Produced by [`QueryPlan::compile`] from a filter, or built by hand via
/// [`QueryPlan::new`] and the fluent methods for queries the filter language
/// does not cover.
pub struct QueryPlan<E: Entity> {
    joins: Vec<String>,
    where_clauses: Vec<String>,
    binds: Vec<SqlValue>,
    order_clauses: Vec<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    trace: Option<QueryTrace>,
    _marker: PhantomData<E>,
}

impl<E: Entity> QueryPlan<E> {
    /// Empty plan scoped to the entity's table, with no trace.
    pub fn new() -> Self {
        Self {
            joins: Vec::new(),
            where_clauses: Vec::new(),
            binds: Vec::new(),
            order_clauses: Vec::new(),
            limit: None,
            offset: None,
            trace: None,
            _marker: PhantomData,
        }
    }

    /// Compile the filter pipeline: scope, joins, static conditions, then
    /// the parsed dynamic query. Sort and pagination are applied separately
    /// via [`Self::apply_sort_and_pagination`] so a count can run against
    /// the pre-pagination scope first.
    pub fn compile(filter: &ListFilter) -> Self {
        let mut plan = Self::new();
        if filter.trace {
            plan.trace = Some(QueryTrace::new());
        }
        plan.apply_scope(filter);
        plan.apply_joins(&filter.joins);
        plan.apply_conditions(filter, &filter.conditions);
        plan.apply_raw_query(filter);
        plan
    }

    /// Apply ORDER/LIMIT/OFFSET from the filter. Pagination bounds are
    /// always normalized, so hostile page sizes cannot widen the fetch.
    pub fn apply_sort_and_pagination(&mut self, filter: &ListFilter) {
        if let Some(sort) = filter.sort.as_deref() {
            for token in sort.split(',') {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                let (field, direction) = match token.strip_prefix('-') {
                    Some(field) => (field, "DESC"),
                    None => (token, "ASC"),
                };
                if !filter.is_sortable(field) {
                    tracing::debug!(field = %field, "sort field rejected by allow-list, order skipped");
                    continue;
                }
                self.record(format!("ORDER {field} {direction}"), vec![]);
                self.order_clauses.push(format!("{field} {direction}"));
            }
        }

        let page = filter.effective_page();
        let page_size = filter.effective_page_size();
        self.limit = Some(page_size);
        self.offset = Some((page - 1) * page_size);
        self.record(
            "PAGINATE",
            vec![SqlValue::Int(page), SqlValue::Int(page_size)],
        );

        if self.trace.is_some() {
            let preview = self.select_sql();
            if let Some(trace) = self.trace.as_mut() {
                trace.set_preview(preview);
            }
        }
    }

    /// Add a raw predicate with one bound value, for handwritten queries.
    pub fn where_clause(mut self, condition: impl Into<String>, value: SqlValue) -> Self {
        self.where_clauses.push(condition.into());
        self.binds.push(value);
        self
    }

    /// Add an ORDER BY clause verbatim, e.g. `"name ASC"`.
    pub fn order(mut self, clause: impl Into<String>) -> Self {
        self.order_clauses.push(clause.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// The trace accumulated during compilation, when the filter asked for
    /// one.
    pub fn trace(&self) -> Option<&QueryTrace> {
        self.trace.as_ref()
    }

    /// Row count under the current predicate scope, before sort/pagination.
    pub async fn count(&self, pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        let sql = self.count_sql();
        tracing::debug!(sql = %sql, "executing count query");

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in &self.binds {
            query = match value {
                SqlValue::String(s) => query.bind(s.as_str()),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Bool(b) => query.bind(if *b { 1i32 } else { 0i32 }),
                SqlValue::Null => query.bind(None::<String>),
            };
        }
        query.fetch_one(pool).await
    }

    // ======================================================================
    // Pipeline stages
    // ======================================================================

    fn apply_scope(&mut self, filter: &ListFilter) {
        if filter.include_deleted {
            self.record("UNSCOPED", vec![]);
            return;
        }
        if let Some(col) = E::DELETED_AT_COLUMN {
            let clause = format!("{}.{} IS NULL", E::TABLE_NAME, col);
            self.record(format!("SCOPE {clause}"), vec![]);
            self.where_clauses.push(clause);
        }
    }

    fn apply_joins(&mut self, joins: &[JoinSpec]) {
        for join in joins {
            let clause = format!("{} {} ON {}", join.kind.sql_keyword(), join.table, join.on);
            self.record(clause.clone(), vec![]);
            self.joins.push(clause);
        }
    }

    fn apply_conditions(&mut self, filter: &ListFilter, conditions: &Map<String, Value>) {
        for (field, value) in conditions {
            if !filter.is_filterable(field) {
                tracing::debug!(field = %field, "condition field rejected by allow-list, clause skipped");
                continue;
            }
            match value {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                    if let Some(bind) = SqlValue::from_json(value) {
                        self.push_compare(field, "=", "EQ", bind);
                    }
                }
                Value::Array(items) => self.push_in(field, items),
                Value::Object(ops) => self.apply_operator_map(field, ops),
                Value::Null => {
                    tracing::debug!(field = %field, "null condition value has no clause shape, skipped");
                }
            }
        }
    }

    fn apply_operator_map(&mut self, field: &str, ops: &Map<String, Value>) {
        for (op, value) in ops {
            if let Some(&(_, sql_op)) = COMPARE_OPS.iter().find(|(name, _)| *name == op.as_str()) {
                match SqlValue::from_json(value) {
                    Some(bind) => self.push_compare(field, sql_op, &op.to_uppercase(), bind),
                    None => {
                        tracing::debug!(field = %field, op = %op, "non-scalar operand, clause skipped");
                    }
                }
                continue;
            }
            match op.as_str() {
                "like" => {
                    // The pattern is taken as-is; callers supply their own
                    // `%` wildcards.
                    let pattern = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    self.record(
                        format!("LIKE {field}"),
                        vec![SqlValue::String(pattern.clone())],
                    );
                    self.where_clauses.push(format!("{field} LIKE ?"));
                    self.binds.push(SqlValue::String(pattern));
                }
                "in" => match value {
                    Value::Array(items) => self.push_in(field, items),
                    scalar => match SqlValue::from_json(scalar) {
                        Some(bind) => {
                            self.record(format!("IN {field}"), vec![bind.clone()]);
                            self.where_clauses.push(format!("{field} IN (?)"));
                            self.binds.push(bind);
                        }
                        None => {
                            tracing::debug!(field = %field, "in operand has no usable shape, skipped");
                        }
                    },
                },
                "between" => {
                    let bounds = match value.as_array() {
                        Some(arr) if arr.len() == 2 => {
                            SqlValue::from_json(&arr[0]).zip(SqlValue::from_json(&arr[1]))
                        }
                        _ => None,
                    };
                    match bounds {
                        Some((lo, hi)) => {
                            self.record(format!("BETWEEN {field}"), vec![lo.clone(), hi.clone()]);
                            self.where_clauses.push(format!("{field} BETWEEN ? AND ?"));
                            self.binds.push(lo);
                            self.binds.push(hi);
                        }
                        None => {
                            tracing::debug!(
                                field,
                                "between needs exactly two scalar bounds, clause skipped"
                            );
                        }
                    }
                }
                _ => {
                    tracing::debug!(field = %field, op = %op, "unknown operator, clause skipped");
                }
            }
        }
    }

    fn apply_raw_query(&mut self, filter: &ListFilter) {
        let Some(raw) = filter.raw_query.as_deref() else {
            return;
        };
        if raw.is_empty() {
            return;
        }
        match serde_json::from_str::<Map<String, Value>>(raw) {
            Ok(conditions) => self.apply_conditions(filter, &conditions),
            Err(error) => {
                tracing::debug!(%error, "dynamic query string is not a JSON object, skipped");
            }
        }
    }

    fn push_compare(&mut self, field: &str, sql_op: &str, tag: &str, bind: SqlValue) {
        self.record(format!("{tag} {field}"), vec![bind.clone()]);
        self.where_clauses.push(format!("{field} {sql_op} ?"));
        self.binds.push(bind);
    }

    fn push_in(&mut self, field: &str, items: &[Value]) {
        let values: Vec<SqlValue> = items.iter().filter_map(SqlValue::from_json).collect();
        if values.is_empty() {
            // An empty set matches no row; IN (NULL) keeps that semantic
            // without producing invalid SQL.
            self.record(format!("IN {field}"), vec![]);
            self.where_clauses.push(format!("{field} IN (NULL)"));
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.record(format!("IN {field}"), values.clone());
        self.where_clauses.push(format!("{field} IN ({placeholders})"));
        self.binds.extend(values);
    }

    fn record(&mut self, desc: impl Into<String>, args: Vec<SqlValue>) {
        if let Some(trace) = self.trace.as_mut() {
            trace.record(desc, args);
        }
    }

    // ======================================================================
    // SQL assembly
    // ======================================================================

    fn select_sql(&self) -> String {
        let mut sql = E::select_sql();
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clauses.join(" AND "));
        }
        if !self.order_clauses.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_clauses.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            if offset > 0 {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        sql
    }

    fn count_sql(&self) -> String {
        let mut sql = format!("SELECT COUNT(*) FROM {}", E::TABLE_NAME);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clauses.join(" AND "));
        }
        sql
    }
}

impl<E: Entity + FromSqlRow> QueryPlan<E> {
    /// Execute the plan and decode all matching rows.
    pub async fn fetch_all(self, pool: &SqlitePool) -> Result<Vec<E>, sqlx::Error> {
        let sql = self.select_sql();
        tracing::debug!(sql = %sql, "executing list query");

        let mut query = sqlx::query(&sql);
        for value in &self.binds {
            query = value.bind_to_query(query);
        }

        let rows = query.fetch_all(pool).await?;
        rows.iter().map(E::from_row).collect()
    }
}

impl<E: Entity> Default for QueryPlan<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct User;

    impl Entity for User {
        const TABLE_NAME: &'static str = "users";

        fn column_names() -> &'static [&'static str] {
            &["id", "name", "status"]
        }
    }

    struct Event;

    impl Entity for Event {
        const TABLE_NAME: &'static str = "events";
        const DELETED_AT_COLUMN: Option<&'static str> = None;

        fn column_names() -> &'static [&'static str] {
            &["id", "kind"]
        }
    }

    #[test]
    fn test_pipeline_order_scope_joins_conditions() {
        let filter = ListFilter::new()
            .join(JoinSpec::left("roles", "users.role_id = roles.id"))
            .condition("status", "active");
        let plan = QueryPlan::<User>::compile(&filter);

        assert_eq!(
            plan.select_sql(),
            "SELECT users.id, users.name, users.status FROM users \
             LEFT JOIN roles ON users.role_id = roles.id \
             WHERE users.deleted_at IS NULL AND status = ?"
        );
        assert_eq!(plan.binds, vec![SqlValue::String("active".into())]);
    }

    #[test]
    fn test_unscoped_filter_drops_deleted_at_clause() {
        let filter = ListFilter::new().include_deleted();
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(
            plan.select_sql(),
            "SELECT users.id, users.name, users.status FROM users"
        );
    }

    #[test]
    fn test_entity_without_soft_delete_has_no_scope_clause() {
        let plan = QueryPlan::<Event>::compile(&ListFilter::new());
        assert_eq!(plan.select_sql(), "SELECT events.id, events.kind FROM events");
    }

    #[test]
    fn test_scalar_condition_compiles_to_equality() {
        let filter = ListFilter::new().include_deleted().condition("age", 30);
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["age = ?"]);
        assert_eq!(plan.binds, vec![SqlValue::Int(30)]);
    }

    #[test]
    fn test_array_condition_compiles_to_in() {
        let filter = ListFilter::new()
            .include_deleted()
            .condition("status", json!(["active", "pending"]));
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["status IN (?, ?)"]);
        assert_eq!(
            plan.binds,
            vec![
                SqlValue::String("active".into()),
                SqlValue::String("pending".into())
            ]
        );
    }

    #[test]
    fn test_empty_array_matches_nothing() {
        let filter = ListFilter::new()
            .include_deleted()
            .condition("status", json!([]));
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["status IN (NULL)"]);
        assert!(plan.binds.is_empty());
    }

    #[test]
    fn test_operator_map_compiles_comparisons() {
        let filter = ListFilter::new()
            .include_deleted()
            .condition("age", json!({"gte": 18, "lt": 65}));
        let plan = QueryPlan::<User>::compile(&filter);
        // serde_json maps iterate in key order
        assert_eq!(plan.where_clauses, vec!["age >= ?", "age < ?"]);
        assert_eq!(plan.binds, vec![SqlValue::Int(18), SqlValue::Int(65)]);
    }

    #[test]
    fn test_like_coerces_operand_to_text() {
        let filter = ListFilter::new()
            .include_deleted()
            .condition("name", json!({"like": "%smith%"}));
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["name LIKE ?"]);
        assert_eq!(plan.binds, vec![SqlValue::String("%smith%".into())]);

        let filter = ListFilter::new()
            .include_deleted()
            .condition("name", json!({"like": 42}));
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.binds, vec![SqlValue::String("42".into())]);
    }

    #[test]
    fn test_between_requires_two_scalar_bounds() {
        let good = ListFilter::new()
            .include_deleted()
            .condition("age", json!({"between": [18, 65]}));
        let plan = QueryPlan::<User>::compile(&good);
        assert_eq!(plan.where_clauses, vec!["age BETWEEN ? AND ?"]);
        assert_eq!(plan.binds, vec![SqlValue::Int(18), SqlValue::Int(65)]);

        for bad in [json!({"between": [18]}), json!({"between": [1, 2, 3]}), json!({"between": 18})] {
            let filter = ListFilter::new().include_deleted().condition("age", bad);
            let plan = QueryPlan::<User>::compile(&filter);
            assert!(plan.where_clauses.is_empty());
            assert!(plan.binds.is_empty());
        }
    }

    #[test]
    fn test_unknown_operator_dropped() {
        let filter = ListFilter::new()
            .include_deleted()
            .condition("age", json!({"regex": ".*", "gt": 18}));
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["age > ?"]);
    }

    #[test]
    fn test_disallowed_field_contributes_nothing() {
        let filter = ListFilter::new()
            .include_deleted()
            .filterable(["status"])
            .condition("name", "x")
            .condition("status", "active");
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["status = ?"]);
    }

    #[test]
    fn test_raw_query_parses_as_conditions() {
        let filter = ListFilter::new()
            .include_deleted()
            .raw_query(r#"{"status": "active", "age": {"gte": 18}}"#);
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["age >= ?", "status = ?"]);
    }

    #[test]
    fn test_malformed_raw_query_adds_no_clauses() {
        for raw in ["not json", "[1, 2]", "\"just a string\"", "{broken", ""] {
            let filter = ListFilter::new().include_deleted().raw_query(raw);
            let plan = QueryPlan::<User>::compile(&filter);
            assert!(plan.where_clauses.is_empty(), "raw query {raw:?} leaked clauses");
        }
    }

    #[test]
    fn test_static_conditions_precede_dynamic_ones() {
        let filter = ListFilter::new()
            .include_deleted()
            .condition("status", "active")
            .raw_query(r#"{"age": 30}"#);
        let plan = QueryPlan::<User>::compile(&filter);
        assert_eq!(plan.where_clauses, vec!["status = ?", "age = ?"]);
    }

    #[test]
    fn test_sort_tokens_trimmed_and_checked() {
        let filter = ListFilter::new()
            .include_deleted()
            .sortable(["name"])
            .sort(" -created_at , name ,, secret ");
        let mut plan = QueryPlan::<User>::compile(&filter);
        plan.apply_sort_and_pagination(&filter);
        assert_eq!(plan.order_clauses, vec!["created_at DESC", "name ASC"]);
    }

    #[test]
    fn test_pagination_offsets() {
        let filter = ListFilter::new().include_deleted().page(2).page_size(20);
        let mut plan = QueryPlan::<User>::compile(&filter);
        plan.apply_sort_and_pagination(&filter);
        let sql = plan.select_sql();
        assert!(sql.ends_with("LIMIT 20 OFFSET 20"), "unexpected sql: {sql}");
    }

    #[test]
    fn test_first_page_has_no_offset() {
        let filter = ListFilter::new().include_deleted();
        let mut plan = QueryPlan::<User>::compile(&filter);
        plan.apply_sort_and_pagination(&filter);
        let sql = plan.select_sql();
        assert!(sql.ends_with("LIMIT 10"), "unexpected sql: {sql}");
    }

    #[test]
    fn test_count_sql_ignores_sort_and_pagination() {
        let filter = ListFilter::new()
            .condition("status", "active")
            .sort("-created_at")
            .page(3)
            .page_size(50);
        let mut plan = QueryPlan::<User>::compile(&filter);
        plan.apply_sort_and_pagination(&filter);
        assert_eq!(
            plan.count_sql(),
            "SELECT COUNT(*) FROM users WHERE users.deleted_at IS NULL AND status = ?"
        );
    }

    #[test]
    fn test_trace_records_clauses_in_pipeline_order() {
        let filter = ListFilter::new()
            .traced()
            .join(JoinSpec::left("roles", "users.role_id = roles.id"))
            .condition("status", "active")
            .sort("-id");
        let mut plan = QueryPlan::<User>::compile(&filter);
        plan.apply_sort_and_pagination(&filter);

        let trace = plan.trace().expect("trace requested");
        let descs: Vec<&str> = trace.entries().iter().map(|e| e.desc.as_str()).collect();
        assert_eq!(
            descs,
            vec![
                "SCOPE users.deleted_at IS NULL",
                "LEFT JOIN roles ON users.role_id = roles.id",
                "EQ status",
                "ORDER id DESC",
                "PAGINATE",
            ]
        );
        let preview = trace.sql_preview().expect("preview rendered");
        assert!(preview.starts_with("SELECT users.id"));
        assert!(preview.contains("LIMIT 10"));
    }

    #[test]
    fn test_no_trace_unless_requested() {
        let plan = QueryPlan::<User>::compile(&ListFilter::new());
        assert!(plan.trace().is_none());
    }

    #[test]
    fn test_handwritten_plan_escape_hatch() {
        let plan = QueryPlan::<User>::new()
            .where_clause("name = ?", SqlValue::String("ada".into()))
            .order("id DESC")
            .limit(5);
        assert_eq!(
            plan.select_sql(),
            "SELECT users.id, users.name, users.status FROM users \
             WHERE name = ? ORDER BY id DESC LIMIT 5"
        );
    }
}
