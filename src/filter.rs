//! Declarative filter description for list queries
//!
//! A [`ListFilter`] says what to filter, sort, join, and paginate. It is
//! plain request-scoped data with no behavior beyond validation; compilation
//! into SQL happens in [`crate::plan`].
//!
//! Two allow-lists guard field access, with deliberately different defaults:
//! an empty `filterable` list allows every field, while an empty `sortable`
//! list allows only the always-sortable `id`, `created_at`, `updated_at`.

use serde::Serialize;
use serde_json::{Map, Value};

/// Columns that pass the sortable check regardless of the allow-list.
const ALWAYS_SORTABLE: &[&str] = &["id", "created_at", "updated_at"];

/// Page size used when the caller supplies none (or a non-positive one).
const DEFAULT_PAGE_SIZE: i64 = 10;

/// Upper bound on the page size.
const MAX_PAGE_SIZE: i64 = 500;

/// Join flavor. Parsing a kind string falls back to an inner join for
/// anything other than "left".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    /// Case-insensitive parse; unknown kinds become [`JoinKind::Inner`].
    pub fn parse(kind: &str) -> Self {
        if kind.trim().eq_ignore_ascii_case("left") {
            Self::Left
        } else {
            Self::Inner
        }
    }

    pub(crate) fn sql_keyword(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// One join, applied before any predicate clause.
///
/// Table and predicate are `&'static str` on purpose: join targets are fixed
/// at compile time and never assembled from request input.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct JoinSpec {
    /// Table to join, e.g. "roles"
    pub table: &'static str,
    /// Join predicate, e.g. "users.role_id = roles.id"
    pub on: &'static str,
    pub kind: JoinKind,
}

impl JoinSpec {
    /// Build a join from a kind string ("left"/"inner", case-insensitive;
    /// anything else defaults to inner).
    pub fn new(table: &'static str, on: &'static str, kind: &str) -> Self {
        Self {
            table,
            on,
            kind: JoinKind::parse(kind),
        }
    }

    pub fn inner(table: &'static str, on: &'static str) -> Self {
        Self {
            table,
            on,
            kind: JoinKind::Inner,
        }
    }

    pub fn left(table: &'static str, on: &'static str) -> Self {
        Self {
            table,
            on,
            kind: JoinKind::Left,
        }
    }
}

/// Declarative filter/sort/join/pagination description for one list request.
///
/// Built fluently and handed to the repository; a fresh instance per request.
/// Compilation does not mutate the filter, so building one and running both
/// `count` and `list_paginated` from it is fine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListFilter {
    /// Fields allowed in conditions; empty means every field is allowed
    pub filterable: Vec<String>,
    /// Fields allowed in the sort directive; empty means only the
    /// always-sortable id/created_at/updated_at pass
    pub sortable: Vec<String>,
    /// Static conditions applied unconditionally
    pub conditions: Map<String, Value>,
    /// Caller-supplied JSON object with the same shape as `conditions`.
    /// A string that does not parse as a JSON object is skipped silently.
    pub raw_query: Option<String>,
    /// Comma-separated sort fields, `-` prefix for descending
    pub sort: Option<String>,
    /// 1-based page number
    pub page: i64,
    /// Rows per page
    pub page_size: i64,
    /// Include soft-deleted rows in the query scope
    pub include_deleted: bool,
    /// Joins, applied in declaration order
    pub joins: Vec<JoinSpec>,
    /// Record a debug trace of every compiled clause
    pub trace: bool,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the filterable allow-list.
    pub fn filterable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filterable = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the sortable allow-list.
    pub fn sortable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sortable = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Add one static condition. The value may be a scalar, an array (set
    /// membership), or an operator map such as `json!({"gte": 18})`.
    pub fn condition(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(field.into(), value.into());
        self
    }

    /// Attach the caller-supplied dynamic query string.
    pub fn raw_query(mut self, query: impl Into<String>) -> Self {
        self.raw_query = Some(query.into());
        self
    }

    /// Set the sort directive, e.g. `"-created_at,name"`.
    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Widen the query scope to rows carrying a soft-delete timestamp.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    /// Enable the clause-by-clause debug trace on the compiled plan.
    pub fn traced(mut self) -> Self {
        self.trace = true;
        self
    }

    /// Page number clamped into [1, ∞).
    pub fn effective_page(&self) -> i64 {
        if self.page <= 0 { 1 } else { self.page }
    }

    /// Page size clamped into [1, 500].
    pub fn effective_page_size(&self) -> i64 {
        if self.page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else if self.page_size > MAX_PAGE_SIZE {
            MAX_PAGE_SIZE
        } else {
            self.page_size
        }
    }

    /// Allow-list check for condition fields. An empty list allows any
    /// field name that looks like a column identifier.
    pub fn is_filterable(&self, field: &str) -> bool {
        if !is_safe_identifier(field) {
            return false;
        }
        self.filterable.is_empty() || self.filterable.iter().any(|w| w == field)
    }

    /// Allow-list check for sort fields. Closed by default: with an empty
    /// list only the always-sortable columns pass.
    pub fn is_sortable(&self, field: &str) -> bool {
        if !is_safe_identifier(field) {
            return false;
        }
        ALWAYS_SORTABLE.contains(&field) || self.sortable.iter().any(|w| w == field)
    }
}

/// Check that a field name is a plain or table-qualified column identifier.
///
/// Field names end up interpolated into SQL text (values are always bound),
/// so anything not shaped like `column` or `table.column` is rejected.
pub(crate) fn is_safe_identifier(field: &str) -> bool {
    fn is_plain(part: &str) -> bool {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    match field.split('.').collect::<Vec<_>>().as_slice() {
        [column] => is_plain(column),
        [table, column] => is_plain(table) && is_plain(column),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_page_clamping() {
        assert_eq!(ListFilter::new().page(0).effective_page(), 1);
        assert_eq!(ListFilter::new().page(-3).effective_page(), 1);
        assert_eq!(ListFilter::new().page(7).effective_page(), 7);
    }

    #[test]
    fn test_page_size_clamping() {
        assert_eq!(ListFilter::new().page_size(0).effective_page_size(), 10);
        assert_eq!(ListFilter::new().page_size(-1).effective_page_size(), 10);
        assert_eq!(ListFilter::new().page_size(25).effective_page_size(), 25);
        assert_eq!(ListFilter::new().page_size(501).effective_page_size(), 500);
        assert_eq!(ListFilter::new().page_size(9000).effective_page_size(), 500);
    }

    #[test]
    fn test_filterable_open_by_default() {
        let filter = ListFilter::new();
        assert!(filter.is_filterable("anything"));
        assert!(filter.is_filterable("roles.name"));
    }

    #[test]
    fn test_filterable_allow_list() {
        let filter = ListFilter::new().filterable(["status"]);
        assert!(filter.is_filterable("status"));
        assert!(!filter.is_filterable("name"));
    }

    #[test]
    fn test_sortable_closed_by_default() {
        let filter = ListFilter::new();
        assert!(filter.is_sortable("id"));
        assert!(filter.is_sortable("created_at"));
        assert!(filter.is_sortable("updated_at"));
        assert!(!filter.is_sortable("name"));
    }

    #[test]
    fn test_sortable_allow_list_extends_defaults() {
        let filter = ListFilter::new().sortable(["name"]);
        assert!(filter.is_sortable("name"));
        assert!(filter.is_sortable("id"));
        assert!(!filter.is_sortable("status"));
    }

    #[test]
    fn test_unsafe_identifiers_rejected_even_when_open() {
        let filter = ListFilter::new();
        assert!(!filter.is_filterable(""));
        assert!(!filter.is_filterable("name; DROP TABLE users"));
        assert!(!filter.is_filterable("a.b.c"));
        assert!(!filter.is_filterable("1name"));
        assert!(!filter.is_sortable("created_at DESC"));
    }

    #[test]
    fn test_join_kind_parse() {
        assert_eq!(JoinKind::parse("left"), JoinKind::Left);
        assert_eq!(JoinKind::parse("LEFT"), JoinKind::Left);
        assert_eq!(JoinKind::parse(" Left "), JoinKind::Left);
        assert_eq!(JoinKind::parse("inner"), JoinKind::Inner);
        assert_eq!(JoinKind::parse("outer"), JoinKind::Inner);
        assert_eq!(JoinKind::parse(""), JoinKind::Inner);
    }

    #[test]
    fn test_join_spec_constructors() {
        let join = JoinSpec::new("roles", "users.role_id = roles.id", "LEFT");
        assert_eq!(join.kind, JoinKind::Left);
        assert_eq!(JoinSpec::inner("roles", "x = y").kind, JoinKind::Inner);
        assert_eq!(JoinSpec::left("roles", "x = y").kind, JoinKind::Left);
    }
}
