//! Generic repository and dynamic query-filter layer over SQLite
//!
//! `shelf` lets many record types share one implementation of
//! list/filter/paginate/update/delete logic instead of hand-writing query
//! code per type. A record type implements [`Entity`] (table name, columns,
//! soft-delete convention) plus the row codec traits, and gets:
//!
//! - [`Repository`] — get/create/update/delete by id, plus filtered and
//!   paginated listings
//! - [`ListFilter`] — declarative filter/sort/join/pagination description,
//!   with allow-lists guarding which fields a request may touch
//! - [`QueryPlan`] — the compiled, parameterized query, with an optional
//!   clause-by-clause debug trace
//!
//! Filter input is advisory, not contractual: disallowed fields, unknown
//! operators, and unparseable dynamic query strings narrow the query instead
//! of failing it. Only the by-id operations return hard errors.
//!
//! # Example
//!
//! ```rust,ignore
//! use shelf::{ListFilter, Repository};
//!
//! let repo: Repository<User> = Repository::new(pool);
//! let filter = ListFilter::new()
//!     .filterable(["status", "roles.name"])
//!     .condition("status", "active")
//!     .sort("-created_at")
//!     .page(2)
//!     .page_size(20);
//! let page = repo.list_paginated(&filter).await?;
//! println!("{} of {} users", page.items.len(), page.total);
//! ```

pub mod entity;
pub mod error;
pub mod filter;
pub mod plan;
pub mod repository;
pub mod trace;

pub use entity::{Entity, FromSqlRow, IntoSqlRow, SqlValue};
pub use error::RepoError;
pub use filter::{JoinKind, JoinSpec, ListFilter};
pub use plan::QueryPlan;
pub use repository::{Page, Repository};
pub use trace::{QueryTrace, TraceEntry};
