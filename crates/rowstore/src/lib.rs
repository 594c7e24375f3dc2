//! # rowstore
//!
//! Embedded relational row store using a TOON (Token-Oriented Object Notation)
//! journal.
//!
//! ## Model
//! - Tables with an implicit `id`, scalar and reference columns
//! - Inverse relations resolved through reference columns
//! - Transactions with read-your-writes and constraint checks
//! - A small query language with `join fetch`
//! - 1 MB max journal record, 1 GB max DB size

#![warn(missing_docs)]

mod error;
mod parser;
pub mod query;
pub mod schema;
mod stats;
mod storage;
mod transaction;
mod value;

pub use error::{Conflict, Error, Result};
pub use query::{Plan, Query};
pub use schema::{Cardinality, Column, ColumnKind, IdGeneration, Relation, Schema, TableSchema};
pub use stats::StoreStats;
pub use storage::RowStore;
pub use transaction::{FetchedRow, QueryOutput, Row, Transaction};
pub use value::{Id, Value, ValueKind};
