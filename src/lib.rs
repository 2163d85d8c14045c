//! An embedded, single-file document-database storage engine.
//!
//! This crate owns the bottom of the stack: a memory-mapped page cache, a
//! binary-buddy block allocator, and a journaled single-writer/many-reader
//! transaction model. It stores and retrieves raw byte ranges addressed by
//! [`Addr`]; a serializer built on top of [`value::Value`] is expected to
//! walk a document tree into those byte ranges, but that walk itself is out
//! of scope here.
//!
//! Start with [`db::Database::open`] or [`db::Database::open_anon`], get a
//! [`txn::Transaction`] from [`db::Database::begin_write`], and read
//! committed state with [`db::Database::load`].

pub mod addr;
pub mod alloc;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod header;
pub mod file;
pub mod journal;
pub mod txn;
pub mod value;

pub use addr::{Addr, PageNr, SizeClass, PAGE_SIZE};
pub use config::Config;
pub use db::{Database, OpenMode};
pub use error::{Result, StorageError};
pub use txn::Transaction;
pub use value::{Scalar, Value, ValueType, SHORT_STRING_LIMIT};
