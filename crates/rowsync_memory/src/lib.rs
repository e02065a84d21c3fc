//! # rowsync Memory
//!
//! Reference provider for rowsync: a small relational store kept in memory,
//! optionally persisted to a directory.
//!
//! It implements the full provider capability set:
//! - Base tables with primary keys, nullability and foreign keys
//! - Tracking tables fed by emulated change-capture triggers
//! - A logical timestamp bumped by every row write
//! - Scope tables for client, server and history records
//! - Optimistic transactions: a commit that lost a race fails with `Busy`
//!
//! Native error codes follow the SQLite numbering, so a foreign key
//! violation reports `787`.
//!
//! Tests can inject failures with [`MemoryProvider::fail_next_write`] and
//! [`MemoryProvider::fail_next_commit`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builders;
mod error;
mod file;
mod provider;
mod state;

pub use error::{
    MemoryError, MemoryResult, CODE_BUSY, CODE_CORRUPT, CODE_ERROR, CODE_FOREIGN_KEY,
    CODE_IOERR, CODE_LOCKED, CODE_NOT_NULL,
};
pub use provider::{DatabaseSummary, MemoryConnection, MemoryProvider};
