//! # rowsync Testkit
//!
//! Test utilities for rowsync.
//!
//! This crate provides:
//! - A sample schema (`customer`, `product_category`, `product`) with a
//!   foreign key
//! - A [`TestEnv`] holding a temporary directory, a server database and its
//!   orchestrator, handing out in-process clients
//! - Property-based generators for values, policies and write workloads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rowsync_testkit::prelude::*;
//!
//! let env = TestEnv::new();
//! seed_sample_rows(env.server_db()).unwrap();
//! let client = env.client("alice");
//! client.agent.synchronize(SyncType::Normal).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
