//! # rowsync Server
//!
//! Server side of the rowsync HTTP protocol.
//!
//! This crate provides:
//! - Envelope dispatch for the `/sync/*` endpoints
//! - A session registry keyed by session id, with idle expiry
//! - Upload reassembly: parts are stored as they arrive and applied once
//!   the last one is received
//! - Paginated downloads, re-encoded with the client's serializer
//! - Snapshot downloads paged through the same session mechanism
//!
//! # Protocol
//!
//! One session is:
//! 1. `ensure-scope`: the server loads or provisions the scope
//! 2. `send-changes`, once per uploaded part; every part but the last is
//!    acknowledged
//! 3. The last part is applied, the server selects the client's download
//!    and answers with its first page
//! 4. `get-more-changes` for the remaining pages; the session ends with
//!    the last page
//!
//! The server has no listener of its own. An HTTP front end (or
//! [`rowsync_engine::LoopbackClient`] in tests) posts request bodies to
//! [`SyncServer::handle_request`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
