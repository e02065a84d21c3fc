//! HTTP transport implementation.
//!
//! Requests and responses are CBOR-encoded [`SyncMessage`]s. The actual
//! HTTP client is abstracted via a trait so any HTTP library (or an
//! in-process loopback) can carry them.
//!
//! Uploads are sent one part per [`SendChangesRequest`]; the server
//! acknowledges every part but the last. The answer to the last part is the
//! first page of the download, further pages are requested with
//! [`GetMoreChangesRequest`] and reassembled on disk.

use crate::batch::{read_part_bytes, BatchWriter};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{EstimatedChanges, ServerChanges};
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use rowsync_protocol::{
    BatchInfo, ClientScope, EnsureScopeRequest, EstimateChangesRequest, GetMoreChangesRequest,
    GetSnapshotRequest, SendChangesRequest, SendChangesResponse, ServerScope, ServerStep,
    SessionContext, SyncMessage, SyncSchema, SyncSetup,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Path of [`EnsureScopeRequest`].
pub const ENSURE_SCOPE_PATH: &str = "/sync/ensure-scope";
/// Path of [`SendChangesRequest`].
pub const SEND_CHANGES_PATH: &str = "/sync/send-changes";
/// Path of [`GetMoreChangesRequest`].
pub const GET_MORE_CHANGES_PATH: &str = "/sync/get-more-changes";
/// Path of [`EstimateChangesRequest`].
pub const ESTIMATE_PATH: &str = "/sync/estimate";
/// Path of [`GetSnapshotRequest`].
pub const SNAPSHOT_PATH: &str = "/sync/snapshot";

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
///
/// Downloaded batches are reassembled under `batch_directory`.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Root directory for reassembled downloads.
    batch_directory: PathBuf,
    /// Connection state.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C, batch_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            batch_directory: batch_directory.into(),
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the download directory root.
    pub fn batch_directory(&self) -> &Path {
        &self.batch_directory
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn post_message(&self, endpoint: &str, request: &SyncMessage) -> SyncResult<SyncMessage> {
        if !self.is_connected() {
            return Err(SyncError::transport_fatal("not connected"));
        }

        let body = request.encode()?;

        let url = format!("{}{}", self.base_url, endpoint);
        let response_body = self.client.post(&url, body).map_err(|e| {
            self.set_error(&e);
            SyncError::transport_retryable(e)
        })?;

        let response = SyncMessage::decode(&response_body)?;
        if let SyncMessage::Error(error) = response {
            let message = format!("{}: {}", error.stage, error.message);
            self.set_error(&message);
            return Err(if error.retryable {
                SyncError::transport_retryable(message)
            } else {
                SyncError::Server(message)
            });
        }

        self.clear_error();
        Ok(response)
    }

    fn send_part(&self, request: SendChangesRequest) -> SyncResult<SendChangesResponse> {
        match self.post_message(SEND_CHANGES_PATH, &SyncMessage::SendChangesRequest(request))? {
            SyncMessage::SendChangesResponse(response) => Ok(response),
            other => Err(unexpected(SEND_CHANGES_PATH, &other)),
        }
    }

    fn get_page(&self, ctx: &SessionContext, index: u32) -> SyncResult<SendChangesResponse> {
        let request = SyncMessage::GetMoreChangesRequest(GetMoreChangesRequest {
            context: ctx.clone(),
            batch_index_requested: index,
        });
        match self.post_message(GET_MORE_CHANGES_PATH, &request)? {
            SyncMessage::SendChangesResponse(response) => Ok(response),
            other => Err(unexpected(GET_MORE_CHANGES_PATH, &other)),
        }
    }

    /// Downloads pages `first_index..batch_count` into a local batch,
    /// starting with `first` when the server already sent a page.
    fn download(
        &self,
        ctx: &SessionContext,
        directory_name: &str,
        schema: SyncSchema,
        first: Option<Vec<u8>>,
        batch_count: u32,
        timestamp: u64,
    ) -> SyncResult<BatchInfo> {
        let mut writer = BatchWriter::create(
            &self.batch_directory,
            directory_name,
            schema,
            ctx.batch_size_kb,
            &ctx.serializer,
        )?;

        let mut next = 0;
        if let Some(bytes) = first {
            writer.write_raw_part(&bytes)?;
            next = 1;
        }
        for index in next..batch_count {
            let page = self.get_page(ctx, index)?;
            if let Some(bytes) = page.changes {
                writer.write_raw_part(&bytes)?;
            }
        }

        let batch = writer.finish(timestamp)?;
        tracing::debug!(
            batch = %batch.directory_name,
            pages = batch_count,
            rows = batch.rows_count,
            "download reassembled"
        );
        Ok(batch)
    }
}

fn unexpected(endpoint: &str, message: &SyncMessage) -> SyncError {
    SyncError::transport_fatal(format!(
        "unexpected response type {} from {endpoint}",
        message.type_code()
    ))
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn ensure_scope(
        &self,
        ctx: &SessionContext,
        setup: Option<&SyncSetup>,
    ) -> SyncResult<ServerScope> {
        let request = SyncMessage::EnsureScopeRequest(EnsureScopeRequest {
            context: ctx.clone(),
            setup: setup.cloned(),
        });
        match self.post_message(ENSURE_SCOPE_PATH, &request)? {
            SyncMessage::EnsureScopeResponse(response) => Ok(response.server_scope),
            other => Err(unexpected(ENSURE_SCOPE_PATH, &other)),
        }
    }

    fn apply_then_get_changes(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
        batch: Option<&BatchInfo>,
    ) -> SyncResult<ServerChanges> {
        let parts = batch.map(|b| b.parts.as_slice()).unwrap_or_default();

        let mut last = None;
        if parts.is_empty() {
            last = Some(self.send_part(SendChangesRequest {
                context: ctx.clone(),
                client_scope: client_scope.clone(),
                batch_index: 0,
                is_last_batch: true,
                changes: None,
            })?);
        }
        for (position, part) in parts.iter().enumerate() {
            let is_last_batch = position + 1 == parts.len();
            let bytes = match batch {
                Some(info) => read_part_bytes(info, part)?,
                None => Vec::new(),
            };
            let response = self.send_part(SendChangesRequest {
                context: ctx.clone(),
                client_scope: client_scope.clone(),
                batch_index: part.index,
                is_last_batch,
                changes: Some(bytes),
            })?;
            if is_last_batch {
                last = Some(response);
            } else if response.server_step != ServerStep::PartAcknowledged {
                return Err(SyncError::transport_fatal(format!(
                    "part {} was not acknowledged",
                    part.index
                )));
            }
        }

        let response = last.ok_or_else(|| SyncError::transport_fatal("no server response"))?;
        if response.server_step != ServerStep::ChangesSelected {
            return Err(SyncError::transport_fatal(format!(
                "expected selected changes, got {:?}",
                response.server_step
            )));
        }

        let download = self.download(
            ctx,
            &format!("client_download_{}", ctx.session_id),
            response.schema.unwrap_or_default(),
            response.changes,
            response.batch_count,
            response.timestamp,
        )?;

        Ok(ServerChanges {
            remote_client_timestamp: response.remote_client_timestamp,
            batch: download,
            changes_selected: response.changes_selected,
            changes_applied: response.changes_applied,
            policy: response.policy,
        })
    }

    fn get_estimated_changes_count(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
    ) -> SyncResult<EstimatedChanges> {
        let request = SyncMessage::EstimateChangesRequest(EstimateChangesRequest {
            context: ctx.clone(),
            client_scope: client_scope.clone(),
        });
        match self.post_message(ESTIMATE_PATH, &request)? {
            SyncMessage::EstimateChangesResponse(response) => Ok(EstimatedChanges {
                timestamp: response.remote_client_timestamp,
                changes_selected: response.changes_selected,
            }),
            other => Err(unexpected(ESTIMATE_PATH, &other)),
        }
    }

    fn get_snapshot(&self, ctx: &SessionContext) -> SyncResult<Option<BatchInfo>> {
        let request = SyncMessage::GetSnapshotRequest(GetSnapshotRequest {
            context: ctx.clone(),
        });
        let response = match self.post_message(SNAPSHOT_PATH, &request)? {
            SyncMessage::SnapshotResponse(response) => response,
            other => return Err(unexpected(SNAPSHOT_PATH, &other)),
        };
        if !response.has_snapshot {
            return Ok(None);
        }

        self.download(
            ctx,
            &format!("client_snapshot_{}", ctx.session_id),
            response.schema.unwrap_or_default(),
            None,
            response.batch_count,
            response.timestamp,
        )
        .map(Some)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl<C: HttpClient> std::fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("batch_directory", &self.batch_directory)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for std::sync::Arc<S> {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        (**self).handle_post(path, body)
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);

        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
