//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use rowsync_engine::{
    LoopbackServer, RemoteOrchestrator, SyncProvider, ENSURE_SCOPE_PATH, ESTIMATE_PATH,
    GET_MORE_CHANGES_PATH, SEND_CHANGES_PATH, SNAPSHOT_PATH,
};
use rowsync_protocol::{ErrorResponse, SyncMessage};
use std::sync::Arc;

/// The sync server.
///
/// Decodes CBOR [`SyncMessage`] envelopes, runs them against a
/// [`RemoteOrchestrator`] and keeps the per-session state needed to
/// reassemble uploads and page downloads. It is transport agnostic: an HTTP
/// front end posts request bodies to [`SyncServer::handle_request`].
///
/// # Example
///
/// ```
/// use rowsync_engine::SyncOptions;
/// use rowsync_memory::MemoryProvider;
/// use rowsync_server::{ServerConfig, SyncServer};
///
/// let dir = tempfile::tempdir().unwrap();
/// let config = ServerConfig::default().with_sync_options(SyncOptions::new(dir.path()));
/// let server = SyncServer::new(MemoryProvider::new("server"), config).unwrap();
/// assert_eq!(server.session_count(), 0);
/// ```
pub struct SyncServer<P: SyncProvider> {
    handler: RequestHandler<P>,
    context: Arc<HandlerContext<P>>,
}

impl<P: SyncProvider> SyncServer<P> {
    /// Creates a sync server over a provider.
    pub fn new(provider: P, config: ServerConfig) -> ServerResult<Self> {
        let orchestrator = RemoteOrchestrator::new(provider, config.sync_options.clone())?;
        Ok(Self::with_orchestrator(config, Arc::new(orchestrator)))
    }

    /// Creates a sync server sharing an existing orchestrator.
    ///
    /// The orchestrator's own options apply; `config.sync_options` is
    /// ignored.
    pub fn with_orchestrator(config: ServerConfig, orchestrator: Arc<RemoteOrchestrator<P>>) -> Self {
        let context = Arc::new(HandlerContext::new(config, orchestrator));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the orchestrator.
    pub fn orchestrator(&self) -> &Arc<RemoteOrchestrator<P>> {
        &self.context.orchestrator
    }

    /// Returns the number of open sessions.
    pub fn session_count(&self) -> usize {
        self.context.session_count()
    }

    /// Drops idle sessions. Returns the number dropped.
    pub fn expire_sessions(&self) -> usize {
        self.context.expire_sessions()
    }

    /// Handles a sync message (dispatches to appropriate handler).
    pub fn handle_message(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::EnsureScopeRequest(req) => self
                .handler
                .handle_ensure_scope(req)
                .map(SyncMessage::EnsureScopeResponse),
            SyncMessage::SendChangesRequest(req) => self
                .handler
                .handle_send_changes(req)
                .map(SyncMessage::SendChangesResponse),
            SyncMessage::GetMoreChangesRequest(req) => self
                .handler
                .handle_get_more_changes(req)
                .map(SyncMessage::SendChangesResponse),
            SyncMessage::EstimateChangesRequest(req) => self
                .handler
                .handle_estimate(req)
                .map(SyncMessage::EstimateChangesResponse),
            SyncMessage::GetSnapshotRequest(req) => self
                .handler
                .handle_snapshot(req)
                .map(SyncMessage::SnapshotResponse),
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        }
    }

    /// Handles a POST body received on `path`.
    ///
    /// Failures are answered with an encoded [`SyncMessage::Error`]; only a
    /// failure to encode the response itself is returned as an error.
    pub fn handle_request(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        self.context.expire_sessions();

        let response = match self.dispatch(path, body) {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    tracing::error!(path, error = %e, "request failed");
                } else {
                    tracing::warn!(path, error = %e, "request rejected");
                }
                SyncMessage::Error(self.error_response(&e))
            }
        };
        Ok(response.encode()?)
    }

    fn dispatch(&self, path: &str, body: &[u8]) -> ServerResult<SyncMessage> {
        let message = SyncMessage::decode(body)?;
        let expected = request_path(&message).ok_or_else(|| {
            ServerError::InvalidRequest(format!("message type {} is not a request", message.type_code()))
        })?;
        if expected != path {
            return Err(ServerError::InvalidRequest(format!(
                "message type {} posted to {path}, expected {expected}",
                message.type_code()
            )));
        }
        self.handle_message(message)
    }

    /// Builds the envelope reported to the client for a failure.
    pub fn error_response(&self, error: &ServerError) -> ErrorResponse {
        let store_retry = match error {
            ServerError::Sync(e) => e
                .store_error()
                .is_some_and(|s| self.orchestrator().provider().should_retry(s)),
            _ => false,
        };
        ErrorResponse::new(
            error.stage_name(),
            error.to_string(),
            store_retry || error.is_retryable(),
        )
    }
}

/// Returns the endpoint a request message is posted to.
fn request_path(message: &SyncMessage) -> Option<&'static str> {
    match message {
        SyncMessage::EnsureScopeRequest(_) => Some(ENSURE_SCOPE_PATH),
        SyncMessage::SendChangesRequest(_) => Some(SEND_CHANGES_PATH),
        SyncMessage::GetMoreChangesRequest(_) => Some(GET_MORE_CHANGES_PATH),
        SyncMessage::EstimateChangesRequest(_) => Some(ESTIMATE_PATH),
        SyncMessage::GetSnapshotRequest(_) => Some(SNAPSHOT_PATH),
        _ => None,
    }
}

impl<P: SyncProvider> LoopbackServer for SyncServer<P> {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.handle_request(path, body).map_err(|e| e.to_string())
    }
}
