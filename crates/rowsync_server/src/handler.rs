//! Request handlers for sync endpoints.
//!
//! A session starts with the first uploaded part (or a snapshot request)
//! and ends when the client has fetched the last download page. Between
//! requests the server keeps the partial upload on disk and the manifest of
//! the download.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use parking_lot::{Mutex, RwLock};
use rowsync_engine::{
    load_part, read_part_bytes, remove_batch, BatchWriter, RemoteOrchestrator, SyncError,
    SyncProvider,
};
use rowsync_protocol::{
    serializer_for, BatchInfo, ConflictResolutionPolicy, DatabaseChangesApplied,
    DatabaseChangesSelected, EnsureScopeRequest, EnsureScopeResponse, EstimateChangesRequest,
    EstimateChangesResponse, GetMoreChangesRequest, GetSnapshotRequest, SendChangesRequest,
    SendChangesResponse, ServerStep, SessionContext, SnapshotResponse, TableChangesSelected,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Context for request handling.
pub struct HandlerContext<P: SyncProvider> {
    /// Server configuration.
    pub config: ServerConfig,
    /// Orchestrator over the server database.
    pub orchestrator: Arc<RemoteOrchestrator<P>>,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<ServerSession>>>>,
}

/// State kept between the requests of one session.
struct ServerSession {
    scope_name: String,
    last_seen: Instant,
    upload: Option<BatchWriter>,
    parts_received: u32,
    download: Option<Download>,
}

/// A batch being paged out to the client.
struct Download {
    batch: BatchInfo,
    /// Fields repeated on every page.
    header: SendChangesResponse,
    /// Snapshots are shared between sessions and never removed here.
    owned: bool,
}

impl ServerSession {
    fn new(scope_name: &str) -> Self {
        Self {
            scope_name: scope_name.to_string(),
            last_seen: Instant::now(),
            upload: None,
            parts_received: 0,
            download: None,
        }
    }
}

impl<P: SyncProvider> HandlerContext<P> {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, orchestrator: Arc<RemoteOrchestrator<P>>) -> Self {
        Self {
            config,
            orchestrator,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns the session for a context, creating it if needed.
    fn open_session(&self, ctx: &SessionContext) -> ServerResult<Arc<Mutex<ServerSession>>> {
        if let Some(session) = self.sessions.read().get(&ctx.session_id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(&ctx.session_id) {
            return Ok(Arc::clone(session));
        }
        if sessions.len() >= self.config.max_sessions {
            return Err(ServerError::TooManySessions(self.config.max_sessions));
        }
        let session = Arc::new(Mutex::new(ServerSession::new(&ctx.scope_name)));
        sessions.insert(ctx.session_id, Arc::clone(&session));
        tracing::debug!(session = %ctx.session_id, scope = %ctx.scope_name, "session opened");
        Ok(session)
    }

    fn get_session(&self, session_id: &Uuid) -> ServerResult<Arc<Mutex<ServerSession>>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or(ServerError::UnknownSession(*session_id))
    }

    /// Removes a session and the batch directories it owns.
    fn close_session(&self, session_id: &Uuid) {
        let Some(session) = self.sessions.write().remove(session_id) else {
            return;
        };
        let mut session = session.lock();
        if !self.orchestrator.options().clean_folder {
            return;
        }

        let root = &self.orchestrator.options().batch_directory;
        let mut directories = vec![root.join(format!("server_upload_{session_id}"))];
        if let Some(download) = session.download.take().filter(|d| d.owned) {
            directories.push(download.batch.directory_path());
        }
        for directory in directories {
            if let Err(e) = remove_batch(&directory) {
                tracing::warn!(
                    session = %session_id,
                    directory = %directory.display(),
                    error = %e,
                    "failed to remove session batch"
                );
            }
        }
        tracing::debug!(session = %session_id, "session closed");
    }

    /// Drops sessions idle for longer than the configured timeout.
    ///
    /// Returns the number of sessions dropped.
    pub fn expire_sessions(&self) -> usize {
        let timeout = self.config.session_timeout;
        let expired: Vec<Uuid> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| {
                s.try_lock()
                    .is_some_and(|s| s.last_seen.elapsed() > timeout)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            tracing::info!(session = %id, "session expired");
            self.close_session(id);
        }
        expired.len()
    }
}

/// Handler for sync requests.
pub struct RequestHandler<P: SyncProvider> {
    context: Arc<HandlerContext<P>>,
}

impl<P: SyncProvider> RequestHandler<P> {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext<P>>) -> Self {
        Self { context }
    }

    fn orchestrator(&self) -> &RemoteOrchestrator<P> {
        &self.context.orchestrator
    }

    /// Handles an ensure-scope request.
    pub fn handle_ensure_scope(
        &self,
        request: EnsureScopeRequest,
    ) -> ServerResult<EnsureScopeResponse> {
        let server_scope =
            self.orchestrator()
                .ensure_scope(&request.context, request.setup.as_ref(), None)?;
        Ok(EnsureScopeResponse {
            context: request.context,
            server_scope,
        })
    }

    /// Handles one uploaded part.
    ///
    /// Non-final parts are stored and acknowledged. The final part applies
    /// the whole upload and answers with the first download page.
    pub fn handle_send_changes(
        &self,
        request: SendChangesRequest,
    ) -> ServerResult<SendChangesResponse> {
        let ctx = &request.context;
        if ctx.scope_name != request.client_scope.name {
            return Err(ServerError::InvalidRequest(format!(
                "context scope {} does not match client scope {}",
                ctx.scope_name, request.client_scope.name
            )));
        }
        if request.batch_index >= self.context.config.max_upload_parts {
            return Err(ServerError::UploadTooLarge {
                max: self.context.config.max_upload_parts,
            });
        }

        let session = self.context.open_session(ctx)?;
        let mut session = session.lock();
        check_scope(&session, ctx)?;
        session.last_seen = Instant::now();

        if let Some(bytes) = &request.changes {
            if session.upload.is_none() {
                session.upload = Some(self.upload_writer(ctx)?);
            }
            if let Some(writer) = session.upload.as_mut() {
                writer.write_raw_part(bytes)?;
            }
            session.parts_received += 1;
        }

        if !request.is_last_batch {
            return Ok(SendChangesResponse::acknowledge(
                ctx.clone(),
                request.batch_index,
            ));
        }

        let upload = session
            .upload
            .take()
            .map(|w| w.finish(request.client_scope.last_sync_timestamp))
            .transpose()?;
        tracing::debug!(
            session = %ctx.session_id,
            parts = session.parts_received,
            rows = upload.as_ref().map_or(0, |b| b.rows_count),
            "upload complete"
        );

        let changes = match self.orchestrator().apply_then_get_changes(
            ctx,
            &request.client_scope,
            upload.as_ref(),
            None,
        ) {
            Ok(changes) => changes,
            Err(e) => {
                drop(session);
                self.context.close_session(&ctx.session_id);
                return Err(e.into());
            }
        };

        let header = SendChangesResponse {
            context: ctx.clone(),
            server_step: ServerStep::ChangesSelected,
            batch_index: 0,
            batch_count: changes.batch.parts.len() as u32,
            is_last_batch: true,
            remote_client_timestamp: changes.remote_client_timestamp,
            changes: None,
            changes_selected: changes.changes_selected,
            changes_applied: changes.changes_applied,
            policy: changes.policy,
            timestamp: changes.batch.timestamp,
            schema: Some(changes.batch.schema.clone()),
        };
        session.download = Some(Download {
            batch: changes.batch,
            header,
            owned: true,
        });

        let page = page(&session, ctx, 0)?;
        drop(session);
        if page.is_last_batch {
            self.context.close_session(&ctx.session_id);
        }
        Ok(page)
    }

    fn upload_writer(&self, ctx: &SessionContext) -> ServerResult<BatchWriter> {
        let schema = self
            .orchestrator()
            .load_server_scope(&ctx.scope_name, None)?
            .and_then(|s| s.schema)
            .ok_or_else(|| SyncError::MissingSchema {
                scope_name: ctx.scope_name.clone(),
            })?;
        Ok(BatchWriter::create(
            &self.orchestrator().options().batch_directory,
            &format!("server_upload_{}", ctx.session_id),
            schema,
            ctx.batch_size_kb,
            &ctx.serializer,
        )?)
    }

    /// Handles a request for a further download page.
    pub fn handle_get_more_changes(
        &self,
        request: GetMoreChangesRequest,
    ) -> ServerResult<SendChangesResponse> {
        let ctx = &request.context;
        let session = self.context.get_session(&ctx.session_id)?;
        let mut session = session.lock();
        check_scope(&session, ctx)?;
        session.last_seen = Instant::now();

        let page = page(&session, ctx, request.batch_index_requested)?;
        drop(session);
        if page.is_last_batch {
            self.context.close_session(&ctx.session_id);
        }
        Ok(page)
    }

    /// Handles an estimate request.
    pub fn handle_estimate(
        &self,
        request: EstimateChangesRequest,
    ) -> ServerResult<EstimateChangesResponse> {
        let estimated = self.orchestrator().get_estimated_changes_count(
            &request.context,
            &request.client_scope,
            None,
        )?;
        Ok(EstimateChangesResponse {
            context: request.context,
            remote_client_timestamp: estimated.timestamp,
            changes_selected: estimated.changes_selected,
        })
    }

    /// Handles a snapshot request. The parts are then fetched with
    /// [`GetMoreChangesRequest`], starting at index 0.
    pub fn handle_snapshot(&self, request: GetSnapshotRequest) -> ServerResult<SnapshotResponse> {
        let ctx = &request.context;
        let Some(batch) = self.orchestrator().get_snapshot(&ctx.scope_name)? else {
            return Ok(SnapshotResponse {
                context: request.context,
                has_snapshot: false,
                timestamp: 0,
                batch_count: 0,
                changes_selected: DatabaseChangesSelected::default(),
                schema: None,
            });
        };

        let mut changes_selected = DatabaseChangesSelected::default();
        for table in batch.table_rows() {
            let mut selected = TableChangesSelected::new(table.table_name);
            selected.upserts = table.rows_count;
            changes_selected.push(selected);
        }

        let response = SnapshotResponse {
            context: ctx.clone(),
            has_snapshot: true,
            timestamp: batch.timestamp,
            batch_count: batch.parts.len() as u32,
            changes_selected: changes_selected.clone(),
            schema: Some(batch.schema.clone()),
        };
        if batch.parts.is_empty() {
            return Ok(response);
        }

        let header = SendChangesResponse {
            context: ctx.clone(),
            server_step: ServerStep::MoreChanges,
            batch_index: 0,
            batch_count: response.batch_count,
            is_last_batch: false,
            remote_client_timestamp: batch.timestamp,
            changes: None,
            changes_selected,
            changes_applied: DatabaseChangesApplied::default(),
            policy: ConflictResolutionPolicy::ServerWins,
            timestamp: batch.timestamp,
            schema: Some(batch.schema.clone()),
        };

        let session = self.context.open_session(ctx)?;
        let mut session = session.lock();
        check_scope(&session, ctx)?;
        session.last_seen = Instant::now();
        session.download = Some(Download {
            batch,
            header,
            owned: false,
        });
        Ok(response)
    }
}

fn check_scope(session: &ServerSession, ctx: &SessionContext) -> ServerResult<()> {
    if session.scope_name == ctx.scope_name {
        Ok(())
    } else {
        Err(ServerError::InvalidRequest(format!(
            "session {} belongs to scope {}, not {}",
            ctx.session_id, session.scope_name, ctx.scope_name
        )))
    }
}

/// Builds download page `index`, encoded with the client's serializer.
fn page(session: &ServerSession, ctx: &SessionContext, index: u32) -> ServerResult<SendChangesResponse> {
    let download = session.download.as_ref().ok_or_else(|| {
        ServerError::InvalidRequest(format!("session {} has no download", ctx.session_id))
    })?;
    let batch = &download.batch;
    let batch_count = batch.parts.len() as u32;

    let changes = match batch.parts.get(index as usize) {
        Some(part) if batch.serializer == ctx.serializer => Some(read_part_bytes(batch, part)?),
        Some(part) => {
            let content = load_part(batch, part)?;
            Some(serializer_for(&ctx.serializer)?.serialize_part(&content)?)
        }
        None if index == 0 && batch_count == 0 => None,
        None => {
            return Err(ServerError::InvalidRequest(format!(
                "batch index {index} out of range, batch has {batch_count} parts"
            )))
        }
    };

    let mut response = download.header.clone();
    response.context = ctx.clone();
    response.batch_index = index;
    response.is_last_batch = index + 1 >= batch_count;
    if index > 0 {
        response.server_step = ServerStep::MoreChanges;
    }
    response.changes = changes;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_memory::MemoryProvider;
    use rowsync_protocol::{ClientScope, SyncType};
    use rowsync_testkit::{sample_server_db, sample_setup, seed_sample_rows, SCOPE};
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_handler(config: ServerConfig) -> RequestHandler<MemoryProvider> {
        let db = sample_server_db("server");
        seed_sample_rows(&db).unwrap();
        let orchestrator =
            Arc::new(RemoteOrchestrator::new(db, config.sync_options.clone()).unwrap());
        RequestHandler::new(Arc::new(HandlerContext::new(config, orchestrator)))
    }

    fn config(dir: &TempDir) -> ServerConfig {
        ServerConfig::default().with_sync_options(
            rowsync_engine::SyncOptions::new(dir.path().join("batches"))
                .with_snapshots_directory(dir.path().join("snapshots")),
        )
    }

    fn ensure(handler: &RequestHandler<MemoryProvider>) -> SessionContext {
        let ctx = SessionContext::new(SCOPE, Uuid::new_v4(), SyncType::Normal);
        handler
            .handle_ensure_scope(EnsureScopeRequest {
                context: ctx.clone(),
                setup: Some(sample_setup()),
            })
            .unwrap();
        ctx
    }

    fn new_client(ctx: &SessionContext) -> ClientScope {
        let mut scope = ClientScope::new(SCOPE);
        scope.id = ctx.client_scope_id;
        scope
    }

    #[test]
    fn ensure_scope_resolves_schema() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir));
        let ctx = SessionContext::new(SCOPE, Uuid::new_v4(), SyncType::Normal);

        let response = handler
            .handle_ensure_scope(EnsureScopeRequest {
                context: ctx,
                setup: Some(sample_setup()),
            })
            .unwrap();
        assert!(response.server_scope.has_schema());
        assert_eq!(response.server_scope.name, SCOPE);
    }

    #[test]
    fn download_is_paged_until_last_part() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir));
        let ctx = ensure(&handler);

        let first = handler
            .handle_send_changes(SendChangesRequest {
                context: ctx.clone(),
                client_scope: new_client(&ctx),
                batch_index: 0,
                is_last_batch: true,
                changes: None,
            })
            .unwrap();

        assert_eq!(first.server_step, ServerStep::ChangesSelected);
        assert_eq!(first.changes_selected.total_upserts(), 3);
        // One part per table.
        assert_eq!(first.batch_count, 3);
        assert!(!first.is_last_batch);
        assert!(first.changes.is_some());
        assert_eq!(handler.context.session_count(), 1);

        for index in 1..3 {
            let page = handler
                .handle_get_more_changes(GetMoreChangesRequest {
                    context: ctx.clone(),
                    batch_index_requested: index,
                })
                .unwrap();
            assert_eq!(page.server_step, ServerStep::MoreChanges);
            assert_eq!(page.batch_index, index);
            assert_eq!(page.is_last_batch, index == 2);
            assert_eq!(page.remote_client_timestamp, first.remote_client_timestamp);
        }
        assert_eq!(handler.context.session_count(), 0);
        assert!(!dir
            .path()
            .join("batches")
            .join(format!("server_changes_{}", ctx.session_id))
            .exists());
    }

    #[test]
    fn page_out_of_range() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir));
        let ctx = ensure(&handler);
        handler
            .handle_send_changes(SendChangesRequest {
                context: ctx.clone(),
                client_scope: new_client(&ctx),
                batch_index: 0,
                is_last_batch: true,
                changes: None,
            })
            .unwrap();

        let err = handler
            .handle_get_more_changes(GetMoreChangesRequest {
                context: ctx,
                batch_index_requested: 7,
            })
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[test]
    fn get_more_without_session_fails() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir));
        let ctx = ensure(&handler);

        let err = handler
            .handle_get_more_changes(GetMoreChangesRequest {
                context: ctx.clone(),
                batch_index_requested: 1,
            })
            .unwrap_err();
        assert!(matches!(err, ServerError::UnknownSession(id) if id == ctx.session_id));
        assert!(err.is_client_error());
    }

    #[test]
    fn upload_part_limit() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir).with_max_upload_parts(1));
        let ctx = ensure(&handler);

        let err = handler
            .handle_send_changes(SendChangesRequest {
                context: ctx.clone(),
                client_scope: new_client(&ctx),
                batch_index: 1,
                is_last_batch: false,
                changes: None,
            })
            .unwrap_err();
        assert!(matches!(err, ServerError::UploadTooLarge { max: 1 }));
    }

    #[test]
    fn session_limit_is_retryable() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir).with_max_sessions(1));
        let first = ensure(&handler);
        let second = ensure(&handler);

        let ack = handler
            .handle_send_changes(SendChangesRequest {
                context: first.clone(),
                client_scope: new_client(&first),
                batch_index: 0,
                is_last_batch: false,
                changes: None,
            })
            .unwrap();
        assert_eq!(ack.server_step, ServerStep::PartAcknowledged);
        assert_eq!(handler.context.session_count(), 1);

        let err = handler
            .handle_send_changes(SendChangesRequest {
                context: second.clone(),
                client_scope: new_client(&second),
                batch_index: 0,
                is_last_batch: true,
                changes: None,
            })
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn idle_sessions_expire() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir).with_session_timeout(Duration::ZERO));
        let ctx = ensure(&handler);
        handler
            .handle_send_changes(SendChangesRequest {
                context: ctx.clone(),
                client_scope: new_client(&ctx),
                batch_index: 0,
                is_last_batch: false,
                changes: None,
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(handler.context.expire_sessions(), 1);
        assert_eq!(handler.context.session_count(), 0);
    }

    #[test]
    fn missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir));
        let ctx = ensure(&handler);

        let response = handler
            .handle_snapshot(GetSnapshotRequest { context: ctx })
            .unwrap();
        assert!(!response.has_snapshot);
        assert_eq!(handler.context.session_count(), 0);
    }

    #[test]
    fn snapshot_pages_follow_request() {
        let dir = TempDir::new().unwrap();
        let handler = create_handler(config(&dir));
        let ctx = ensure(&handler);
        handler
            .orchestrator()
            .create_snapshot(SCOPE, None)
            .unwrap();

        let response = handler
            .handle_snapshot(GetSnapshotRequest {
                context: ctx.clone(),
            })
            .unwrap();
        assert!(response.has_snapshot);
        assert_eq!(response.batch_count, 3);
        assert_eq!(response.changes_selected.total_upserts(), 3);

        for index in 0..3 {
            let page = handler
                .handle_get_more_changes(GetMoreChangesRequest {
                    context: ctx.clone(),
                    batch_index_requested: index,
                })
                .unwrap();
            assert_eq!(page.is_last_batch, index == 2);
            assert!(page.changes.is_some());
        }
        assert_eq!(handler.context.session_count(), 0);

        // The shared snapshot survives the end of the session.
        assert!(handler.orchestrator().get_snapshot(SCOPE).unwrap().is_some());
    }
}
