//! Transport layer abstraction for sync sessions.

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{EstimatedChanges, RemoteOrchestrator, ServerChanges};
use crate::provider::SyncProvider;
use rowsync_protocol::{BatchInfo, ClientScope, ServerScope, SessionContext, SyncSetup};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A sync transport carries a client session to the server.
///
/// Batches are passed as manifests on disk: an implementation either shares
/// the directory with the server or moves the parts across the wire and
/// reassembles them locally.
pub trait SyncTransport: Send + Sync {
    /// Loads or creates the server scope, sending the client's setup.
    fn ensure_scope(
        &self,
        ctx: &SessionContext,
        setup: Option<&SyncSetup>,
    ) -> SyncResult<ServerScope>;

    /// Sends the client's changes and returns the server's.
    fn apply_then_get_changes(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
        batch: Option<&BatchInfo>,
    ) -> SyncResult<ServerChanges>;

    /// Counts the rows the server would send.
    fn get_estimated_changes_count(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
    ) -> SyncResult<EstimatedChanges>;

    /// Returns the server snapshot of the scope, if one exists.
    fn get_snapshot(&self, ctx: &SessionContext) -> SyncResult<Option<BatchInfo>>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport.
    fn close(&self) -> SyncResult<()>;
}

/// Transport calling a server orchestrator in the same process.
///
/// Server batches are read directly from the server's batch directory.
pub struct InProcessTransport<P: SyncProvider> {
    server: Arc<RemoteOrchestrator<P>>,
    connected: AtomicBool,
}

impl<P: SyncProvider> InProcessTransport<P> {
    /// Creates a transport over a shared server orchestrator.
    pub fn new(server: Arc<RemoteOrchestrator<P>>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
        }
    }

    /// Returns the server orchestrator.
    pub fn server(&self) -> &RemoteOrchestrator<P> {
        &self.server
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::transport_fatal("transport is closed"))
        }
    }
}

impl<P: SyncProvider> SyncTransport for InProcessTransport<P> {
    fn ensure_scope(
        &self,
        ctx: &SessionContext,
        setup: Option<&SyncSetup>,
    ) -> SyncResult<ServerScope> {
        self.check_connected()?;
        self.server.ensure_scope(ctx, setup, None)
    }

    fn apply_then_get_changes(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
        batch: Option<&BatchInfo>,
    ) -> SyncResult<ServerChanges> {
        self.check_connected()?;
        self.server
            .apply_then_get_changes(ctx, client_scope, batch, None)
    }

    fn get_estimated_changes_count(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
    ) -> SyncResult<EstimatedChanges> {
        self.check_connected()?;
        self.server
            .get_estimated_changes_count(ctx, client_scope, None)
    }

    fn get_snapshot(&self, ctx: &SessionContext) -> SyncResult<Option<BatchInfo>> {
        self.check_connected()?;
        self.server.get_snapshot(&ctx.scope_name)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl<P: SyncProvider> std::fmt::Debug for InProcessTransport<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("connected", &self.is_connected())
            .finish()
    }
}
