//! Scope metadata store.
//!
//! Wraps a provider's [`ScopeStoreBuilder`] with the create-or-load logic
//! both sides run at the start of a session.

use crate::error::{SyncError, SyncResult};
use crate::interceptor::{ConflictingSetupAction, ConflictingSetupArgs, Interceptors};
use crate::provider::{ScopeStoreBuilder, ScopeTable};
use rowsync_protocol::{ClientScope, ServerHistoryScope, ServerScope, SyncSchema, SyncSetup};
use uuid::Uuid;

/// Result of [`ScopeStore::ensure_server_scope`].
#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    /// The scope, saved.
    pub scope: ServerScope,
    /// True if tracking objects must be created for the schema.
    pub should_provision: bool,
    /// Setup replaced by a `Continue` decision, to migrate from.
    pub previous_setup: Option<SyncSetup>,
    /// Schema replaced along with `previous_setup`.
    pub previous_schema: Option<SyncSchema>,
}

/// Scope records on one store.
pub struct ScopeStore<'a, C> {
    builder: Box<dyn ScopeStoreBuilder<C> + 'a>,
}

impl<'a, C> ScopeStore<'a, C> {
    /// Wraps a scope store builder.
    pub fn new(builder: Box<dyn ScopeStoreBuilder<C> + 'a>) -> Self {
        Self { builder }
    }

    /// Creates a scope table if it does not exist.
    pub fn ensure_table(&self, conn: &mut C, table: ScopeTable) -> SyncResult<()> {
        if !self.builder.exists(conn, table)? {
            tracing::debug!(?table, "creating scope table");
            self.builder.create(conn, table)?;
        }
        Ok(())
    }

    /// Returns the current logical timestamp of the store.
    pub fn local_timestamp(&self, conn: &mut C) -> SyncResult<u64> {
        Ok(self.builder.local_timestamp(conn)?)
    }

    /// Loads the client scope, creating the scope table and a new scope if
    /// needed.
    pub fn ensure_client_scope(&self, conn: &mut C, name: &str) -> SyncResult<ClientScope> {
        self.ensure_table(conn, ScopeTable::Client)?;

        if let Some(scope) = self.builder.load_client_scope(conn, name)? {
            return Ok(scope);
        }

        let scope = ClientScope::new(name);
        self.builder.save_client_scope(conn, &scope)?;
        tracing::info!(scope = name, id = %scope.id, "client scope created");
        Ok(scope)
    }

    /// Loads or creates the server scope and reconciles it with `setup`.
    ///
    /// `resolve` turns a setup into a schema against the same connection.
    pub fn ensure_server_scope<F>(
        &self,
        conn: &mut C,
        name: &str,
        setup: Option<&SyncSetup>,
        overwrite: bool,
        interceptors: &Interceptors,
        resolve: F,
    ) -> SyncResult<EnsureOutcome>
    where
        F: FnOnce(&mut C, &SyncSetup) -> SyncResult<SyncSchema>,
    {
        self.ensure_table(conn, ScopeTable::Server)?;
        self.ensure_table(conn, ScopeTable::ServerHistory)?;

        let mut scope = match self.builder.load_server_scope(conn, name)? {
            Some(scope) => scope,
            None => {
                let scope = ServerScope::new(name);
                self.builder.save_server_scope(conn, &scope)?;
                tracing::info!(scope = name, id = %scope.id, "server scope created");
                scope
            }
        };

        let mut outcome = EnsureOutcome {
            scope: scope.clone(),
            should_provision: false,
            previous_setup: None,
            previous_schema: None,
        };

        let Some(setup) = setup.filter(|s| s.has_tables()) else {
            return Ok(outcome);
        };

        if !scope.has_schema() || overwrite {
            // Tracking object names are shared by every scope on the store.
            let others = self.builder.list_server_scopes(conn)?;
            if let Some(other) = others
                .iter()
                .filter(|s| s.name != name)
                .find_map(|s| s.setup.as_ref())
            {
                if !other.same_affixes(setup) {
                    return Err(SyncError::conflicting_setup(
                        name,
                        "tracking table or trigger affixes differ from another scope",
                    ));
                }
            }

            let schema = resolve(conn, setup)?;
            scope.setup = Some(setup.clone());
            scope.schema = Some(schema);
            self.builder.save_server_scope(conn, &scope)?;

            outcome.scope = scope;
            outcome.should_provision = true;
            return Ok(outcome);
        }

        let stored = scope.setup.clone().unwrap_or_default();
        if &stored == setup {
            return Ok(outcome);
        }

        let args = ConflictingSetupArgs {
            scope_name: name,
            stored_setup: &stored,
            requested_setup: setup,
        };
        match interceptors.conflicting_setup(&args) {
            ConflictingSetupAction::Rollback => {
                return Err(SyncError::conflicting_setup(
                    name,
                    "requested setup differs from the stored setup",
                ));
            }
            ConflictingSetupAction::Abort => {
                tracing::info!(scope = name, "conflicting setup ignored, keeping stored setup");
                return Ok(outcome);
            }
            ConflictingSetupAction::Continue => {
                let schema = resolve(conn, setup)?;
                outcome.previous_setup = scope.setup.replace(setup.clone());
                outcome.previous_schema = scope.schema.replace(schema);
                self.builder.save_server_scope(conn, &scope)?;
            }
        }

        let reloaded = self
            .builder
            .load_server_scope(conn, name)?
            .unwrap_or_else(|| scope.clone());
        if reloaded.setup.as_ref() != Some(setup) {
            return Err(SyncError::conflicting_setup(
                name,
                "setup still differs after migration",
            ));
        }

        tracing::info!(scope = name, "setup changed, migration required");
        outcome.scope = reloaded;
        Ok(outcome)
    }

    /// Loads a client scope.
    pub fn load_client_scope(&self, conn: &mut C, name: &str) -> SyncResult<Option<ClientScope>> {
        self.ensure_table(conn, ScopeTable::Client)?;
        Ok(self.builder.load_client_scope(conn, name)?)
    }

    /// Saves a client scope.
    pub fn save_client_scope(&self, conn: &mut C, scope: &ClientScope) -> SyncResult<()> {
        self.ensure_table(conn, ScopeTable::Client)?;
        Ok(self.builder.save_client_scope(conn, scope)?)
    }

    /// Lists client scopes.
    pub fn list_client_scopes(&self, conn: &mut C) -> SyncResult<Vec<ClientScope>> {
        if !self.builder.exists(conn, ScopeTable::Client)? {
            return Ok(Vec::new());
        }
        Ok(self.builder.list_client_scopes(conn)?)
    }

    /// Loads a server scope.
    pub fn load_server_scope(&self, conn: &mut C, name: &str) -> SyncResult<Option<ServerScope>> {
        if !self.builder.exists(conn, ScopeTable::Server)? {
            return Ok(None);
        }
        Ok(self.builder.load_server_scope(conn, name)?)
    }

    /// Saves a server scope.
    pub fn save_server_scope(&self, conn: &mut C, scope: &ServerScope) -> SyncResult<()> {
        self.ensure_table(conn, ScopeTable::Server)?;
        Ok(self.builder.save_server_scope(conn, scope)?)
    }

    /// Lists server scopes.
    pub fn list_server_scopes(&self, conn: &mut C) -> SyncResult<Vec<ServerScope>> {
        if !self.builder.exists(conn, ScopeTable::Server)? {
            return Ok(Vec::new());
        }
        Ok(self.builder.list_server_scopes(conn)?)
    }

    /// Loads a history entry.
    pub fn load_history_scope(
        &self,
        conn: &mut C,
        id: Uuid,
    ) -> SyncResult<Option<ServerHistoryScope>> {
        if !self.builder.exists(conn, ScopeTable::ServerHistory)? {
            return Ok(None);
        }
        Ok(self.builder.load_history_scope(conn, id)?)
    }

    /// Saves a history entry.
    pub fn save_history_scope(&self, conn: &mut C, scope: &ServerHistoryScope) -> SyncResult<()> {
        self.ensure_table(conn, ScopeTable::ServerHistory)?;
        Ok(self.builder.save_history_scope(conn, scope)?)
    }

    /// Lists history entries of a scope.
    pub fn list_history_scopes(&self, conn: &mut C, name: &str) -> SyncResult<Vec<ServerHistoryScope>> {
        if !self.builder.exists(conn, ScopeTable::ServerHistory)? {
            return Ok(Vec::new());
        }
        Ok(self.builder.list_history_scopes(conn, name)?)
    }

    /// Drops a scope table.
    pub fn drop_table(&self, conn: &mut C, table: ScopeTable) -> SyncResult<()> {
        if self.builder.exists(conn, table)? {
            self.builder.drop_table(conn, table)?;
        }
        Ok(())
    }
}
