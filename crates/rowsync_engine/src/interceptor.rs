//! Synchronous interception hooks.
//!
//! Each hook returns a decision value; an unset hook behaves as the default
//! decision. Hooks run on the thread driving the session.

use crate::progress::{ProgressArgs, SyncSide};
use crate::provider::SyncProvision;
use rowsync_protocol::{ConflictResolution, ConflictResolutionPolicy, SyncConflict, SyncRow, SyncSetup, SyncTable};
use std::fmt;

/// Decision for a setup that differs from the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictingSetupAction {
    /// Fail with `ConflictingSetup`.
    #[default]
    Rollback,
    /// Keep the stored setup and continue the session with it.
    Abort,
    /// Adopt the requested setup and migrate.
    Continue,
}

/// Arguments of the conflicting-setup hook.
#[derive(Debug)]
pub struct ConflictingSetupArgs<'a> {
    /// Scope name.
    pub scope_name: &'a str,
    /// Setup currently stored.
    pub stored_setup: &'a SyncSetup,
    /// Setup requested.
    pub requested_setup: &'a SyncSetup,
}

/// Decision before provisioning a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableProvisioningAction {
    /// Provision the table.
    #[default]
    Continue,
    /// Skip the table.
    Cancel,
}

/// Arguments of the table-provisioning hook.
#[derive(Debug)]
pub struct TableProvisioningArgs<'a> {
    /// Table about to be provisioned.
    pub table: &'a SyncTable,
    /// Objects about to be created.
    pub provision: SyncProvision,
    /// Side provisioning.
    pub side: SyncSide,
}

/// Decision before applying a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowApplyingAction {
    /// Apply the (possibly modified) row.
    #[default]
    Apply,
    /// Skip the row.
    Skip,
}

/// Arguments of the row-applying hook. The row may be modified in place.
#[derive(Debug)]
pub struct RowApplyingArgs<'a> {
    /// Table name.
    pub table_name: &'a str,
    /// Column names, in value order.
    pub columns: &'a [String],
    /// Side applying.
    pub side: SyncSide,
    /// Incoming row.
    pub row: &'a mut SyncRow,
}

/// Decision for an update/update conflict.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConflictAction {
    /// Resolve with the configured policy.
    #[default]
    UsePolicy,
    /// Keep the server's row.
    ServerWins,
    /// Keep the client's row.
    ClientWins,
    /// Write a merged row and send it back to the peer.
    MergeRow(SyncRow),
}

impl ConflictAction {
    /// Resolves the action against a policy.
    pub fn resolve(self, policy: ConflictResolutionPolicy) -> ConflictResolution {
        match self {
            ConflictAction::UsePolicy => policy.resolution(),
            ConflictAction::ServerWins => ConflictResolution::ServerWins,
            ConflictAction::ClientWins => ConflictResolution::ClientWins,
            ConflictAction::MergeRow(row) => ConflictResolution::MergeRow(row),
        }
    }
}

type ConflictingSetupHook = Box<dyn Fn(&ConflictingSetupArgs<'_>) -> ConflictingSetupAction + Send + Sync>;
type TableProvisioningHook = Box<dyn Fn(&TableProvisioningArgs<'_>) -> TableProvisioningAction + Send + Sync>;
type RowApplyingHook = Box<dyn Fn(&mut RowApplyingArgs<'_>) -> RowApplyingAction + Send + Sync>;
type ConflictHook = Box<dyn Fn(&SyncConflict, SyncSide) -> ConflictAction + Send + Sync>;
type ProgressHook = Box<dyn Fn(&ProgressArgs) + Send + Sync>;

/// The set of hooks attached to an orchestrator.
#[derive(Default)]
pub struct Interceptors {
    on_conflicting_setup: Option<ConflictingSetupHook>,
    on_table_provisioning: Option<TableProvisioningHook>,
    on_row_applying: Option<RowApplyingHook>,
    on_conflict: Option<ConflictHook>,
    on_progress: Option<ProgressHook>,
}

impl Interceptors {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the conflicting-setup hook.
    pub fn with_conflicting_setup<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConflictingSetupArgs<'_>) -> ConflictingSetupAction + Send + Sync + 'static,
    {
        self.on_conflicting_setup = Some(Box::new(f));
        self
    }

    /// Sets the table-provisioning hook.
    pub fn with_table_provisioning<F>(mut self, f: F) -> Self
    where
        F: Fn(&TableProvisioningArgs<'_>) -> TableProvisioningAction + Send + Sync + 'static,
    {
        self.on_table_provisioning = Some(Box::new(f));
        self
    }

    /// Sets the row-applying hook.
    pub fn with_row_applying<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut RowApplyingArgs<'_>) -> RowApplyingAction + Send + Sync + 'static,
    {
        self.on_row_applying = Some(Box::new(f));
        self
    }

    /// Sets the conflict hook.
    pub fn with_conflict<F>(mut self, f: F) -> Self
    where
        F: Fn(&SyncConflict, SyncSide) -> ConflictAction + Send + Sync + 'static,
    {
        self.on_conflict = Some(Box::new(f));
        self
    }

    /// Sets the progress hook.
    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProgressArgs) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub(crate) fn conflicting_setup(&self, args: &ConflictingSetupArgs<'_>) -> ConflictingSetupAction {
        self.on_conflicting_setup
            .as_ref()
            .map_or(ConflictingSetupAction::default(), |f| f(args))
    }

    pub(crate) fn table_provisioning(&self, args: &TableProvisioningArgs<'_>) -> TableProvisioningAction {
        self.on_table_provisioning
            .as_ref()
            .map_or(TableProvisioningAction::default(), |f| f(args))
    }

    pub(crate) fn row_applying(&self, args: &mut RowApplyingArgs<'_>) -> RowApplyingAction {
        self.on_row_applying
            .as_ref()
            .map_or(RowApplyingAction::default(), |f| f(args))
    }

    pub(crate) fn conflict(&self, conflict: &SyncConflict, side: SyncSide) -> ConflictAction {
        self.on_conflict
            .as_ref()
            .map_or(ConflictAction::default(), |f| f(conflict, side))
    }

    pub(crate) fn progress(&self, args: &ProgressArgs) {
        if let Some(f) = &self.on_progress {
            f(args);
        }
    }
}

impl fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors")
            .field("on_conflicting_setup", &self.on_conflicting_setup.is_some())
            .field("on_table_provisioning", &self.on_table_provisioning.is_some())
            .field("on_row_applying", &self.on_row_applying.is_some())
            .field("on_conflict", &self.on_conflict.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SyncStage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn defaults_without_hooks() {
        let interceptors = Interceptors::new();
        let setup = SyncSetup::new(["customer"]);
        let args = ConflictingSetupArgs {
            scope_name: "default",
            stored_setup: &setup,
            requested_setup: &setup,
        };
        assert_eq!(
            interceptors.conflicting_setup(&args),
            ConflictingSetupAction::Rollback
        );

        let conflict = SyncConflict::new("customer", None, SyncRow::upsert(vec![1.into()]));
        assert_eq!(
            interceptors.conflict(&conflict, SyncSide::Server),
            ConflictAction::UsePolicy
        );
    }

    #[test]
    fn row_hook_can_modify_rows() {
        let interceptors = Interceptors::new().with_row_applying(|args| {
            args.row.values[1] = "redacted".into();
            RowApplyingAction::Apply
        });

        let mut row = SyncRow::upsert(vec![1.into(), "secret".into()]);
        let columns = vec!["id".to_string(), "name".to_string()];
        let mut args = RowApplyingArgs {
            table_name: "customer",
            columns: &columns,
            side: SyncSide::Client,
            row: &mut row,
        };
        assert_eq!(interceptors.row_applying(&mut args), RowApplyingAction::Apply);
        assert_eq!(row.values[1], "redacted".into());
    }

    #[test]
    fn progress_hook_is_called() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let interceptors = Interceptors::new().with_progress(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        interceptors.progress(&ProgressArgs::new(SyncStage::BeginSession, SyncSide::Client, ""));
        interceptors.progress(&ProgressArgs::new(SyncStage::EndSession, SyncSide::Client, ""));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn conflict_action_resolution() {
        assert_eq!(
            ConflictAction::UsePolicy.resolve(ConflictResolutionPolicy::ClientWins),
            ConflictResolution::ClientWins
        );
        assert_eq!(
            ConflictAction::ServerWins.resolve(ConflictResolutionPolicy::ClientWins),
            ConflictResolution::ServerWins
        );
    }
}
