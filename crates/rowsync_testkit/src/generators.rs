//! Property-based test generators using proptest.

use crate::fixtures::customer_row;
use proptest::prelude::*;
use rowsync_memory::{MemoryProvider, MemoryResult};
use rowsync_protocol::{ConflictResolutionPolicy, SyncValue};

/// Strategy for scalar column values.
pub fn sync_value_strategy() -> impl Strategy<Value = SyncValue> {
    prop_oneof![
        Just(SyncValue::Null),
        any::<bool>().prop_map(SyncValue::Bool),
        any::<i64>().prop_map(SyncValue::Integer),
        (-1.0e9f64..1.0e9).prop_map(SyncValue::Real),
        "[a-zA-Z0-9 ]{0,24}".prop_map(SyncValue::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(SyncValue::Bytes),
    ]
}

/// Strategy for customer names.
pub fn customer_name_strategy() -> impl Strategy<Value = String> {
    "[A-Z][a-z]{1,8}"
}

/// Strategy for the two deterministic conflict policies.
pub fn policy_strategy() -> impl Strategy<Value = ConflictResolutionPolicy> {
    prop_oneof![
        Just(ConflictResolutionPolicy::ServerWins),
        Just(ConflictResolutionPolicy::ClientWins),
    ]
}

/// One write against the `customer` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOp {
    /// Insert or update a customer.
    Upsert {
        /// Customer id.
        id: i64,
        /// Customer name.
        name: String,
    },
    /// Delete a customer; a no-op if it does not exist.
    Delete {
        /// Customer id.
        id: i64,
    },
}

/// Strategy for a sequence of customer writes over ids `1..=max_id`.
pub fn row_ops_strategy(max_id: i64, max_len: usize) -> impl Strategy<Value = Vec<RowOp>> {
    let op = prop_oneof![
        3 => (1..=max_id, customer_name_strategy()).prop_map(|(id, name)| RowOp::Upsert { id, name }),
        1 => (1..=max_id).prop_map(|id| RowOp::Delete { id }),
    ];
    prop::collection::vec(op, 0..max_len)
}

/// Applies customer writes to a database, each in its own transaction.
pub fn apply_ops(db: &MemoryProvider, ops: &[RowOp]) -> MemoryResult<()> {
    for op in ops {
        match op {
            RowOp::Upsert { id, name } => db.upsert("customer", customer_row(*id, name))?,
            RowOp::Delete { id } => {
                db.delete("customer", &[SyncValue::Integer(*id)])?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_server_db;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn ops_stay_in_id_range(ops in row_ops_strategy(5, 20)) {
            for op in &ops {
                let id = match op {
                    RowOp::Upsert { id, .. } | RowOp::Delete { id } => *id,
                };
                prop_assert!((1..=5).contains(&id));
            }
        }

        #[test]
        fn applied_ops_leave_at_most_max_rows(ops in row_ops_strategy(4, 30)) {
            let db = sample_server_db("db");
            apply_ops(&db, &ops).unwrap();
            prop_assert!(db.rows("customer").unwrap().len() <= 4);
        }
    }
}
