//! Schema resolution: turns a setup into a dependency-ordered schema by
//! asking the store what each table looks like.

use crate::error::{SyncError, SyncResult};
use crate::provider::SyncProvider;
use crate::sorter::sort_tables;
use rowsync_protocol::{SyncRelation, SyncSchema, SyncSetup, SyncTable};

/// Resolves the schema of a setup.
///
/// Every table must exist and have a primary key; every requested column
/// must exist. Primary key columns are always synced even when the setup
/// restricts columns. Relations pointing outside the setup are dropped.
pub fn resolve_schema<P>(
    provider: &P,
    conn: &mut P::Connection,
    setup: &SyncSetup,
) -> SyncResult<SyncSchema>
where
    P: SyncProvider + ?Sized,
{
    let mut tables = Vec::with_capacity(setup.tables.len());
    let mut relations: Vec<SyncRelation> = Vec::new();

    for setup_table in &setup.tables {
        let stub = SyncTable::named(&setup_table.name);
        let builder = provider.table_builder(&stub, setup);

        if !builder.exists(conn)? {
            return Err(SyncError::MissingTable {
                table: setup_table.name.clone(),
            });
        }

        let columns = builder.columns(conn)?;
        let primary_keys = builder.primary_keys(conn)?;
        if primary_keys.is_empty() {
            return Err(SyncError::MissingPrimaryKey {
                table: setup_table.name.clone(),
            });
        }

        for requested in &setup_table.columns {
            if !columns.iter().any(|c| &c.name == requested) {
                return Err(SyncError::MissingColumn {
                    table: setup_table.name.clone(),
                    column: requested.clone(),
                });
            }
        }

        let selected = columns
            .into_iter()
            .filter(|c| {
                setup_table.columns.is_empty()
                    || setup_table.columns.contains(&c.name)
                    || primary_keys.contains(&c.name)
            })
            .collect();

        let mut table = SyncTable::new(&setup_table.name, selected, primary_keys);
        table.direction = setup_table.direction;

        relations.extend(builder.relations(conn)?);
        tables.push(table);
    }

    relations.retain(|r| {
        setup.table(&r.child_table).is_some() && setup.table(&r.parent_table).is_some()
    });

    let tables = sort_tables(tables, &relations);
    tracing::debug!(
        tables = tables.len(),
        relations = relations.len(),
        "schema resolved"
    );

    Ok(SyncSchema::new(tables, relations))
}
