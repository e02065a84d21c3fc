//! Test fixtures: a sample schema, server and client databases, and a
//! temporary environment wiring them together in process.

use rowsync_engine::{InProcessTransport, RemoteOrchestrator, SyncAgent, SyncOptions};
use rowsync_memory::{MemoryProvider, MemoryResult};
use rowsync_protocol::{ColumnType, SyncColumn, SyncRelation, SyncSetup, SyncTable, SyncValue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Scope name used by the fixtures.
pub const SCOPE: &str = "default";

/// `customer(id INTEGER PK, name TEXT NULL, email TEXT NULL)`.
pub fn customer_table() -> SyncTable {
    SyncTable::new(
        "customer",
        vec![
            SyncColumn::new("id", ColumnType::Integer),
            SyncColumn::nullable("name", ColumnType::Text),
            SyncColumn::nullable("email", ColumnType::Text),
        ],
        vec!["id".into()],
    )
}

/// `product_category(id TEXT PK, name TEXT NULL)`.
pub fn product_category_table() -> SyncTable {
    SyncTable::new(
        "product_category",
        vec![
            SyncColumn::new("id", ColumnType::Text),
            SyncColumn::nullable("name", ColumnType::Text),
        ],
        vec!["id".into()],
    )
}

/// `product(id INTEGER PK, name TEXT NULL, category_id TEXT NULL, price REAL NULL)`.
pub fn product_table() -> SyncTable {
    SyncTable::new(
        "product",
        vec![
            SyncColumn::new("id", ColumnType::Integer),
            SyncColumn::nullable("name", ColumnType::Text),
            SyncColumn::nullable("category_id", ColumnType::Text),
            SyncColumn::nullable("price", ColumnType::Real),
        ],
        vec!["id".into()],
    )
}

/// `product.category_id -> product_category.id`.
pub fn product_category_relation() -> SyncRelation {
    SyncRelation::new(
        "fk_product_category",
        "product",
        "category_id",
        "product_category",
        "id",
    )
}

/// Setup syncing the three sample tables. The child is listed first so
/// that ordering has to come from the relation.
pub fn sample_setup() -> SyncSetup {
    SyncSetup::new(["product", "customer", "product_category"])
}

/// Creates a server database holding the sample tables and relation.
pub fn sample_server_db(name: &str) -> MemoryProvider {
    let db = MemoryProvider::new(name);
    create_sample_tables(&db).expect("failed to create sample tables");
    db
}

/// Creates the sample tables and relation in an existing database.
pub fn create_sample_tables(db: &MemoryProvider) -> MemoryResult<()> {
    db.create_table(&customer_table())?;
    db.create_table(&product_category_table())?;
    db.create_table(&product_table())?;
    db.add_relation(product_category_relation())
}

/// Inserts one row in each sample table.
pub fn seed_sample_rows(db: &MemoryProvider) -> MemoryResult<()> {
    db.upsert("product_category", category_row("BIKES", "Bikes"))?;
    db.upsert("product", product_row(1, "Road bike", Some("BIKES"), 999.0))?;
    db.upsert("customer", customer_row(1, "Ann"))
}

/// A customer row with a derived email.
pub fn customer_row(id: i64, name: &str) -> Vec<SyncValue> {
    vec![
        id.into(),
        name.into(),
        format!("{}@example.com", name.to_lowercase()).into(),
    ]
}

/// A product category row.
pub fn category_row(id: &str, name: &str) -> Vec<SyncValue> {
    vec![id.into(), name.into()]
}

/// A product row.
pub fn product_row(id: i64, name: &str, category: Option<&str>, price: f64) -> Vec<SyncValue> {
    vec![
        id.into(),
        name.into(),
        category.map_or(SyncValue::Null, SyncValue::from),
        price.into(),
    ]
}

/// Agent syncing a memory client against an in-process server.
pub type InProcessAgent = SyncAgent<MemoryProvider, InProcessTransport<MemoryProvider>>;

/// A client database and its agent.
pub struct TestClient {
    /// Client database.
    pub db: MemoryProvider,
    /// Agent for [`SCOPE`].
    pub agent: InProcessAgent,
}

/// A temporary directory, a server database and its orchestrator.
pub struct TestEnv {
    dir: TempDir,
    server_db: MemoryProvider,
    server: Arc<RemoteOrchestrator<MemoryProvider>>,
}

impl TestEnv {
    /// Creates an environment with default server options.
    pub fn new() -> Self {
        Self::with_server_options(|options| options)
    }

    /// Creates an environment, adjusting the server options.
    pub fn with_server_options(configure: impl FnOnce(SyncOptions) -> SyncOptions) -> Self {
        let dir = TempDir::new().expect("failed to create temp directory");
        let server_db = sample_server_db("server");
        let options = configure(
            SyncOptions::new(dir.path().join("server").join("batches"))
                .with_snapshots_directory(dir.path().join("server").join("snapshots")),
        );
        let server = RemoteOrchestrator::new(server_db.clone(), options)
            .expect("memory provider can act as server");

        Self {
            dir,
            server_db,
            server: Arc::new(server),
        }
    }

    /// Returns the root of the temporary directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the server database.
    pub fn server_db(&self) -> &MemoryProvider {
        &self.server_db
    }

    /// Returns the server orchestrator.
    pub fn server(&self) -> &Arc<RemoteOrchestrator<MemoryProvider>> {
        &self.server
    }

    /// Returns the batch directory of a client.
    pub fn client_batch_directory(&self, name: &str) -> PathBuf {
        self.dir.path().join(name).join("batches")
    }

    /// Returns default options for a client.
    pub fn client_options(&self, name: &str) -> SyncOptions {
        SyncOptions::new(self.client_batch_directory(name))
    }

    /// Creates an empty client syncing the sample setup in process.
    pub fn client(&self, name: &str) -> TestClient {
        self.client_with(name, |options| options)
    }

    /// Creates a client, adjusting its options.
    pub fn client_with(
        &self,
        name: &str,
        configure: impl FnOnce(SyncOptions) -> SyncOptions,
    ) -> TestClient {
        let db = MemoryProvider::new(name);
        let transport = InProcessTransport::new(Arc::clone(&self.server));
        let agent = SyncAgent::new(db.clone(), transport, configure(self.client_options(name)), SCOPE)
            .with_setup(sample_setup());
        TestClient { db, agent }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Asserts that two databases hold the same rows in a table.
pub fn assert_same_rows(a: &MemoryProvider, b: &MemoryProvider, table: &str) {
    let left = a.rows(table).expect("table missing on left database");
    let right = b.rows(table).expect("table missing on right database");
    assert_eq!(left, right, "{table} differs");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_memory::CODE_FOREIGN_KEY;

    #[test]
    fn sample_server_enforces_relation() {
        let db = sample_server_db("server");
        let err = db
            .upsert("product", product_row(1, "Orphan", Some("NONE"), 1.0))
            .unwrap_err();
        assert_eq!(err.code(), CODE_FOREIGN_KEY);

        seed_sample_rows(&db).unwrap();
        assert_eq!(db.rows("product").unwrap().len(), 1);
    }

    #[test]
    fn env_layout() {
        let env = TestEnv::new();
        let client = env.client("alice");
        assert!(env.client_batch_directory("alice").starts_with(env.path()));
        assert_eq!(client.agent.local().scope_name(), SCOPE);
        assert!(env.server().options().snapshots_directory.is_some());
    }
}
