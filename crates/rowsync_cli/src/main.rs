//! rowsync CLI
//!
//! Command-line tools for rowsync reference databases.
//!
//! # Commands
//!
//! - `provision` - Create tables and provision a server scope
//! - `sync` - Run a sync session between a client and a server database
//! - `snapshot` - Write a server snapshot for new clients
//! - `cleanup` - Purge tombstones every peer has received
//! - `inspect` - Display tables, tracking tables and scopes
//! - `inspect-batch` - Display a batch directory

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use rowsync_protocol::{ConflictResolutionPolicy, SyncType};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// rowsync command-line database tools.
#[derive(Parser)]
#[command(name = "rowsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Scope name
    #[arg(global = true, short, long, default_value = "default")]
    scope: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables from a JSON file and provision the scope as a server
    Provision {
        /// JSON file with `tables`, `relations`, `rows` and `setup`
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Synchronize the database at --path with a server database
    Sync {
        /// Path to the server database directory
        #[arg(long)]
        server: PathBuf,

        /// Session type
        #[arg(short = 't', long = "type", value_enum, default_value = "normal")]
        sync_type: SyncKind,

        /// Conflict policy applied by the server
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Part size threshold in kilobytes
        #[arg(long)]
        batch_size_kb: Option<u64>,

        /// Batch serializer (json, cbor)
        #[arg(long, default_value = "json")]
        serializer: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Write a snapshot of the scope on a server database
    Snapshot,

    /// Purge tombstones every peer has received
    Cleanup {
        /// Treat the database as a server
        #[arg(long)]
        server: bool,
    },

    /// Display tables, tracking tables and scopes
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display the manifest of a batch directory
    InspectBatch {
        /// Batch directory
        directory: PathBuf,

        /// Print every row
        #[arg(short, long)]
        rows: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum SyncKind {
    Normal,
    Reinitialize,
    ReinitializeWithUpload,
}

impl From<SyncKind> for SyncType {
    fn from(kind: SyncKind) -> Self {
        match kind {
            SyncKind::Normal => SyncType::Normal,
            SyncKind::Reinitialize => SyncType::Reinitialize,
            SyncKind::ReinitializeWithUpload => SyncType::ReinitializeWithUpload,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    ServerWins,
    ClientWins,
}

impl From<PolicyArg> for ConflictResolutionPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::ServerWins => ConflictResolutionPolicy::ServerWins,
            PolicyArg::ClientWins => ConflictResolutionPolicy::ClientWins,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Provision { file } => {
            let path = cli.path.ok_or("Database path required for provision")?;
            commands::provision::run(&path, &cli.scope, &file)?;
        }
        Commands::Sync {
            server,
            sync_type,
            policy,
            batch_size_kb,
            serializer,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for sync")?;
            let args = commands::sync::SyncArgs {
                client: path,
                server,
                scope: cli.scope,
                sync_type: sync_type.into(),
                policy: policy.map(Into::into),
                batch_size_kb,
                serializer,
            };
            commands::sync::run(&args, &format)?;
        }
        Commands::Snapshot => {
            let path = cli.path.ok_or("Database path required for snapshot")?;
            commands::snapshot::run(&path, &cli.scope)?;
        }
        Commands::Cleanup { server } => {
            let path = cli.path.ok_or("Database path required for cleanup")?;
            commands::cleanup::run(&path, &cli.scope, server)?;
        }
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::InspectBatch {
            directory,
            rows,
            format,
        } => {
            commands::inspect_batch::run(&directory, rows, &format)?;
        }
        Commands::Version => {
            println!("rowsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
