//! Command line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Command line arguments for the sagad daemon
#[derive(Debug, Parser)]
#[command(name = "sagad", version, about = "Durable saga orchestrator daemon")]
pub struct CLIArgs {
    /// Use the <CONFIG> file instead of <WORK_DIR>/config.toml
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Use <WORK_DIR> as the work directory
    #[arg(short, long)]
    pub work_dir: Option<PathBuf>,
    /// Command to run; defaults to `start`
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// sagad commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the outbox worker pool and the acceptance API
    Start,
    /// Accept a new transfer saga and print its id
    CreateTransfer {
        /// Account to debit
        #[arg(long)]
        from: String,
        /// Account to credit
        #[arg(long)]
        to: String,
        /// Transfer amount in minor units
        #[arg(long)]
        amount: i64,
    },
    /// Load a saga by id and drive it inline (stuck-saga remediation)
    Resume {
        /// Saga id
        saga_id: Uuid,
    },
}
