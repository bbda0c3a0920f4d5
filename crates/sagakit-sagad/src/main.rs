//! SAGAD entry point

use anyhow::Result;
use clap::Parser;
use sagakit_sagad::cli::{CLIArgs, Command};
use sagakit_sagad::config::Settings;
use sagakit_sagad::{
    get_work_directory, run_create_transfer, run_resume, run_start, setup_tracing,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CLIArgs::parse();

    let work_dir = get_work_directory(&args).await?;
    let settings = Settings::new(args.config.clone(), &work_dir)?;

    setup_tracing(settings.info.log_filter.as_deref());

    match args.command.unwrap_or(Command::Start) {
        Command::Start => run_start(work_dir, settings).await,
        Command::CreateTransfer { from, to, amount } => {
            run_create_transfer(work_dir, settings, from, to, amount).await
        }
        Command::Resume { saga_id } => run_resume(work_dir, settings, saga_id).await,
    }
}
