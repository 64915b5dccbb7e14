use std::process::ExitCode;

use clap::{Parser, Subcommand};
use salesmerge_sync::PipelineError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "salesmerge")]
#[command(about = "Merge batch CSV sales and catalog API products into one SQLite table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract both sources, normalize, and replace the destination table once.
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => match salesmerge_sync::run_pipeline_once_from_env().await {
            Ok(summary) => {
                let report = &summary.report;
                println!(
                    "run complete: run_id={} table={} rows={} rejected={} failed_sources={} reports={}",
                    summary.run_id,
                    report.table,
                    report.total_rows_loaded,
                    report.row_errors.len(),
                    report.source_failures.len(),
                    summary.reports_dir.as_deref().unwrap_or("-"),
                );
                ExitCode::SUCCESS
            }
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "pipeline run aborted");
                let code = err
                    .downcast_ref::<PipelineError>()
                    .map(PipelineError::exit_code)
                    .unwrap_or(1);
                ExitCode::from(code)
            }
        },
    }
}
