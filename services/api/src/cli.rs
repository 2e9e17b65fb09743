use crate::demo::{run_demo, DemoArgs};
use crate::server;
use crate::sweep::{run_sweep, SweepArgs};
use clap::{Args, Parser, Subcommand};
use transport_enrollment::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "Transport Enrollment",
    about = "Run and operate the guardian transport enrollment service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Remove pending enrollment forms older than the retention window.
    /// Runs against the snapshot offline; while `serve` holds it, use POST /api/v1/admin/sweep
    Sweep(SweepArgs),
    /// Walk through submission, approval and expiry against an in-memory store
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Sweep(args) => run_sweep(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}
