//! bitgrab - main entry point

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bitgrab::cli::{commands, CliArgs};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(&args);
    debug!(?args, "starting");

    // ctrl-c propagates one cancellation signal to every session
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    if let Err(error) = commands::run(args.command, &cancel).await {
        // one line: the failed phase, then the underlying cause
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}

/// Logs go to stderr so stdout stays clean for command output.
fn init_logging(args: &CliArgs) {
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
