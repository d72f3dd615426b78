//! Entry point for the `cartage` command-line interface.
#![forbid(unsafe_code)]

use cartage_cli::CliError;
use clap::error::ErrorKind;
use tracing_subscriber::EnvFilter;

fn main() {
    init_logging();
    match cartage_cli::run() {
        Ok(()) => {}
        Err(CliError::ArgumentParsing(err))
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            err.exit()
        }
        Err(err) => {
            report(&err);
            std::process::exit(1);
        }
    }
}

#[expect(clippy::print_stderr, reason = "fatal errors are reported on stderr")]
fn report(err: &CliError) {
    eprintln!("cartage: {err}");
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
