//! DRC CLI - dynamic recompiler

mod cli;
mod commands;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    let metrics_handle = if cli.metrics {
        drc::metrics::CliRecorder::new().install()
    } else {
        None
    };
    drc::metrics::init();

    let level = if cli.verbose {
        "drc=debug"
    } else if cli.silent {
        "drc=error"
    } else {
        "drc=info"
    };
    let directive = level.parse().unwrap_or_else(|_| LevelFilter::INFO.into());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = commands::run_command(&cli);

    if let Some(handle) = metrics_handle {
        handle.print_summary();
    }

    std::process::exit(exit_code);
}
