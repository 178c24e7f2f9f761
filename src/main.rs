//! CLI entry point for segfetch.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use segfetch::DownloadOptions;
use tracing::{debug, info};

mod app_config;
mod cli;
mod fixture;

use cli::{Args, Command, ReplayArgs};
use fixture::Fixture;

fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = app_config::load(args.config.as_deref())?;
    match args.command {
        Command::Replay(replay) => run_replay(&replay, file_config.as_ref()),
    }
}

fn run_replay(args: &ReplayArgs, file_config: Option<&app_config::FileConfig>) -> Result<ExitCode> {
    let options = resolve_options(args, file_config)?;
    let fixture = Fixture::load(&args.fixture)?;
    info!(
        fixture = %args.fixture.display(),
        downloads = fixture.downloads.len(),
        dir = %options.dir.display(),
        "replaying fixture"
    );

    let mut engine = fixture.into_engine(options)?;
    let report = engine.run();
    for line in fixture::summary(&engine) {
        println!("{line}");
    }
    info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        steps = report.steps,
        "replay finished"
    );

    Ok(if report.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// CLI flag > config file > default.
fn resolve_options(
    args: &ReplayArgs,
    file_config: Option<&app_config::FileConfig>,
) -> Result<DownloadOptions> {
    let mut options = DownloadOptions::default();
    if let Some(file_config) = file_config {
        file_config.apply(&mut options);
    }
    if let Some(dir) = &args.dir {
        options.dir.clone_from(dir);
    }
    if args.pipelining {
        options.enable_pipelining = true;
    }
    if args.multi_host {
        options.single_host_multi_connection = true;
    }
    if args.allow_overwrite {
        options.allow_overwrite = true;
    }
    options.validate().context("Invalid download options")?;
    Ok(options)
}
