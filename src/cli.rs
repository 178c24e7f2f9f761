//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Segmented, resumable HTTP downloads driven by a response dispatcher.
#[derive(Parser, Debug)]
#[command(name = "segfetch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/segfetch/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a scripted server exchange through the engine
    Replay(ReplayArgs),
}

#[derive(clap::Args, Debug)]
pub struct ReplayArgs {
    /// JSON fixture describing downloads and scripted connections
    pub fixture: PathBuf,

    /// Output directory
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Pipeline requests on persistent connections
    #[arg(long)]
    pub pipelining: bool,

    /// Allow several connections per host for one download
    #[arg(long)]
    pub multi_host: bool,

    /// Overwrite existing files instead of renaming or failing
    #[arg(long)]
    pub allow_overwrite: bool,
}
