//! CLI argument parsing for imgcust.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "imgcust")]
#[command(about = "Convert a provisioned disk image into a bootable live ISO")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Verify required host tools and privileges
    Preflight,

    /// Build a live ISO from a raw disk image
    LiveIso {
        /// Raw disk image with a partition table
        #[arg(long)]
        image: PathBuf,

        /// TOML build configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Overrides `dirs.build_dir`
        #[arg(long)]
        build_dir: Option<PathBuf>,

        /// Overrides `dirs.output_dir`
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Overrides `iso.base_name`
        #[arg(long)]
        base_name: Option<String>,

        /// Skip the preflight checks
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Print the allocation size for a line of `du` output (e.g. "421M\t/path")
    Estimate {
        du_line: String,
    },
}
