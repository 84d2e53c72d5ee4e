use anyhow::Result;
use clap::Parser;
use imgcust_core::cli::{Cli, Command};
use imgcust_core::config::IsoBuildConfig;
use imgcust_core::{capacity, logging, pipeline, preflight};
use imgcust_hal::LinuxHal;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_file.as_deref());

    match cli.command {
        Command::Preflight => preflight::run()?,
        Command::Estimate { du_line } => {
            let estimate = capacity::estimate(&du_line)?;
            println!("{estimate}");
        }
        Command::LiveIso {
            image,
            config,
            build_dir,
            output_dir,
            base_name,
            skip_preflight,
        } => {
            let mut cfg = match config {
                Some(path) => IsoBuildConfig::load(&path)?,
                None => IsoBuildConfig::default(),
            };
            if let Some(dir) = build_dir {
                cfg.dirs.build_dir = dir;
            }
            if let Some(dir) = output_dir {
                cfg.dirs.output_dir = dir;
            }
            if let Some(name) = base_name {
                cfg.iso.base_name = name;
            }

            if !skip_preflight {
                preflight::run()?;
            }

            let hal = LinuxHal::new();
            let output = pipeline::create_live_iso(&hal, &cfg, &image)?;
            log::info!(
                "🎉 {} (kernel {}, release {})",
                output.iso.display(),
                output.kernel_version,
                output.release_version
            );
            println!("{}", output.iso.display());
        }
    }
    Ok(())
}
