use anyhow::{Context, Result};
use clap::Parser;
use rsofs::mkfs;

use crate::cli::Cli;

mod cli;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder().filter_level(cli.log_level()).init();

	let opts = mkfs::Options {
		name:   cli.name.clone(),
		inodes: cli.inodes,
		zero:   cli.zero,
	};

	if !cli.quiet {
		println!(
			"Installing a SOFS14 file system in {} ...",
			cli.device.display()
		);
	}

	let geo = mkfs::mkfs(&cli.device, &opts)
		.with_context(|| format!("formatting {} failed", cli.device.display()))?;

	if !cli.quiet {
		println!(
			"{} blocks: 1 superblock, {} inode table blocks ({} inodes), {} data clusters.",
			geo.n_total, geo.itable_size, geo.i_total, geo.dzone_total
		);
		println!("Formatting concluded.");
	}

	Ok(())
}
