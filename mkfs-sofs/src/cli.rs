use std::path::PathBuf;

use clap::Parser;

/// Install a SOFS14 file system on a regular file or block device.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Volume name
	#[arg(short, long, default_value = "SOFS14")]
	pub name: String,

	/// Number of inodes (default: one per eight blocks, rounded to fill
	/// whole table blocks)
	#[arg(short, long)]
	pub inodes: Option<u32>,

	/// Suppress progress messages
	#[arg(short)]
	pub quiet: bool,

	/// Zero-fill every free data cluster
	#[arg(short)]
	pub zero: bool,

	/// More log output (-v, -vv, -vvv)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Path to the device
	pub device: PathBuf,
}

impl Cli {
	pub fn log_level(&self) -> log::LevelFilter {
		match self.verbose {
			0 => log::LevelFilter::Warn,
			1 => log::LevelFilter::Info,
			2 => log::LevelFilter::Debug,
			_ => log::LevelFilter::Trace,
		}
	}
}
