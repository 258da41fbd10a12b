// SPDX-License-Identifier: Apache-2.0

//! Command-line interface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "arbiterd", version, about = "Policy evaluation service surfaces")]
pub struct Cli {
	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
	/// Run the server with the plugins named in the configuration.
	Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	pub config: Option<PathBuf>,

	/// Override the gRPC listen address.
	#[arg(long)]
	pub addr: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn run_args_parse() {
		let cli = Cli::parse_from(["arbiterd", "run", "--config", "/etc/arbiter.yaml"]);
		let Commands::Run(args) = cli.command;
		assert_eq!(
			args.config,
			Some(PathBuf::from("/etc/arbiter.yaml"))
		);
		assert!(args.addr.is_none());
	}

	#[test]
	fn addr_override_parses() {
		let cli = Cli::parse_from(["arbiterd", "run", "--addr", "0.0.0.0:9191"]);
		let Commands::Run(args) = cli.command;
		assert_eq!(args.addr.as_deref(), Some("0.0.0.0:9191"));
	}
}
