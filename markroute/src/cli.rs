use clap::Parser;

use std::path::PathBuf;

use markroute_lib::config;

/// Dynamic policy-based routing daemon - steers DNS-observed destinations
/// through selected egress interfaces via a marked routing table
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Runtime configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH
    )]
    pub config: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}
