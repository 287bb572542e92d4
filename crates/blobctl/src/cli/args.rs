pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "blobctl")]
#[command(about = "Inspect and feed a local deduplicating blob store")]
pub struct Args {
    /// Path to the TOML configuration (defaults to ./blobctl.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
