// src/cli.rs - Global configuration and command definition

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "BSQ DAO consensus node", long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "bsq-dao.toml")]
    pub config: String,

    /// Path to the database directory. Overrides `node.db_path`.
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parses every block available in a directory and exits.
    Replay {
        /// Directory holding `<height>.json` raw blocks. Defaults to `node.blocks_dir`.
        #[arg(long)]
        blocks_dir: Option<String>,
    },
    /// Keeps polling a block directory and parses new blocks as they appear.
    Follow {
        #[arg(long)]
        blocks_dir: Option<String>,
        /// Poll interval in seconds. Defaults to `node.poll_interval_secs`.
        #[arg(long)]
        poll_secs: Option<u64>,
    },
    /// Prints the state restored from the latest snapshot.
    Status,
}
