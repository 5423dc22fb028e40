//! CLI definitions for nmprobe.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "nmprobe",
    version,
    about = "Echo server and latency probe for the netmgr transport layer",
    long_about = None
)]
pub struct Cli {
    /// Path to nmprobe.toml config file
    #[clap(long, short, default_value = "nmprobe.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the echo listeners described in the config until killed
    Serve,

    /// Run a timed echo round-trip benchmark and output a JSON report
    Bench {
        /// How many seconds to run each transport
        #[clap(long, default_value = "10")]
        duration: u64,

        /// Payload size in bytes per message
        #[clap(long, default_value = "64")]
        payload: usize,

        /// Worker threads for the benchmark manager
        #[clap(long, default_value = "2")]
        workers: usize,

        /// Write the JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Print an example nmprobe.toml to stdout
    Init,
}
