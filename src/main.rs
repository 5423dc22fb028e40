//! nmprobe — echo server and latency probe for the netmgr transport
//! layer.
//!
//! Stands up UDP / TCP / DNS-framed-TCP / TLS echo listeners from a TOML
//! config, or runs a timed echo round-trip benchmark against its own
//! loopback listeners. Run `nmprobe --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod config;
mod serve;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::ProbeConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Serve => {
            let config = config::ProbeConfig::load(&cli.config)?;
            serve::run(&config)?;
        }
        Commands::Bench {
            duration,
            payload,
            workers,
            output,
        } => {
            bench::run(workers, duration, payload, output)?;
        }
    }

    Ok(())
}
