//! Finality Provider Daemon
//!
//! Usage:
//!   fpd start --config fpd.toml
//!   fpd dump-config > fpd.toml

use clap::{Parser, Subcommand};
use fpd_service::FpdConfig;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod start;

use start::StartArgs;

/// Finality provider daemon
#[derive(Debug, Parser)]
#[command(name = "fpd", version)]
#[command(about = "Commits public randomness and casts EOTS finality votes")]
struct Cli {
    /// Log filter directive, e.g. `info` or `fpd::submitter=debug`
    #[arg(long, global = true, env = "FPD_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a finality provider against the in-process devnet chain
    Start(StartArgs),
    /// Print the default configuration as TOML
    DumpConfig,
}

fn init_tracing(filter: &str) -> eyre::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(filter)?)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn run(cli: Cli) -> eyre::Result<()> {
    match cli.command {
        Command::Start(args) => {
            init_tracing(&cli.log_level)?;
            tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(args.run())
        }
        Command::DumpConfig => {
            print!("{}", FpdConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
