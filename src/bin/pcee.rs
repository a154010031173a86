use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use pcee::{setup_local_tracing, setup_tracing, AppResult, Node, PceeConfig};
use tokio::runtime;
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// export spans over OTLP and write a rolling log file
    #[arg(long)]
    pub otel: bool,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
    /// run the node in the configured role (default)
    Run,
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    // -v flags only apply when RUST_LOG does not say otherwise
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("conf.toml"), PathBuf::from);
    let config = PceeConfig::set_up_config(&config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = if commandline.otel {
        Some(rt.block_on(setup_tracing())?)
    } else {
        setup_local_tracing()?;
        None
    };
    info!(
        "starting pcee {} as {:?} with config {}",
        env!("CARGO_PKG_VERSION"),
        config.general.role,
        config_path.display()
    );

    Node::new(config).start(&rt)
}
