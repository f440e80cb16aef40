use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod config;
mod error;
mod rpc;
mod service;
mod tooling;
mod ui;
mod utils;
mod volume;

use commands::{ctl, serve};
use config::Config;

pub struct AppCtx {
    pub cfg: Config,
    pub container: bool,
    pub lvm_path: String,
}

#[derive(Parser, Debug)]
#[command(
    name = "lvmd",
    about = "Volume-group and logical-volume management daemon for LVM",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    /// Run lvm in the host namespaces (for use inside a container).
    #[arg(long, global = true)]
    container: bool,

    #[arg(long, default_value = tooling::lvm::DEFAULT_LVM_PATH, global = true)]
    lvm_path: String,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the daemon (default).
    Serve,
    Ctl(ctl::CtlArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(debug: bool, format: LogFormat) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug);
    let _ = match format {
        LogFormat::Text => builder.without_time().try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log_format);

    if let Some(Cmd::Ctl(args)) = &cli.command {
        return args.run(&cli.config);
    }

    let cfg = Config::load(&cli.config)?;
    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_toml()?);
        return Ok(());
    }

    serve::run(AppCtx {
        cfg,
        container: cli.container,
        lvm_path: cli.lvm_path,
    })
}
