use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tokio::{runtime::Builder, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use trafficgen::{
    config::{self, Config},
    runner::{self, Report, Runner},
    session::TcpConnector,
};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid trafficgen config: {0}")]
    Config(#[from] config::Error),
    #[error("Trafficgen run failed: {0}")]
    Runner(#[from] runner::Error),
    #[error("Config has no agent address, set `addr`")]
    MissingAddr,
}

fn default_config_path() -> String {
    "/etc/trafficgen/trafficgen.yaml".to_string()
}

fn default_label() -> String {
    "trafficgen".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session against the configured agent
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// label attached to this run's logs and metrics
    #[clap(long, default_value_t = default_label())]
    label: String,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn validate_config(config_path: &Path) -> Result<Config, Error> {
    let config = Config::from_path(config_path).map_err(|err| {
        error!("Could not load config file '{}': {err}", config_path.display());
        err
    })?;
    config.plan()?;
    info!("Configuration file is valid");
    Ok(config)
}

async fn inner_main(config: Config, label: String) -> Result<Report, Error> {
    let addr = config.addr.clone().ok_or(Error::MissingAddr)?;
    let runner = Runner::new(TcpConnector::new(addr), &config)?;

    let (watcher, broadcaster) = trafficgen_signal::signal();
    // Dropping the broadcaster cancels the run, so it is held even when
    // ctrl-c cannot be listened for.
    let ctrl_c = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c");
                broadcaster.signal();
            }
            Err(err) => {
                error!("Unable to listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
                drop(broadcaster);
            }
        }
    });

    let res = runner.run(watcher, &label).await;
    ctrl_c.abort();
    Ok(res?)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting trafficgen {version} run.");

    let args = match Cli::try_parse() {
        Ok(cli) => match cli.command {
            Commands::Run(run_cmd) => run_cmd,
            Commands::ConfigCheck(config_check_cmd) => {
                match validate_config(&PathBuf::from(config_check_cmd.config_path)) {
                    Ok(_) => std::process::exit(0),
                    Err(_) => std::process::exit(1),
                }
            }
        },
        Err(err) => err.exit(),
    };

    let config = validate_config(&PathBuf::from(&args.config_path))?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, args.label));
    runtime.shutdown_background();

    let report = res?;
    info!(
        "Sent {sent} bytes and received {rcvd} bytes in {elapsed:?}. Bye. :)",
        sent = report.bytes_written,
        rcvd = report.bytes_read,
        elapsed = report.elapsed,
    );
    Ok(())
}
