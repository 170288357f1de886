mod cart;
mod config;
mod device;
mod dispatcher;
mod mount;
mod trust;

use anyhow::{anyhow, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cart::Identity;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::dispatcher::EventDispatcher;

fn print_help() {
    println!(
        "\
cartd v{}

Watches for SD cards and runs the signed cart.yaml payload found on them.

USAGE:
    cartd [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH},
                   built-in defaults if absent]

OPTIONS:
    -u, --user <NAME>    Run exec commands as this user
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    RUST_LOG    Log level filter for tracing
                (e.g. debug, cartd=debug,warn)

EXAMPLES:
    cartd                                # defaults, payloads run as root
    cartd --user pi                      # payloads run as 'pi'
    cartd /etc/cartd/kiosk.toml          # custom config path
    RUST_LOG=debug cartd                 # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line.
#[derive(Debug, Default, PartialEq)]
struct Cli {
    user: Option<String>,
    config_path: Option<String>,
}

enum Parsed {
    Run(Cli),
    Help,
    Version,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Parsed> {
    let mut cli = Cli::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Parsed::Help),
            "--version" | "-V" => return Ok(Parsed::Version),
            "--user" | "-u" => {
                let name = args
                    .next()
                    .ok_or_else(|| anyhow!("{arg} requires a user name"))?;
                cli.user = Some(name);
            }
            _ if arg.starts_with("--user=") => {
                cli.user = Some(arg["--user=".len()..].to_string());
            }
            _ if arg.starts_with('-') => return Err(anyhow!("unknown option: {arg}")),
            _ if cli.config_path.is_none() => cli.config_path = Some(arg.clone()),
            _ => return Err(anyhow!("unexpected argument: {arg}")),
        }
    }

    if cli.user.as_deref() == Some("") {
        return Err(anyhow!("--user requires a user name"));
    }
    Ok(Parsed::Run(cli))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(Parsed::Run(cli)) => cli,
        Ok(Parsed::Help) => {
            print_help();
            std::process::exit(0);
        }
        Ok(Parsed::Version) => {
            println!("cartd v{}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("cartd: {e}\n");
            print_help();
            std::process::exit(2);
        }
    };

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cartd=info")),
        )
        .init();

    info!("cartd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_or_default(cli.config_path.as_deref())?;
    if cli.user.is_some() {
        config.supervisor.run_as_user = cli.user;
    }

    info!("Trusted signers: {}", config.trust.allowed_signers.display());
    info!(
        "Signature namespace: {} (identity {})",
        config.trust.namespace,
        config.trust.identity()
    );
    if !config.trust.allowed_signers.exists() {
        warn!("Trusted signer store missing, every cart will be refused");
    }
    // Checked again at every spawn; this only surfaces typos early
    if let Some(user) = &config.supervisor.run_as_user {
        if let Err(e) = Identity::lookup(user) {
            warn!("{e}; carts will not start until the account exists");
        }
    }

    let events = device::monitor::subscribe()?;
    let mut dispatcher = EventDispatcher::from_config(&config);
    let mut sigterm = signal(SignalKind::terminate())?;

    let result = tokio::select! {
        result = dispatcher.run(events) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, stopping...");
            Ok(())
        }
    };

    // Payloads never outlive the daemon, whichever way the loop ended
    dispatcher.shutdown().await;

    if let Err(e) = &result {
        error!("{e}");
    }
    result
}
