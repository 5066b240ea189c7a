//! netkeeper - home-network appliance control plane.
//!
//! Pins a LAN interface to its current address through dhcpcd and runs the
//! filtering proxy. Each subcommand drives one operation.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use netkeeper::config::Config;
use netkeeper::proxy::ProxyController;
use netkeeper::system::{IpCommand, StaticIpConfigurator};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (default: ~/.config/netkeeper/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether an interface has a static IP in dhcpcd.conf
    HasStaticIp { interface: String },
    /// Make an interface's current address its permanent static IP
    SetStaticIp {
        interface: String,
        /// Append a block even if one already exists
        #[arg(long)]
        force: bool,
    },
    /// Show an interface's live address and default gateway
    ShowInterface { interface: String },
    /// Find which interface holds an IPv4 address
    FindInterface { ip: Ipv4Addr },
    /// Run the filtering proxy until Ctrl-C
    Proxy {
        /// Listen address, overriding the settings file
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging - use RUST_LOG env var or default to info
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    // An explicit --config must parse; the default file is best effort
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Config::load(),
    };
    let config_path = cli.config.clone().or_else(Config::path);

    let configurator = StaticIpConfigurator::with_query(config.dhcpcd_conf.clone(), IpCommand);

    match cli.command {
        Command::HasStaticIp { interface } => {
            let has_static = configurator
                .has_static_ip(&interface)
                .await
                .context("Failed to check static IP")?;
            println!("{}", has_static);
        }
        Command::SetStaticIp { interface, force } => {
            if !is_root() {
                bail!("Writing {} requires root (sudo)", config.dhcpcd_conf.display());
            }
            if !force && configurator.has_static_ip(&interface).await? {
                bail!(
                    "{} already has a static IP in {} (use --force to append another)",
                    interface,
                    config.dhcpcd_conf.display()
                );
            }
            configurator
                .set_static_ip(&interface)
                .await
                .with_context(|| format!("Failed to set static IP for {}", interface))?;
            println!("{} pinned to its current address", interface);
        }
        Command::ShowInterface { interface } => {
            let Some(record) = configurator.interface_record(&interface).await else {
                bail!("{} has no IPv4 address", interface);
            };
            println!("interface: {}", record.name);
            println!("address:   {}", record.address);
            match record.gateway {
                Some(gateway) => println!("gateway:   {}", gateway),
                None => println!("gateway:   none"),
            }
        }
        Command::FindInterface { ip } => match configurator.interface_by_ip(ip).await {
            Some(name) => println!("{}", name),
            None => bail!("No interface holds {}", ip),
        },
        Command::Proxy { listen } => run_proxy(config, config_path, listen).await?,
    }

    Ok(())
}

async fn run_proxy(mut config: Config, config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.proxy.listen_address = listen;
    }

    let mut controller =
        ProxyController::new(config.proxy.clone()).context("Failed to configure proxy")?;
    controller.start().await.context("Failed to start proxy")?;

    // Persist what was applied, not what was asked for
    config.proxy = controller.snapshot_config();
    if let Some(path) = &config_path {
        config
            .save_to(path)
            .with_context(|| format!("Failed to save settings to {}", path.display()))?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("shutting down proxy");
    controller.close().await;
    Ok(())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
