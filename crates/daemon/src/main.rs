//! usbmuxd
//!
//! Serves the usbmux protocol on a local Unix socket and bridges client
//! connections to attached USB devices.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::setup_logging;
use daemon::config::DaemonConfig;
use daemon::service::{Daemon, install_signal_handlers};
use daemon::systemd;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbmuxd")]
#[command(author, version, about = "USB multiplexing daemon")]
#[command(long_about = "
Multiplexes client connections on a local Unix socket onto USB devices.

EXAMPLES:
    # Run with default config
    usbmuxd

    # Run with custom config
    usbmuxd --config /path/to/daemon.toml

    # Serve on a different socket with debug logging
    usbmuxd --socket /tmp/usbmuxd --log-level debug

    # Open the device at bus 1, address 7 on startup
    usbmuxd --attach 1:7

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbmuxd/daemon.toml
    3. /etc/usbmuxd/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the listening socket path
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Open a device by BUS:ADDRESS at startup (repeatable)
    #[arg(long, value_name = "BUS:ADDR", value_parser = parse_location)]
    attach: Vec<(u8, u8)>,
}

fn parse_location(s: &str) -> Result<(u8, u8)> {
    let (bus, address) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("expected BUS:ADDR, got '{}'", s))?;
    let bus = bus
        .trim()
        .parse()
        .with_context(|| format!("invalid bus number '{}'", bus))?;
    let address = address
        .trim()
        .parse()
        .with_context(|| format!("invalid device address '{}'", address))?;
    Ok((bus, address))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usbmuxd v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if let Some(socket) = args.socket {
        config.daemon.socket_path = socket;
    }

    install_signal_handlers()?;

    let mut daemon = Daemon::bind(&config).context("Failed to start daemon")?;
    for (bus, address) in args.attach {
        if let Err(e) = daemon.attach(bus, address) {
            error!("{:#}", e);
        }
    }

    if systemd::is_systemd() {
        info!("Running under systemd");
    }
    if let Err(e) = systemd::notify_ready() {
        warn!("Failed to notify systemd: {:#}", e);
    }
    let status = format!("Listening on {}", config.daemon.socket_path.display());
    if let Err(e) = systemd::notify_status(&status) {
        warn!("Failed to update systemd status: {:#}", e);
    }

    let result = daemon.run();

    if let Err(e) = systemd::notify_stopping() {
        warn!("Failed to notify systemd: {:#}", e);
    }

    match &result {
        Ok(()) => info!("usbmuxd stopped"),
        Err(e) => error!("usbmuxd failed: {:#}", e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("1:7").unwrap(), (1, 7));
        assert_eq!(parse_location(" 3 : 12 ").unwrap(), (3, 12));
        assert!(parse_location("17").is_err());
        assert!(parse_location("1:300").is_err());
        assert!(parse_location("a:b").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "usbmuxd",
            "--socket",
            "/tmp/mux",
            "--attach",
            "1:2",
            "--attach",
            "3:4",
        ])
        .unwrap();
        assert_eq!(args.socket, Some(PathBuf::from("/tmp/mux")));
        assert_eq!(args.attach, vec![(1, 2), (3, 4)]);
        assert!(!args.save_config);
    }
}
