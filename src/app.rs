use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use log::{info, LevelFilter};

use crate::config::io::ConfigIO;
use crate::config::types::{Config, ConfigStore};
use crate::device::btle::BtleRadio;
use crate::device::constants::{flat_panel_service_uuid, CONNECT_TIMEOUT, PAIRING_SCAN_DURATION};
use crate::device::scanner::{CandidateList, Scanner};
use crate::device::transport::Radio;
use crate::device::types::BluetoothAddress;
use crate::error::AppRunError;
use crate::init_logging;
use crate::panel::controller::FlatPanel;
use crate::sim::radio::{SimRadio, SIM_ADDRESS};

#[derive(Parser, Debug)]
#[command(name = "wireless-flat-panel", version)]
#[command(about = "Control a bluetooth flat panel used for astrophotography calibration frames")]
pub struct Args {
    /// Log debug output, regardless of the trace setting
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Talk to a simulated panel instead of bluetooth hardware
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// How long to wait for the paired panel to show up, e.g. "15s"
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List the flat panels in range
    Scan {
        /// How long to listen, e.g. "10s"
        #[arg(short, long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
    /// Remember the panel to connect to
    Pair {
        /// Address as printed by `scan`
        address: BluetoothAddress,
    },
    /// Forget the paired panel
    Unpair,
    /// Enable or disable debug logging
    Trace {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Print the configuration
    Show,
    /// Switch the panel on
    On {
        #[arg(allow_negative_numbers = true)]
        level: i32,
    },
    /// Switch the panel off
    Off,
    /// Print the connection and brightness of the panel
    Status,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

pub fn log_level(verbose: bool, trace_enabled: bool) -> LevelFilter {
    if verbose || trace_enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    }
}

pub async fn run(args: Args) -> Result<(), AppRunError> {
    let config_io = match &args.config {
        Some(path) => ConfigIO::open(path)?,
        None => ConfigIO::new_sync()?,
    };
    // only one instance may talk to the panel
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    let mut config = config_io.read().await?;
    init_logging(log_level(args.verbose, config.trace_enabled()))?;
    info!("Wireless Flat Panel {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Pair { address } => {
            config.set_paired_address(address);
            config_io.save(&config).await?;
            println!("Paired with {}", address);
        },
        Command::Unpair => {
            config.set_paired_address(BluetoothAddress::UNPAIRED);
            config_io.save(&config).await?;
            println!("No longer paired");
        },
        Command::Trace { state } => {
            config.set_trace_enabled(state == Toggle::On);
            config_io.save(&config).await?;
            println!("Trace logging {}", if config.trace_enabled() { "enabled" } else { "disabled" });
        },
        Command::Show => {
            println!("Config file: {}", config_io.path().to_string_lossy());
            print_config(&config);
        },
        command => {
            let timeout = args.timeout.unwrap_or(CONNECT_TIMEOUT);
            if args.simulate {
                // the simulated panel stands in for whatever is paired
                config.set_paired_address(SIM_ADDRESS);
                run_device_command(Arc::new(SimRadio::demo()), command, &config, timeout).await?;
            } else {
                let radio = BtleRadio::new().await?;
                run_device_command(Arc::new(radio), command, &config, timeout).await?;
            }
        },
    }

    Ok(())
}

fn print_config(config: &Config) {
    if config.paired_address().is_unpaired() {
        println!("Paired device: none");
    } else {
        println!("Paired device: {}", config.paired_address());
    }
    println!("Trace logging: {}", if config.trace_enabled() { "on" } else { "off" });
}

async fn run_device_command<R: Radio>(radio: Arc<R>, command: Command, config: &Config, timeout: Duration) -> Result<(), AppRunError> {
    if let Command::Scan { duration } = command {
        let list = scan(radio, duration.unwrap_or(PAIRING_SCAN_DURATION), config.paired_address()).await?;
        if list.is_empty() {
            println!("No flat panels found");
        }
        return Ok(());
    }

    let panel = FlatPanel::new(radio).with_connect_timeout(timeout);
    panel.connect_paired(config).await?;

    let result = match command {
        Command::On { level } => panel.set_brightness(level).await
            .map(|_| println!("Brightness set to {}", panel.current_brightness())),
        Command::Off => panel.turn_off().await
            .map(|_| println!("Panel switched off")),
        Command::Status => {
            println!("{}", panel.driver_info());
            println!("State: {}", panel.connection_state());
            println!("Brightness (cached): {} of {}", panel.current_brightness(), panel.max_brightness());
            panel.device_brightness().await
                .map(|level| println!("Brightness (device): {}", level))
        },
        _ => Ok(()),
    };

    panel.disconnect().await;
    Ok(result?)
}

/// Prints every flat panel in range once, in the order they were first seen.
pub async fn scan<R: Radio>(radio: Arc<R>, duration: Duration, paired: BluetoothAddress) -> Result<CandidateList, AppRunError> {
    let scanner = Scanner::new(radio);
    let mut candidates = scanner.start_scan(flat_panel_service_uuid()).await?;
    let mut list = CandidateList::new();

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            candidate = candidates.next() => match candidate {
                Some(candidate) => {
                    let address = candidate.address;
                    let name = candidate.local_name.clone().unwrap_or_default();
                    if list.insert(candidate) {
                        let marker = if address == paired { " (paired)" } else { "" };
                        println!("{} {}{}", address, name, marker);
                    }
                },
                None => break,
            },
        }
    }

    drop(candidates);
    scanner.stop_scan().await?;
    Ok(list)
}
