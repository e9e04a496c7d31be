//! CLI Entry Point for cellsim
//!
//! Provides command-line interface for:
//! - Listing serial ports and finding the cell simulator among them
//! - Sending one command and printing the reply
//! - An interactive command shell
//! - A voltage demo (uniform 3.5 V, then a 1 V to 4 V ramp across channels)
//!
//! # Usage
//!
//! ```bash
//! cellsim discover --all
//! cellsim --port /dev/ttyACM0 send "GETV 3"
//! cellsim --mock shell
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use cellsim::config::{CellSimConfig, DEFAULT_CONFIG_PATH};
use cellsim::discovery::{DeviceDiscovery, ProbeResult};
use cellsim::logging::{OutputFormat, TracingConfig};
use cellsim::mock::{MockCellSim, MockEndpoint, MockOpener};
use cellsim::protocol::Response;
use cellsim::serial::{LinkId, LinkOpener};
use cellsim::{logging, CellSim, CellSimError, CommandClient};

#[derive(Parser)]
#[command(name = "cellsim")]
#[command(about = "Host-side control of the multi-channel cell simulator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port of the instrument (discovered automatically if omitted)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate override
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Talk to the built-in simulator instead of hardware
    #[arg(long, global = true)]
    mock: bool,

    /// Log rendering: pretty, compact or json (overrides the config file)
    #[arg(long, global = true, value_parser = OutputFormat::parse)]
    log_format: Option<OutputFormat>,

    /// Log span open/close events (per-command timing)
    #[arg(long, global = true)]
    log_spans: bool,

    /// Disable coloured log output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports on this host
    Ports,

    /// Find the port hosting the cell simulator
    Discover {
        /// Probe every port and print each result
        #[arg(long)]
        all: bool,
    },

    /// Send one command and print the reply
    Send {
        /// Command text, e.g. "SETV 1 3.7"
        command: String,
    },

    /// Interactive command shell (`exit` or `quit` to leave)
    Shell,

    /// Set all cells to 3.5 V, then ramp 1 V to 4 V across the channels
    Demo,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CellSimConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(baud) = cli.baud {
        config.link.baud_rate = baud;
    }
    config.validate()?;

    let mut tracing_config = TracingConfig::from_config(&config)?
        .with_span_events(cli.log_spans)
        .with_ansi(!cli.no_color);
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    logging::init(tracing_config)?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Discover { all } => discover(&cli, &config, all).await,
        Commands::Send { ref command } => {
            let mut cellsim = connect(&cli, &config).await?;
            let result = cellsim.raw(command).await;
            cellsim.close().await?;
            print_response(&result?);
            Ok(())
        }
        Commands::Shell => shell(connect(&cli, &config).await?).await,
        Commands::Demo => demo(connect(&cli, &config).await?).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = cellsim::serial::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    anyhow::bail!("built without serial support (feature `instrument_serial`)")
}

/// Candidates and opener for discovery. In mock mode a few simulated ports
/// stand in for the host's, one of them hosting the simulator.
fn candidates(cli: &Cli, config: &CellSimConfig) -> Result<(Arc<dyn LinkOpener>, Vec<LinkId>)> {
    if cli.mock {
        let opener = MockOpener::new()
            .with_endpoint("mock/ttyS0", MockEndpoint::Silent)
            .with_endpoint(
                "mock/ttyUSB0",
                MockEndpoint::Foreign("GPS ready".to_string()),
            )
            .with_endpoint(
                "mock/ttyACM0",
                MockEndpoint::CellSim(MockCellSim::with_channels(config.device.channel_count)),
            )
            .with_endpoint(
                "mock/ttyACM1",
                MockEndpoint::Unavailable("Device or resource busy".to_string()),
            );
        let ids = ["mock/ttyS0", "mock/ttyUSB0", "mock/ttyACM0", "mock/ttyACM1"]
            .into_iter()
            .map(LinkId::from)
            .collect();
        return Ok((Arc::new(opener), ids));
    }
    serial_candidates(cli, config)
}

#[cfg(feature = "instrument_serial")]
fn serial_candidates(
    cli: &Cli,
    config: &CellSimConfig,
) -> Result<(Arc<dyn LinkOpener>, Vec<LinkId>)> {
    use cellsim::serial::SerialOpener;

    let ids = match &cli.port {
        Some(port) => vec![LinkId::from(port.as_str())],
        None => cellsim::serial::available_ports()?,
    };
    Ok((Arc::new(SerialOpener::from_config(&config.link)), ids))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_candidates(
    _cli: &Cli,
    _config: &CellSimConfig,
) -> Result<(Arc<dyn LinkOpener>, Vec<LinkId>)> {
    anyhow::bail!("built without serial support (feature `instrument_serial`); use --mock")
}

async fn discover(cli: &Cli, config: &CellSimConfig, all: bool) -> Result<()> {
    let (opener, ids) = candidates(cli, config)?;
    let discovery = DeviceDiscovery::from_config(opener, config)?;

    if all {
        for report in discovery.discover_reports(ids).await {
            match report.result {
                ProbeResult::Matched(_) => println!("{}: cell simulator", report.link),
                ProbeResult::NotMatched => println!("{}: no match", report.link),
                ProbeResult::Failed(reason) => println!("{}: failed ({})", report.link, reason),
            }
        }
        return Ok(());
    }

    match discovery.discover(ids).await {
        Some(link) => {
            println!("{}", link);
            Ok(())
        }
        None => Err(CellSimError::DeviceNotFound.into()),
    }
}

/// Open the instrument: simulator, explicit port, or discovery.
async fn connect(cli: &Cli, config: &CellSimConfig) -> Result<CellSim> {
    if cli.mock {
        let sim = MockCellSim::with_channels(config.device.channel_count);
        let client = CommandClient::new(sim.connect("mock"), config.client.clone());
        return Ok(CellSim::new(client, &config.device));
    }
    connect_serial(cli, config).await
}

#[cfg(feature = "instrument_serial")]
async fn connect_serial(cli: &Cli, config: &CellSimConfig) -> Result<CellSim> {
    use cellsim::serial::SerialOpener;

    let port = match &cli.port {
        Some(port) => LinkId::from(port.as_str()),
        None => {
            let opener = Arc::new(SerialOpener::from_config(&config.link));
            DeviceDiscovery::from_config(opener, config)?
                .discover_serial_ports()
                .await?
                .ok_or(CellSimError::DeviceNotFound)?
        }
    };

    let cellsim = CellSim::open_serial(port.as_str(), config)
        .await
        .with_context(|| format!("opening {}", port))?;
    Ok(cellsim)
}

#[cfg(not(feature = "instrument_serial"))]
async fn connect_serial(_cli: &Cli, _config: &CellSimConfig) -> Result<CellSim> {
    anyhow::bail!("built without serial support (feature `instrument_serial`); use --mock")
}

fn print_response(response: &Response) {
    if response.is_empty() {
        println!("(no response)");
    }
    for line in response.to_text_lines() {
        println!("{}", line);
    }
}

async fn shell(mut cellsim: CellSim) -> Result<()> {
    println!("Connected to {}", cellsim.client_mut().link_id());
    println!("Enter commands (e.g., SETV 1 3.7, GETV 1, ENABLE_OUTPUT 1, ENABLE_DMM 1, DISABLE_DMM):");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b">> ").await?;
        stdout.flush().await?;

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }
        if line.is_empty() {
            continue;
        }

        match cellsim.raw(line).await {
            Ok(response) => print_response(&response),
            Err(e @ CellSimError::InvalidCommand(_)) => eprintln!("{}", e),
            Err(e) => {
                eprintln!("Link error: {}", e);
                break;
            }
        }
    }

    cellsim.close().await?;
    println!("Serial connection closed.");
    Ok(())
}

async fn demo(mut cellsim: CellSim) -> Result<()> {
    println!("Setting all voltages to 3.5V...");
    cellsim.set_all_voltages(3.5).await?;
    println!("Voltages: {:?}", cellsim.get_all_voltages().await?);

    println!();
    println!("Setting rainbow voltage pattern...");
    let channels = cellsim.channel_count();
    let span = f64::from(channels.saturating_sub(1).max(1));
    for ch in 1..=channels {
        let voltage = 1.0 + 3.0 * f64::from(ch - 1) / span;
        cellsim.set_voltage(ch, voltage).await?;
    }
    println!("Voltages: {:?}", cellsim.get_all_voltages().await?);

    cellsim.close().await?;
    Ok(())
}
