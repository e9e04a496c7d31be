//! Mock Instrument Implementations
//!
//! Provides a simulated cell simulator and simulated serial endpoints for
//! testing without physical hardware. Everything runs over in-memory
//! `tokio::io::duplex` streams and speaks the real wire protocol, so the
//! command client and discovery code paths are exercised unchanged.
//!
//! # Available Mocks
//!
//! - [`MockCellSim`] - 16-channel instrument model answering the full command set
//! - [`MockOpener`] - [`LinkOpener`] over a table of [`MockEndpoint`]s (a cell
//!   simulator, a silent port, a foreign device, a port that cannot be opened)
//!
//! # Behaviour
//!
//! - Replies end with `\r\n`, like the firmware's `println`
//! - Setpoints are accepted in 0.0 ..= 5.0 V and read back exactly
//! - Current flows only when both output relay and load switch are enabled,
//!   through a fixed 100 Ω simulated load
//! - `CALIBRATE` emits a progress line before its terminal line

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{CellSimError, CellSimResult};
use crate::serial::{Link, LinkId, LinkOpener};

/// Highest setpoint the simulated cells accept (V).
pub const MOCK_MAX_VOLTAGE: f64 = 5.0;

/// Simulated load on every enabled cell (Ω).
pub const MOCK_LOAD_OHMS: f64 = 100.0;

const DUPLEX_CAPACITY: usize = 4096;

// =============================================================================
// MockCellSim - Simulated Instrument
// =============================================================================

#[derive(Debug, Clone, Default)]
struct CellState {
    setpoint: f64,
    output_enabled: bool,
    load_switch_enabled: bool,
    calibrated: bool,
}

impl CellState {
    fn current(&self) -> f64 {
        if self.output_enabled && self.load_switch_enabled {
            self.setpoint / MOCK_LOAD_OHMS
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct SimState {
    cells: Vec<CellState>,
    dmm_channel: Option<u8>,
    received: Vec<String>,
}

/// Simulated cell simulator.
///
/// Cloning shares the instrument state, so a test can hold one handle for
/// inspection while another serves a link.
///
/// # Example
///
/// ```rust,ignore
/// let sim = MockCellSim::new();
/// let link = sim.connect("mock0");
/// let mut client = CommandClient::new(link, ClientConfig::default());
/// let response = client.send("PING").await?;
/// assert!(response.is_success());
/// ```
#[derive(Debug, Clone)]
pub struct MockCellSim {
    state: Arc<Mutex<SimState>>,
    response_delay: Duration,
    telemetry: bool,
}

impl Default for MockCellSim {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCellSim {
    /// New 16-channel instrument with all cells at 0 V and outputs off.
    pub fn new() -> Self {
        Self::with_channels(16)
    }

    /// New instrument with `channel_count` cells.
    pub fn with_channels(channel_count: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                cells: vec![CellState::default(); usize::from(channel_count)],
                dmm_channel: None,
                received: Vec::new(),
            })),
            response_delay: Duration::ZERO,
            telemetry: false,
        }
    }

    /// Delay every reply by `delay` (slow firmware).
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Emit a `>Loop time(us): ...` telemetry line ahead of every reply, the way
    /// the firmware's plotter output interleaves with command replies.
    pub fn with_telemetry(mut self, enabled: bool) -> Self {
        self.telemetry = enabled;
        self
    }

    /// Open an in-memory link to this instrument.
    ///
    /// Spawns the serving task on the current runtime; it ends when the link is
    /// closed or dropped.
    pub fn connect(&self, id: impl Into<LinkId>) -> Link {
        let (host, device) = tokio::io::duplex(DUPLEX_CAPACITY);
        self.serve(device);
        Link::new(id.into(), Box::new(host))
    }

    /// Answer commands arriving on `stream` until it reaches end of input.
    pub fn serve<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sim = self.clone();
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(stream);
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let command = line.trim();
                if command.is_empty() {
                    continue;
                }

                let reply = sim.handle_command(command).await;
                if !sim.response_delay.is_zero() {
                    tokio::time::sleep(sim.response_delay).await;
                }

                let mut out = String::new();
                if sim.telemetry {
                    out.push_str(">Loop time(us): 412\r\n");
                }
                for reply_line in reply {
                    out.push_str(&reply_line);
                    out.push_str("\r\n");
                }
                if writer.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
            tracing::trace!("mock cell simulator link closed");
        })
    }

    /// Execute one command line and return the reply lines (without terminators).
    pub async fn handle_command(&self, command: &str) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.received.push(command.to_string());

        let mut parts = command.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        let channel_count = state.cells.len();

        // Resolve a 1-based channel argument to an index
        let channel = |args: &[&str]| -> Result<usize, String> {
            let raw = args.first().ok_or("Error:Missing channel")?;
            match raw.parse::<usize>() {
                Ok(ch) if (1..=channel_count).contains(&ch) => Ok(ch - 1),
                _ => Err("Error:Invalid channel".to_string()),
            }
        };
        let voltage = |raw: Option<&&str>| -> Result<f64, String> {
            let raw = raw.ok_or("Error:Missing voltage")?;
            match raw.parse::<f64>() {
                Ok(v) if (0.0..=MOCK_MAX_VOLTAGE).contains(&v) => Ok(v),
                _ => Err("Error:Invalid voltage".to_string()),
            }
        };

        let result: Result<Vec<String>, String> = match verb {
            "PING" => Ok(vec!["OK:PONG".into()]),
            "SETV" => channel(&args).and_then(|idx| {
                let v = voltage(args.get(1))?;
                state.cells[idx].setpoint = v;
                Ok(vec!["OK:SETV".into()])
            }),
            "GETV" => channel(&args)
                .map(|idx| vec![format!("OK:voltage:{:.6}", state.cells[idx].setpoint)]),
            "SETALLV" => voltage(args.first()).map(|v| {
                for cell in &mut state.cells {
                    cell.setpoint = v;
                }
                vec!["OK:SETALLV".into()]
            }),
            "GETALLV" => Ok(vec![format!(
                "OK:voltages:{}",
                join_values(state.cells.iter().map(|c| c.setpoint))
            )]),
            "GETALLI" => Ok(vec![format!(
                "OK:currents:{}",
                join_values(state.cells.iter().map(CellState::current))
            )]),
            "ENABLE_OUTPUT" | "DISABLE_OUTPUT" => channel(&args).map(|idx| {
                state.cells[idx].output_enabled = verb == "ENABLE_OUTPUT";
                vec![format!("OK:{}", verb)]
            }),
            "ENABLE_OUTPUT_ALL" | "DISABLE_OUTPUT_ALL" => {
                let enabled = verb == "ENABLE_OUTPUT_ALL";
                for cell in &mut state.cells {
                    cell.output_enabled = enabled;
                }
                Ok(vec![format!("OK:{}", verb)])
            }
            "ENABLE_LOAD_SWITCH" | "DISABLE_LOAD_SWITCH" => channel(&args).map(|idx| {
                state.cells[idx].load_switch_enabled = verb == "ENABLE_LOAD_SWITCH";
                vec![format!("OK:{}", verb)]
            }),
            "ENABLE_LOAD_SWITCH_ALL" | "DISABLE_LOAD_SWITCH_ALL" => {
                let enabled = verb == "ENABLE_LOAD_SWITCH_ALL";
                for cell in &mut state.cells {
                    cell.load_switch_enabled = enabled;
                }
                Ok(vec![format!("OK:{}", verb)])
            }
            "ENABLE_DMM" => channel(&args).map(|idx| {
                state.dmm_channel = Some((idx + 1) as u8);
                vec!["OK:ENABLE_DMM".into()]
            }),
            "DISABLE_DMM" => {
                state.dmm_channel = None;
                Ok(vec!["OK:DISABLE_DMM".into()])
            }
            "CALIBRATE" => channel(&args).map(|idx| {
                state.cells[idx].calibrated = true;
                vec![
                    format!("Calibrating cell {}", idx + 1),
                    "OK:CALIBRATE".into(),
                ]
            }),
            "CALIBRATE_ALL" => {
                let mut lines: Vec<String> = (1..=channel_count)
                    .map(|ch| format!("Calibrating cell {}", ch))
                    .collect();
                for cell in &mut state.cells {
                    cell.calibrated = true;
                }
                lines.push("OK:CALIBRATE_ALL".into());
                Ok(lines)
            }
            _ => Err("Error:Unknown command".to_string()),
        };

        result.unwrap_or_else(|err| vec![err])
    }

    /// Current setpoint of a 1-based channel.
    pub async fn voltage(&self, channel: u8) -> Option<f64> {
        let state = self.state.lock().await;
        let idx = usize::from(channel).checked_sub(1)?;
        state.cells.get(idx).map(|c| c.setpoint)
    }

    /// Whether the output relay of a 1-based channel is closed.
    pub async fn output_enabled(&self, channel: u8) -> Option<bool> {
        let state = self.state.lock().await;
        let idx = usize::from(channel).checked_sub(1)?;
        state.cells.get(idx).map(|c| c.output_enabled)
    }

    /// Whether the load switch of a 1-based channel is closed.
    pub async fn load_switch_enabled(&self, channel: u8) -> Option<bool> {
        let state = self.state.lock().await;
        let idx = usize::from(channel).checked_sub(1)?;
        state.cells.get(idx).map(|c| c.load_switch_enabled)
    }

    /// Whether a 1-based channel has been calibrated.
    pub async fn calibrated(&self, channel: u8) -> Option<bool> {
        let state = self.state.lock().await;
        let idx = usize::from(channel).checked_sub(1)?;
        state.cells.get(idx).map(|c| c.calibrated)
    }

    /// Channel currently routed to the DMM.
    pub async fn dmm_channel(&self) -> Option<u8> {
        self.state.lock().await.dmm_channel
    }

    /// Every command line received so far, in order.
    pub async fn received_commands(&self) -> Vec<String> {
        self.state.lock().await.received.clone()
    }
}

fn join_values(values: impl Iterator<Item = f64>) -> String {
    values
        .map(|v| format!("{:.6}", v))
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// MockOpener - Simulated Serial Endpoints
// =============================================================================

/// What sits behind one simulated endpoint.
#[derive(Debug, Clone)]
pub enum MockEndpoint {
    /// A cell simulator
    CellSim(MockCellSim),
    /// Accepts bytes and never answers (an idle unrelated peripheral)
    Silent,
    /// Answers every line with this fixed text (a different instrument)
    Foreign(String),
    /// Cannot be opened; the string is the reported reason
    Unavailable(String),
}

/// [`LinkOpener`] over a table of simulated endpoints.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    endpoints: HashMap<LinkId, MockEndpoint>,
    opened: Arc<AtomicUsize>,
}

impl MockOpener {
    /// Opener with no endpoints; every open fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` under `id`.
    pub fn with_endpoint(mut self, id: impl Into<LinkId>, endpoint: MockEndpoint) -> Self {
        self.endpoints.insert(id.into(), endpoint);
        self
    }

    /// Number of links opened successfully so far.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkOpener for MockOpener {
    async fn open(&self, id: &LinkId) -> CellSimResult<Link> {
        let endpoint = self
            .endpoints
            .get(id)
            .ok_or_else(|| CellSimError::LinkUnavailable {
                link: id.to_string(),
                reason: "No such file or directory".into(),
            })?;

        let link = match endpoint {
            MockEndpoint::CellSim(sim) => sim.connect(id.clone()),
            MockEndpoint::Silent => {
                let (host, mut device) = tokio::io::duplex(DUPLEX_CAPACITY);
                tokio::spawn(async move {
                    let mut sink = [0u8; 256];
                    while let Ok(n) = device.read(&mut sink).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
                Link::new(id.clone(), Box::new(host))
            }
            MockEndpoint::Foreign(reply) => {
                let (host, device) = tokio::io::duplex(DUPLEX_CAPACITY);
                let reply = format!("{}\r\n", reply);
                tokio::spawn(async move {
                    let (reader, mut writer) = tokio::io::split(device);
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(_)) = lines.next_line().await {
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
                Link::new(id.clone(), Box::new(host))
            }
            MockEndpoint::Unavailable(reason) => {
                return Err(CellSimError::LinkUnavailable {
                    link: id.to_string(),
                    reason: reason.clone(),
                })
            }
        };

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_command_voltage_round_trip() {
        let sim = MockCellSim::new();
        assert_eq!(sim.handle_command("SETV 3 3.7").await, vec!["OK:SETV"]);
        assert_eq!(sim.handle_command("GETV 3").await, vec!["OK:voltage:3.700000"]);
        assert_eq!(sim.voltage(3).await, Some(3.7));
    }

    #[tokio::test]
    async fn test_handle_command_errors() {
        let sim = MockCellSim::new();
        assert_eq!(sim.handle_command("SETV 17 3.0").await, vec!["Error:Invalid channel"]);
        assert_eq!(sim.handle_command("SETV 0 3.0").await, vec!["Error:Invalid channel"]);
        assert_eq!(sim.handle_command("SETV 1 9.9").await, vec!["Error:Invalid voltage"]);
        assert_eq!(sim.handle_command("SETV 1").await, vec!["Error:Missing voltage"]);
        assert_eq!(sim.handle_command("GETV").await, vec!["Error:Missing channel"]);
        assert_eq!(sim.handle_command("FROB").await, vec!["Error:Unknown command"]);
    }

    #[tokio::test]
    async fn test_currents_need_output_and_load() {
        let sim = MockCellSim::with_channels(2);
        sim.handle_command("SETALLV 2.0").await;
        sim.handle_command("ENABLE_OUTPUT 1").await;
        assert_eq!(
            sim.handle_command("GETALLI").await,
            vec!["OK:currents:0.000000,0.000000"]
        );

        sim.handle_command("ENABLE_LOAD_SWITCH 1").await;
        assert_eq!(
            sim.handle_command("GETALLI").await,
            vec!["OK:currents:0.020000,0.000000"]
        );
    }

    #[tokio::test]
    async fn test_calibrate_emits_progress() {
        let sim = MockCellSim::with_channels(3);
        let reply = sim.handle_command("CALIBRATE_ALL").await;
        assert_eq!(reply.len(), 4);
        assert_eq!(reply.last().map(String::as_str), Some("OK:CALIBRATE_ALL"));
        assert_eq!(sim.calibrated(2).await, Some(true));
    }

    #[tokio::test]
    async fn test_opener_unknown_and_unavailable() {
        let opener = MockOpener::new()
            .with_endpoint("/dev/ttyS0", MockEndpoint::Unavailable("Permission denied".into()));

        let err = opener.open(&LinkId::from("/dev/ttyS0")).await.unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
        assert!(opener.open(&LinkId::from("/dev/ttyS9")).await.is_err());
        assert_eq!(opener.opened_count(), 0);
    }
}
