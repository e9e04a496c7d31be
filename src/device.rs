//! Cell simulator device API
//!
//! Named operations over one [`CommandClient`]. Each operation maps to exactly
//! one protocol command:
//!
//! | Operation | Command |
//! |---|---|
//! | [`CellSim::set_voltage`] | `SETV <ch> <v>` |
//! | [`CellSim::get_voltage`] | `GETV <ch>` → `OK:voltage:<v>` |
//! | [`CellSim::set_all_voltages`] | `SETALLV <v>` |
//! | [`CellSim::get_all_voltages`] | `GETALLV` → `OK:voltages:<v1>,...,<vN>` |
//! | [`CellSim::get_all_currents`] | `GETALLI` → `OK:currents:<i1>,...,<iN>` |
//! | [`CellSim::enable_output`] / `_all` | `ENABLE_OUTPUT <ch>` / `ENABLE_OUTPUT_ALL` |
//! | [`CellSim::disable_output`] / `_all` | `DISABLE_OUTPUT <ch>` / `DISABLE_OUTPUT_ALL` |
//! | [`CellSim::enable_load_switch`] / `_all` | `ENABLE_LOAD_SWITCH <ch>` / `..._ALL` |
//! | [`CellSim::disable_load_switch`] / `_all` | `DISABLE_LOAD_SWITCH <ch>` / `..._ALL` |
//! | [`CellSim::enable_dmm`] | `ENABLE_DMM <ch>` |
//! | [`CellSim::disable_dmm`] | `DISABLE_DMM` |
//! | [`CellSim::calibrate`] / `_all` | `CALIBRATE <ch>` / `CALIBRATE_ALL` |
//! | [`CellSim::ping`] | `PING` → `OK:PONG` |
//!
//! Channels are 1-based. An out-of-range channel is rejected before anything is
//! sent.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cellsim::device::CellSim;
//!
//! let mut cellsim = CellSim::open_serial("/dev/ttyACM0", &config).await?;
//! cellsim.set_all_voltages(3.5).await?;
//! let voltages = cellsim.get_all_voltages().await?;
//! assert_eq!(voltages.len(), 16);
//! cellsim.close().await?;
//! ```

use tracing::instrument;

use crate::client::CommandClient;
use crate::config::{CellSimConfig, DeviceConfig};
use crate::error::{CellSimError, CellSimResult};
use crate::protocol::{Command, Outcome, Response};

/// A validated, 1-based channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    /// Validate `channel` against an instrument with `channel_count` cells.
    ///
    /// # Errors
    ///
    /// `CellSimError::InvalidChannel` unless `1 <= channel <= channel_count`.
    pub fn new(channel: u8, channel_count: u8) -> CellSimResult<Self> {
        if channel == 0 || channel > channel_count {
            return Err(CellSimError::InvalidChannel {
                channel,
                max: channel_count,
            });
        }
        Ok(Self(channel))
    }

    /// The 1-based channel number.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one cell simulator.
#[derive(Debug)]
pub struct CellSim {
    client: CommandClient,
    channel_count: u8,
}

impl CellSim {
    /// Wrap an open command client.
    pub fn new(client: CommandClient, device: &DeviceConfig) -> Self {
        Self {
            client,
            channel_count: device.channel_count,
        }
    }

    /// Open a serial port and wrap it.
    ///
    /// # Errors
    ///
    /// `CellSimError::LinkUnavailable` if the port cannot be opened.
    #[cfg(feature = "instrument_serial")]
    pub async fn open_serial(port: &str, config: &CellSimConfig) -> CellSimResult<Self> {
        use crate::serial::{LinkId, SerialOpener};

        let opener = SerialOpener::from_config(&config.link);
        let client =
            CommandClient::open(&opener, &LinkId::from(port), config.client.clone()).await?;
        tracing::info!(port, "connected to cell simulator");
        Ok(Self::new(client, &config.device))
    }

    /// Number of channels on the instrument.
    pub fn channel_count(&self) -> u8 {
        self.channel_count
    }

    /// Validate a channel number for this instrument.
    ///
    /// # Errors
    ///
    /// `CellSimError::InvalidChannel` if out of range.
    pub fn channel(&self, channel: u8) -> CellSimResult<Channel> {
        Channel::new(channel, self.channel_count)
    }

    /// Underlying command client.
    pub fn client_mut(&mut self) -> &mut CommandClient {
        &mut self.client
    }

    /// Set the voltage target of one channel.
    #[instrument(skip(self), err)]
    pub async fn set_voltage(&mut self, channel: u8, voltage: f64) -> CellSimResult<()> {
        let ch = self.channel(channel)?;
        let voltage = finite(voltage)?;
        self.execute(format!("SETV {} {}", ch, voltage)).await.map(drop)
    }

    /// Read the voltage of one channel.
    #[instrument(skip(self), err)]
    pub async fn get_voltage(&mut self, channel: u8) -> CellSimResult<f64> {
        let ch = self.channel(channel)?;
        let command = format!("GETV {}", ch);
        let payload = self.execute(command.clone()).await?;
        let value = keyed_payload(&command, &payload, "voltage")?;
        value.trim().parse::<f64>().map_err(|e| CellSimError::MalformedPayload {
            command,
            line: format!("OK:{}", payload),
            reason: e.to_string(),
        })
    }

    /// Set every channel to the same voltage.
    #[instrument(skip(self), err)]
    pub async fn set_all_voltages(&mut self, voltage: f64) -> CellSimResult<()> {
        let voltage = finite(voltage)?;
        self.execute(format!("SETALLV {}", voltage)).await.map(drop)
    }

    /// Read the voltages of all channels, channel 1 first.
    #[instrument(skip(self), err)]
    pub async fn get_all_voltages(&mut self) -> CellSimResult<Vec<f64>> {
        self.read_all("GETALLV", "voltages").await
    }

    /// Read the currents of all channels, channel 1 first.
    #[instrument(skip(self), err)]
    pub async fn get_all_currents(&mut self) -> CellSimResult<Vec<f64>> {
        self.read_all("GETALLI", "currents").await
    }

    /// Close the output relay of one channel.
    pub async fn enable_output(&mut self, channel: u8) -> CellSimResult<()> {
        self.channel_command("ENABLE_OUTPUT", channel).await
    }

    /// Close the output relays of all channels.
    pub async fn enable_output_all(&mut self) -> CellSimResult<()> {
        self.execute("ENABLE_OUTPUT_ALL").await.map(drop)
    }

    /// Open the output relay of one channel.
    pub async fn disable_output(&mut self, channel: u8) -> CellSimResult<()> {
        self.channel_command("DISABLE_OUTPUT", channel).await
    }

    /// Open the output relays of all channels.
    pub async fn disable_output_all(&mut self) -> CellSimResult<()> {
        self.execute("DISABLE_OUTPUT_ALL").await.map(drop)
    }

    /// Connect the load of one channel.
    pub async fn enable_load_switch(&mut self, channel: u8) -> CellSimResult<()> {
        self.channel_command("ENABLE_LOAD_SWITCH", channel).await
    }

    /// Connect the loads of all channels.
    pub async fn enable_load_switch_all(&mut self) -> CellSimResult<()> {
        self.execute("ENABLE_LOAD_SWITCH_ALL").await.map(drop)
    }

    /// Disconnect the load of one channel.
    pub async fn disable_load_switch(&mut self, channel: u8) -> CellSimResult<()> {
        self.channel_command("DISABLE_LOAD_SWITCH", channel).await
    }

    /// Disconnect the loads of all channels.
    pub async fn disable_load_switch_all(&mut self) -> CellSimResult<()> {
        self.execute("DISABLE_LOAD_SWITCH_ALL").await.map(drop)
    }

    /// Route one channel to the measurement unit.
    pub async fn enable_dmm(&mut self, channel: u8) -> CellSimResult<()> {
        self.channel_command("ENABLE_DMM", channel).await
    }

    /// Disconnect the measurement unit.
    pub async fn disable_dmm(&mut self) -> CellSimResult<()> {
        self.execute("DISABLE_DMM").await.map(drop)
    }

    /// Run calibration on one channel.
    pub async fn calibrate(&mut self, channel: u8) -> CellSimResult<()> {
        self.channel_command("CALIBRATE", channel).await
    }

    /// Run calibration on all channels.
    pub async fn calibrate_all(&mut self) -> CellSimResult<()> {
        self.execute("CALIBRATE_ALL").await.map(drop)
    }

    /// Liveness check: `true` if the instrument answered `OK:PONG`.
    ///
    /// # Errors
    ///
    /// Only link I/O failures; a wrong or missing answer is `Ok(false)`.
    pub async fn ping(&mut self) -> CellSimResult<bool> {
        let response = self.client.send_command(&Command::fixed("PING")).await?;
        Ok(matches!(response.outcome(), Outcome::Success(p) if p.contains("PONG")))
    }

    /// Send arbitrary command text and return the raw reply.
    pub async fn raw(&mut self, text: &str) -> CellSimResult<Response> {
        self.client.send(text).await
    }

    /// Close the connection.
    pub async fn close(self) -> CellSimResult<()> {
        self.client.close().await
    }

    async fn channel_command(&mut self, verb: &str, channel: u8) -> CellSimResult<()> {
        let ch = self.channel(channel)?;
        self.execute(format!("{} {}", verb, ch)).await.map(drop)
    }

    async fn read_all(&mut self, verb: &str, key: &str) -> CellSimResult<Vec<f64>> {
        let payload = self.execute(verb).await?;
        let values = keyed_payload(verb, &payload, key)?;
        let malformed = |reason: String| CellSimError::MalformedPayload {
            command: verb.to_string(),
            line: format!("OK:{}", payload),
            reason,
        };

        let parsed = values
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(e.to_string()))?;

        if parsed.len() != usize::from(self.channel_count) {
            return Err(malformed(format!(
                "expected {} values, got {}",
                self.channel_count,
                parsed.len()
            )));
        }
        Ok(parsed)
    }

    /// Send a command and return the payload of its `OK:` line.
    async fn execute(&mut self, text: impl Into<String>) -> CellSimResult<String> {
        let command = Command::new(text)?;
        let response = self.client.send_command(&command).await?;
        match response.outcome() {
            Outcome::Success(payload) => Ok(payload.to_string()),
            Outcome::Failure(message) => Err(CellSimError::CommandRejected {
                command: command.to_string(),
                message: message.to_string(),
            }),
            Outcome::Indeterminate => Err(CellSimError::NoResponse {
                command: command.to_string(),
            }),
        }
    }
}

fn finite(value: f64) -> CellSimResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CellSimError::InvalidValue(format!(
            "voltage must be finite, got {}",
            value
        )))
    }
}

/// Strip `key:` from an `OK:` payload (`voltage:3.700000` → `3.700000`).
fn keyed_payload<'a>(command: &str, payload: &'a str, key: &str) -> CellSimResult<&'a str> {
    payload
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| CellSimError::MalformedPayload {
            command: command.to_string(),
            line: format!("OK:{}", payload),
            reason: format!("expected '{}:' prefix", key),
        })
}
