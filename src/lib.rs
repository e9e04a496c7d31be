//! # Cell Simulator Host Library
//!
//! Host-side control of a multi-channel battery cell simulator that enumerates as
//! a USB serial device and speaks a line-oriented ASCII protocol. The library
//! finds the instrument among the host's serial ports, sends commands with
//! bounded waits, and exposes the instrument's operations as typed methods.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Line grammar. Commands, classified reply lines (`OK:` /
//!   `Error:` / informational) and the ordered reply of one exchange.
//! - **`serial`**: The byte-stream link. Line reads and writes, discarding of stale
//!   input, and the `LinkOpener` seam for real ports and in-memory streams.
//! - **`client`**: `CommandClient`, one command in flight per link, collecting
//!   reply lines until a terminal line or the per-command deadline.
//! - **`discovery`**: Concurrent probing of candidate ports, first match wins.
//! - **`device`**: `CellSim`, the named instrument operations (set/read voltages,
//!   read currents, relays, DMM routing, calibration).
//! - **`mock`**: Simulated instrument and endpoints for tests and `--mock` runs.
//! - **`config`**: Figment-layered configuration (defaults, TOML, environment).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: The `CellSimError` type shared by every layer.

pub mod client;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod mock;
pub mod protocol;
pub mod serial;

pub use client::CommandClient;
pub use config::CellSimConfig;
pub use device::CellSim;
pub use discovery::{DeviceDiscovery, ProbeReport, ProbeResult};
pub use error::{CellSimError, CellSimResult};
pub use protocol::{Command, Outcome, Response, ResponseLine};
pub use serial::{Link, LinkId, LinkOpener};
