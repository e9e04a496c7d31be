//! Concurrent device discovery
//!
//! Serial enumeration yields an unordered set of endpoints, most of them
//! unrelated peripherals. Probing them one after another would make discovery
//! cost one full client deadline per wrong port. Instead every candidate gets
//! its own probe task:
//!
//! 1. Skip the probe entirely if another candidate already matched
//! 2. Open its own link and command client, giving up after the client deadline
//! 3. Send the liveness command (`PING`)
//! 4. Report `Matched` if the first reply line is `OK:` carrying the expected
//!    acknowledgement (`PONG`), `NotMatched` otherwise, `Failed` on open/send errors
//! 5. Close the client on every path
//!
//! The coordinator takes completions in the order they happen. The first
//! `Matched` wins: the shared [`ProbeCancellation`] is set and the remaining
//! tasks are detached to wind down on their own; opening and the exchange are
//! each bounded by the client deadline. Only when every probe has finished
//! without a match does discovery report nothing found.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellsim::discovery::DeviceDiscovery;
//! use cellsim::serial::{available_ports, SerialOpener};
//! use std::sync::Arc;
//!
//! let discovery = DeviceDiscovery::new(Arc::new(SerialOpener::new(115_200)));
//! match discovery.discover(available_ports()?).await {
//!     Some(port) => println!("cell simulator on {port}"),
//!     None => println!("no cell simulator found"),
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::client::CommandClient;
use crate::config::{CellSimConfig, ClientConfig, DiscoveryConfig};
use crate::error::CellSimResult;
use crate::protocol::{Command, ResponseLine};
use crate::serial::{LinkId, LinkOpener};

/// Outcome of probing one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The candidate answered the liveness probe correctly.
    Matched(LinkId),
    /// The candidate answered something else, nothing at all, or was skipped
    /// because another candidate had already matched.
    NotMatched,
    /// Opening the link or sending the probe failed.
    Failed(String),
}

/// One probe result, tagged with the candidate it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Candidate that was probed
    pub link: LinkId,
    /// What happened
    pub result: ProbeResult,
}

/// Cooperative stop request shared by the probes of one discovery run.
///
/// Setting it never interrupts a probe; probes check it before opening their
/// link and after their exchange.
#[derive(Debug, Clone, Default)]
pub struct ProbeCancellation(Arc<AtomicBool>);

impl ProbeCancellation {
    /// A fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every probe holding a clone of this token to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Race-to-first-match prober.
#[derive(Clone)]
pub struct DeviceDiscovery {
    opener: Arc<dyn LinkOpener>,
    client_config: ClientConfig,
    probe_command: Command,
    expected_ack: String,
}

impl std::fmt::Debug for DeviceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDiscovery")
            .field("client_config", &self.client_config)
            .field("probe_command", &self.probe_command)
            .field("expected_ack", &self.expected_ack)
            .finish_non_exhaustive()
    }
}

impl DeviceDiscovery {
    /// Discovery with the default probe (`PING` → `OK:PONG`) and deadlines.
    pub fn new(opener: Arc<dyn LinkOpener>) -> Self {
        Self {
            opener,
            client_config: ClientConfig::default(),
            probe_command: Command::fixed("PING"),
            expected_ack: DiscoveryConfig::default().expected_ack,
        }
    }

    /// Discovery configured from the `[client]` and `[discovery]` sections.
    ///
    /// # Errors
    ///
    /// `CellSimError::InvalidCommand` if the configured probe command is invalid.
    pub fn from_config(opener: Arc<dyn LinkOpener>, config: &CellSimConfig) -> CellSimResult<Self> {
        Ok(Self {
            opener,
            client_config: config.client.clone(),
            probe_command: Command::new(config.discovery.probe_command.as_str())?,
            expected_ack: config.discovery.expected_ack.clone(),
        })
    }

    /// Replace the per-probe client deadlines.
    pub fn with_client_config(mut self, client_config: ClientConfig) -> Self {
        self.client_config = client_config;
        self
    }

    /// Find the one candidate hosting the instrument.
    ///
    /// Returns `None` immediately for an empty candidate set, and otherwise only
    /// once every probe has finished without a match.
    #[instrument(skip_all)]
    pub async fn discover<I>(&self, candidates: I) -> Option<LinkId>
    where
        I: IntoIterator<Item = LinkId>,
    {
        let cancel = ProbeCancellation::new();
        let mut probes = self.spawn_probes(candidates, &cancel);
        if probes.is_empty() {
            tracing::info!("no candidate ports to probe");
            return None;
        }
        tracing::info!(candidates = probes.len(), "probing candidate ports");

        while let Some(joined) = probes.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!("probe task ended abnormally: {}", e);
                    continue;
                }
            };
            if let ProbeResult::Matched(link) = report.result {
                cancel.cancel();
                // Losers finish on their own, bounded by the client deadline
                probes.detach_all();
                tracing::info!(link = %link, "cell simulator found");
                return Some(link);
            }
        }

        tracing::info!("no cell simulator found");
        None
    }

    /// Probe every candidate to completion and report all outcomes.
    ///
    /// No cancellation is applied, so each candidate is actually probed. Reports
    /// come back in the order of the input candidates.
    #[instrument(skip_all)]
    pub async fn discover_reports<I>(&self, candidates: I) -> Vec<ProbeReport>
    where
        I: IntoIterator<Item = LinkId>,
    {
        let candidates: Vec<LinkId> = candidates.into_iter().collect();
        let never_cancelled = ProbeCancellation::new();
        let mut probes = self.spawn_probes(candidates.iter().cloned(), &never_cancelled);

        let mut reports = Vec::with_capacity(candidates.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!("probe task ended abnormally: {}", e),
            }
        }

        // A probe that panicked still gets exactly one report
        for link in &candidates {
            if !reports.iter().any(|r| &r.link == link) {
                reports.push(ProbeReport {
                    link: link.clone(),
                    result: ProbeResult::Failed("probe task panicked".into()),
                });
            }
        }
        reports.sort_by_key(|r| candidates.iter().position(|c| c == &r.link));
        reports
    }

    /// Enumerate the host's serial ports and discover among them.
    ///
    /// # Errors
    ///
    /// Only if port enumeration itself fails.
    #[cfg(feature = "instrument_serial")]
    pub async fn discover_serial_ports(&self) -> CellSimResult<Option<LinkId>> {
        let ports = crate::serial::available_ports()?;
        Ok(self.discover(ports).await)
    }

    fn spawn_probes<I>(&self, candidates: I, cancel: &ProbeCancellation) -> JoinSet<ProbeReport>
    where
        I: IntoIterator<Item = LinkId>,
    {
        let mut probes = JoinSet::new();
        for link in candidates {
            let probe = Probe {
                opener: self.opener.clone(),
                client_config: self.client_config.clone(),
                command: self.probe_command.clone(),
                expected_ack: self.expected_ack.clone(),
                cancel: cancel.clone(),
            };
            probes.spawn(probe.run(link));
        }
        probes
    }
}

/// Everything one probe task owns.
struct Probe {
    opener: Arc<dyn LinkOpener>,
    client_config: ClientConfig,
    command: Command,
    expected_ack: String,
    cancel: ProbeCancellation,
}

impl Probe {
    async fn run(self, link: LinkId) -> ProbeReport {
        let result = self.probe(&link).await;
        match &result {
            ProbeResult::Failed(reason) => {
                tracing::warn!(link = %link, "probe failed: {}", reason)
            }
            ProbeResult::NotMatched => tracing::debug!(link = %link, "not a cell simulator"),
            ProbeResult::Matched(_) => tracing::debug!(link = %link, "probe matched"),
        }
        ProbeReport { link, result }
    }

    async fn probe(&self, link: &LinkId) -> ProbeResult {
        if self.cancel.is_cancelled() {
            return ProbeResult::NotMatched;
        }

        // Opening may block in the OS; it gets the same deadline as the exchange
        let open_deadline = self.client_config.timeout_for(&self.command);
        let opening = CommandClient::open(self.opener.as_ref(), link, self.client_config.clone());
        let mut client = match tokio::time::timeout(open_deadline, opening).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return ProbeResult::Failed(e.to_string()),
            Err(_) => return ProbeResult::Failed("open timed out".into()),
        };

        let exchange = client.send_command(&self.command).await;

        if let Err(e) = client.close().await {
            tracing::debug!(link = %link, "close after probe failed: {}", e);
        }

        let response = match exchange {
            Ok(response) => response,
            Err(e) => return ProbeResult::Failed(e.to_string()),
        };

        if self.cancel.is_cancelled() {
            // Someone else already won; this answer is discarded
            return ProbeResult::NotMatched;
        }

        match response.first() {
            Some(ResponseLine::Success(payload)) if payload.contains(&self.expected_ack) => {
                ProbeResult::Matched(link.clone())
            }
            _ => ProbeResult::NotMatched,
        }
    }
}
