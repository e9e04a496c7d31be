//! Integration tests for concurrent device discovery
//!
//! Candidate ports are simulated with `MockOpener`: silent peripherals, foreign
//! instruments, ports that cannot be opened, and the cell simulator itself.

use async_trait::async_trait;
use cellsim::config::{CellSimConfig, ClientConfig};
use cellsim::discovery::{DeviceDiscovery, ProbeReport, ProbeResult};
use cellsim::mock::{MockCellSim, MockEndpoint, MockOpener};
use cellsim::serial::{Link, LinkId, LinkOpener};
use cellsim::CellSimResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROBE_DEADLINE: Duration = Duration::from_millis(300);

/// Opener whose `open` never completes for the `stuck` port, like a driver
/// wedged inside the OS open call. Everything else goes to the inner opener.
struct WedgedOpener {
    inner: MockOpener,
}

#[async_trait]
impl LinkOpener for WedgedOpener {
    async fn open(&self, id: &LinkId) -> CellSimResult<Link> {
        if id.as_str() == "stuck" {
            std::future::pending::<()>().await;
        }
        self.inner.open(id).await
    }
}

fn discovery(opener: &MockOpener) -> DeviceDiscovery {
    DeviceDiscovery::new(Arc::new(opener.clone()))
        .with_client_config(ClientConfig::uniform(PROBE_DEADLINE))
}

fn ids(names: &[&str]) -> Vec<LinkId> {
    names.iter().copied().map(LinkId::from).collect()
}

#[tokio::test]
async fn test_finds_instrument_among_silent_ports() {
    // Long deadline: the losers stay busy far beyond the time the match takes
    let deadline = Duration::from_secs(2);

    let mut opener = MockOpener::new();
    let mut candidates = Vec::new();
    for i in 0..10 {
        let name = format!("/dev/ttyUSB{}", i);
        let endpoint = if i == 7 {
            MockEndpoint::CellSim(MockCellSim::new())
        } else {
            MockEndpoint::Silent
        };
        opener = opener.with_endpoint(name.as_str(), endpoint);
        candidates.push(LinkId::from(name));
    }
    let discovery = DeviceDiscovery::new(Arc::new(opener))
        .with_client_config(ClientConfig::uniform(deadline));

    let start = Instant::now();
    let found = discovery.discover(candidates).await;
    let elapsed = start.elapsed();

    assert_eq!(found, Some(LinkId::from("/dev/ttyUSB7")));
    // Returns on the match without waiting for the silent ports to time out
    assert!(elapsed < deadline / 4, "discovery took {:?}", elapsed);
}

#[tokio::test]
async fn test_empty_candidate_set_returns_immediately() {
    let opener = MockOpener::new();

    let start = Instant::now();
    let found = discovery(&opener).discover(Vec::new()).await;

    assert_eq!(found, None);
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(opener.opened_count(), 0);
}

#[tokio::test]
async fn test_not_found_only_after_every_probe_finishes() {
    let opener = MockOpener::new()
        .with_endpoint("a", MockEndpoint::Silent)
        .with_endpoint("b", MockEndpoint::Silent)
        .with_endpoint("c", MockEndpoint::Foreign("NMEA $GPGGA".into()))
        .with_endpoint("d", MockEndpoint::Silent);

    let start = Instant::now();
    let found = discovery(&opener).discover(ids(&["a", "b", "c", "d"])).await;
    let elapsed = start.elapsed();

    assert_eq!(found, None);
    assert!(elapsed >= PROBE_DEADLINE, "returned early after {:?}", elapsed);
    assert!(elapsed < PROBE_DEADLINE * 3, "took {:?}", elapsed);
    assert_eq!(opener.opened_count(), 4);
}

#[tokio::test]
async fn test_open_failure_is_isolated() {
    let opener = MockOpener::new()
        .with_endpoint("busy", MockEndpoint::Unavailable("Device or resource busy".into()))
        .with_endpoint("denied", MockEndpoint::Unavailable("Permission denied".into()))
        .with_endpoint("cellsim", MockEndpoint::CellSim(MockCellSim::new()));

    let found = discovery(&opener)
        .discover(ids(&["busy", "missing", "denied", "cellsim"]))
        .await;

    assert_eq!(found, Some(LinkId::from("cellsim")));
}

#[tokio::test]
async fn test_foreign_replies_do_not_match() {
    // Plain "PONG" is not a success line; "OK:READY" lacks the acknowledgement
    let opener = MockOpener::new()
        .with_endpoint("plain", MockEndpoint::Foreign("PONG".into()))
        .with_endpoint("other", MockEndpoint::Foreign("OK:READY".into()))
        .with_endpoint("failing", MockEndpoint::Foreign("Error:PONG".into()));

    let found = discovery(&opener)
        .discover(ids(&["plain", "other", "failing"]))
        .await;
    assert_eq!(found, None);
}

#[tokio::test]
async fn test_fastest_match_wins() {
    let slow = MockCellSim::new().with_response_delay(Duration::from_millis(200));
    let opener = MockOpener::new()
        .with_endpoint("slow", MockEndpoint::CellSim(slow))
        .with_endpoint("fast", MockEndpoint::CellSim(MockCellSim::new()));

    let found = discovery(&opener).discover(ids(&["slow", "fast"])).await;
    assert_eq!(found, Some(LinkId::from("fast")));
}

#[tokio::test]
async fn test_discover_reports_every_candidate() {
    let opener = MockOpener::new()
        .with_endpoint("busy", MockEndpoint::Unavailable("Device or resource busy".into()))
        .with_endpoint("idle", MockEndpoint::Silent)
        .with_endpoint("cellsim", MockEndpoint::CellSim(MockCellSim::new()))
        .with_endpoint("gps", MockEndpoint::Foreign("$GPRMC".into()));

    let reports = discovery(&opener)
        .discover_reports(ids(&["busy", "idle", "cellsim", "gps"]))
        .await;

    let links: Vec<&str> = reports.iter().map(|r| r.link.as_str()).collect();
    assert_eq!(links, vec!["busy", "idle", "cellsim", "gps"]);

    assert!(matches!(
        &reports[0].result,
        ProbeResult::Failed(reason) if reason.contains("busy")
    ));
    assert_eq!(reports[1].result, ProbeResult::NotMatched);
    assert_eq!(
        reports[2],
        ProbeReport {
            link: LinkId::from("cellsim"),
            result: ProbeResult::Matched(LinkId::from("cellsim")),
        }
    );
    assert_eq!(reports[3].result, ProbeResult::NotMatched);
}

#[tokio::test]
async fn test_from_config_uses_configured_probe() {
    let mut config = CellSimConfig::default();
    config.client = ClientConfig::uniform(PROBE_DEADLINE);
    config.discovery.probe_command = "GETV 1".into();
    config.discovery.expected_ack = "voltage:".into();

    let opener = MockOpener::new()
        .with_endpoint("idle", MockEndpoint::Silent)
        .with_endpoint("cellsim", MockEndpoint::CellSim(MockCellSim::new()));
    let discovery = DeviceDiscovery::from_config(Arc::new(opener), &config).unwrap();

    let found = discovery.discover(ids(&["idle", "cellsim"])).await;
    assert_eq!(found, Some(LinkId::from("cellsim")));
}

#[tokio::test]
async fn test_wedged_open_does_not_hang_discovery() {
    let opener = WedgedOpener {
        inner: MockOpener::new().with_endpoint("idle", MockEndpoint::Silent),
    };
    let discovery = DeviceDiscovery::new(Arc::new(opener))
        .with_client_config(ClientConfig::uniform(Duration::from_millis(100)));

    let start = Instant::now();
    let found = tokio::time::timeout(
        Duration::from_secs(3),
        discovery.discover(ids(&["idle", "stuck"])),
    )
    .await
    .expect("discovery must finish even if one open never returns");

    assert_eq!(found, None);
    assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());

    let reports = discovery.discover_reports(ids(&["stuck"])).await;
    assert_eq!(
        reports[0].result,
        ProbeResult::Failed("open timed out".to_string())
    );
}
