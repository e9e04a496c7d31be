//! Integration tests for the command client
//!
//! Drives `CommandClient` against the simulated instrument and against raw
//! duplex streams standing in for misbehaving devices.

use cellsim::config::ClientConfig;
use cellsim::mock::MockCellSim;
use cellsim::protocol::{Outcome, ResponseLine};
use cellsim::serial::{Link, LinkId};
use cellsim::CommandClient;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn sim_client(sim: &MockCellSim, timeout: Duration) -> CommandClient {
    CommandClient::new(sim.connect("mock"), ClientConfig::uniform(timeout))
}

// =============================================================================
// Terminal lines
// =============================================================================

#[tokio::test]
async fn test_terminal_line_ends_exchange_early() {
    let sim = MockCellSim::new();
    let mut client = sim_client(&sim, Duration::from_secs(1));

    let start = Instant::now();
    let response = client.send("PING").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(response.len(), 1);
    assert_eq!(response.outcome(), Outcome::Success("PONG"));
    assert!(
        elapsed < Duration::from_millis(500),
        "terminal line should not wait for the deadline, took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_error_reply_is_single_failure_line() {
    let sim = MockCellSim::new();
    let mut client = sim_client(&sim, Duration::from_secs(1));

    let response = client.send("FROB 1").await.unwrap();
    assert_eq!(
        response.lines(),
        &[ResponseLine::Failure("Unknown command".to_string())]
    );
    assert_eq!(response.outcome(), Outcome::Failure("Unknown command"));
}

#[tokio::test]
async fn test_progress_lines_precede_terminal() {
    let sim = MockCellSim::with_channels(4);
    let mut client = sim_client(&sim, Duration::from_secs(1));

    let response = client.send("CALIBRATE_ALL").await.unwrap();
    assert_eq!(response.len(), 5);
    assert!(response.lines()[..4]
        .iter()
        .all(|line| matches!(line, ResponseLine::Plain(_))));
    assert_eq!(response.outcome(), Outcome::Success("CALIBRATE_ALL"));
}

#[tokio::test]
async fn test_telemetry_interleaved_with_reply() {
    let sim = MockCellSim::new().with_telemetry(true);
    let mut client = sim_client(&sim, Duration::from_secs(1));

    let response = client.send("GETV 1").await.unwrap();
    assert_eq!(
        response.to_text_lines(),
        vec![">Loop time(us): 412", "OK:voltage:0.000000"]
    );
}

// =============================================================================
// Deadlines
// =============================================================================

#[tokio::test]
async fn test_silent_device_bounded_by_deadline() {
    let (host, _device) = tokio::io::duplex(256);
    let link = Link::new(LinkId::from("silent"), Box::new(host));
    let mut client = CommandClient::new(link, ClientConfig::uniform(Duration::from_millis(150)));

    let start = Instant::now();
    let response = client.send("GETALLV").await.unwrap();
    let elapsed = start.elapsed();

    assert!(response.is_empty());
    assert_eq!(response.outcome(), Outcome::Indeterminate);
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(650), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_device_closing_mid_reply_still_bounded() {
    let (host, device) = tokio::io::duplex(256);
    let link = Link::new(LinkId::from("flaky"), Box::new(host));
    let mut client = CommandClient::new(link, ClientConfig::uniform(Duration::from_millis(120)));

    tokio::spawn(async move {
        let mut device = BufReader::new(device);
        let mut line = String::new();
        device.read_line(&mut line).await.unwrap();
        device.get_mut().write_all(b"Setting cell\n").await.unwrap();
        // Dropping the device end leaves the host at end of input
    });

    let start = Instant::now();
    let response = client.send("SETV 1 3.0").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(response.to_text_lines(), vec!["Setting cell"]);
    assert_eq!(response.outcome(), Outcome::Indeterminate);
    assert!(elapsed >= Duration::from_millis(120));
    assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_category_deadlines_apply() {
    let (host, _device) = tokio::io::duplex(256);
    let link = Link::new(LinkId::from("silent"), Box::new(host));
    let config = ClientConfig {
        default_timeout_ms: 40,
        set_voltage_timeout_ms: 40,
        bulk_read_timeout_ms: 250,
        poll_interval_ms: 1,
    };
    let mut client = CommandClient::new(link, config);

    let start = Instant::now();
    client.send("PING").await.unwrap();
    let short = start.elapsed();

    let start = Instant::now();
    client.send("GETALLI").await.unwrap();
    let long = start.elapsed();

    assert!(short < Duration::from_millis(200), "PING took {:?}", short);
    assert!(long >= Duration::from_millis(250), "GETALLI took {:?}", long);
}

// =============================================================================
// Stale input
// =============================================================================

#[tokio::test]
async fn test_stale_bytes_discarded_before_send() {
    let (host, device) = tokio::io::duplex(256);
    let link = Link::new(LinkId::from("stale"), Box::new(host));
    let mut client = CommandClient::new(link, ClientConfig::uniform(Duration::from_millis(500)));

    let mut device = BufReader::new(device);
    device
        .get_mut()
        .write_all(b"OK:stale\nError:older\n")
        .await
        .unwrap();

    let responder = tokio::spawn(async move {
        let mut line = String::new();
        device.read_line(&mut line).await.unwrap();
        device.get_mut().write_all(b"OK:PONG\n").await.unwrap();
        device
    });

    let response = client.send("PING").await.unwrap();
    assert_eq!(response.outcome(), Outcome::Success("PONG"));
    assert_eq!(response.len(), 1);
    drop(responder.await.unwrap());
}

#[tokio::test]
async fn test_late_reply_does_not_leak_into_next_exchange() {
    let sim = MockCellSim::new().with_response_delay(Duration::from_millis(150));
    let mut client = sim_client(&sim, Duration::from_millis(50));

    let first = client.send("GETV 1").await.unwrap();
    assert_eq!(first.outcome(), Outcome::Indeterminate);

    // Let the late voltage reply land in the link buffer
    tokio::time::sleep(Duration::from_millis(250)).await;

    client.set_uniform_timeout(Duration::from_millis(600));
    let second = client.send("PING").await.unwrap();
    assert_eq!(second.lines(), &[ResponseLine::Success("PONG".to_string())]);
}

#[tokio::test]
async fn test_bulk_read_is_idempotent() {
    let sim = MockCellSim::new();
    let mut client = sim_client(&sim, Duration::from_secs(1));

    client.send("SETALLV 2.5").await.unwrap();
    let first = client.send("GETALLV").await.unwrap();
    let second = client.send("GETALLV").await.unwrap();

    assert!(first.is_success());
    assert_eq!(first, second);
    assert_eq!(
        sim.received_commands().await,
        vec!["SETALLV 2.5", "GETALLV", "GETALLV"]
    );
}
