// Integration tests for the APRS client's reconnect behavior, using a local
// TCP listener standing in for an APRS-IS server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mqtt_aprs::aprs_client::{AprsClient, AprsClientConfigBuilder, PositionHandler};
use mqtt_aprs::position::PositionReport;

struct NullHandler;

#[async_trait]
impl PositionHandler for NullHandler {
    async fn handle_position(&self, _report: PositionReport) {}
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<PositionReport>,
}

#[async_trait]
impl PositionHandler for ChannelHandler {
    async fn handle_position(&self, report: PositionReport) {
        let _ = self.tx.send(report);
    }
}

/// A server that drops every connection immediately forces the client through
/// its fixed-backoff reconnect path: with a 1 second delay we expect at least
/// two connection attempts inside 2 x backoff + slack, and the loop must keep
/// going rather than give up.
#[tokio::test]
async fn test_reconnects_with_fixed_backoff() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let accepted_counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                accepted_counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        }
    });

    let client = AprsClient::new(
        AprsClientConfigBuilder::new()
            .server("127.0.0.1")
            .port(port)
            .callsign("M0TEST")
            .filter(Some("r/51.5/-0.1/50"))
            .retry_delay_seconds(1)
            .incoming_enabled(true)
            .build(),
    );
    client.start(Arc::new(NullHandler));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let attempts = accepted.load(Ordering::SeqCst);
    assert!(attempts >= 2, "expected at least 2 connect attempts, saw {attempts}");
    // Fixed 1s backoff bounds how many attempts fit in the window
    assert!(attempts <= 5, "expected bounded retry rate, saw {attempts}");

    client.stop();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let after_stop = accepted.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        accepted.load(Ordering::SeqCst),
        after_stop,
        "client kept reconnecting after stop()"
    );
}

/// Full receive pipeline: a mock server feeds one position packet and the
/// parsed report must reach the injected handler.
#[tokio::test]
async fn test_inbound_position_reaches_handler() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream
                    .write_all(b"# aprsc 2.1.19 mock server\r\n")
                    .await;
                let _ = stream
                    .write_all(
                        b"ICA3D17F2>APRS,qAS,dl4mea:/074849h4821.61N\\01224.49E^322/103/A=003054\r\n",
                    )
                    .await;
                let _ = stream.flush().await;
                // Hold the connection open so the client keeps reading
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    });

    let client = AprsClient::new(
        AprsClientConfigBuilder::new()
            .server("127.0.0.1")
            .port(port)
            .callsign("M0TEST")
            .filter(Some("r/48.0/12.0/100"))
            .retry_delay_seconds(1)
            .incoming_enabled(true)
            .build(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.start(Arc::new(ChannelHandler { tx }));

    let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for position report")
        .expect("channel closed without a report");

    assert_eq!(report.sender, "ICA3D17F2");
    assert!((report.latitude - 48.360_166).abs() < 0.0001);
    assert!((report.longitude - 12.408_166).abs() < 0.0001);

    client.stop();
}

/// Disabled incoming traffic means start() must not touch the network.
#[tokio::test]
async fn test_disabled_listener_never_connects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let accepted_counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            if let Ok(_conn) = listener.accept().await {
                accepted_counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let client = AprsClient::new(
        AprsClientConfigBuilder::new()
            .server("127.0.0.1")
            .port(port)
            .callsign("M0TEST")
            .incoming_enabled(false)
            .build(),
    );
    client.start(Arc::new(NullHandler));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

/// A server that accepts and then never reads must not stall send_packet
/// past the one-shot timeout. The packet is sized past the kernel socket
/// buffers so the write genuinely blocks; paused time fast-forwards the
/// timeout itself.
#[tokio::test(start_paused = true)]
async fn test_oneshot_send_is_bounded_against_stalled_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        }
    });

    let client = AprsClient::new(
        AprsClientConfigBuilder::new()
            .server("127.0.0.1")
            .port(port)
            .callsign("M0TEST")
            .build(),
    );

    let packet = format!("M0TEST-7>APRS,TCPIP*:>{}\n", "X".repeat(32 * 1024 * 1024));

    let started = tokio::time::Instant::now();
    client.send_packet(&packet).await;
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_secs(9),
        "send gave up before the timeout: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(60),
        "send was not bounded: {elapsed:?}"
    );
}

/// With no listener running, send_packet opens a one-shot connection, logs
/// in, transmits, and closes.
#[tokio::test]
async fn test_send_packet_uses_oneshot_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    use tokio::io::{AsyncBufReadExt, BufReader};
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let _ = tx.send(line);
                    }
                });
            }
        }
    });

    let client = AprsClient::new(
        AprsClientConfigBuilder::new()
            .server("127.0.0.1")
            .port(port)
            .callsign("M0TEST")
            .password(Some("12345"))
            .build(),
    );

    client
        .send_packet("M0TEST-7>APRS,TCPIP*:=5130.00N/00007.20W> mqtt-aprs\n")
        .await;

    let login = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for login line")
        .unwrap();
    assert_eq!(login, "user M0TEST pass 12345 vers \"mqtt-aprs\"");

    let packet = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for packet line")
        .unwrap();
    assert_eq!(
        packet,
        "M0TEST-7>APRS,TCPIP*:=5130.00N/00007.20W> mqtt-aprs"
    );
}
