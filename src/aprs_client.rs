use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::aprs_filters::FilterExpr;
use crate::position::PositionReport;

// No traffic for this long forces a reconnect; APRS-IS servers send keepalive
// comments every 20-30 seconds, so a healthy connection never gets close.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(300);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

// Hold the one-shot send socket open briefly so the server drains the
// packet before close.
const ONESHOT_LINGER: Duration = Duration::from_secs(2);

// Upper bound on a whole one-shot send (connect, login, packet, linger).
// The caller is the MQTT receive path; a black-holed server must not stall
// it for the OS-level TCP timeout.
const ONESHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler invoked by the receive loop for each inbound position report.
#[async_trait]
pub trait PositionHandler: Send + Sync {
    async fn handle_position(&self, report: PositionReport);
}

/// Result type for connection attempts
enum ConnectionResult {
    /// Connection ran until the server closed it
    Success,
    /// Connection could not be established
    ConnectionFailed(anyhow::Error),
    /// Connection was established but failed during operation
    OperationFailed(anyhow::Error),
}

/// Lifecycle of the logical APRS-IS connection. Owned by the receive loop;
/// transitions are logged, never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

fn transition(state: &mut ConnectionState, next: ConnectionState) {
    if *state != next {
        debug!("APRS connection state: {:?} -> {:?}", *state, next);
        *state = next;
    }
}

/// Configuration for the APRS client
#[derive(Debug, Clone)]
pub struct AprsClientConfig {
    /// APRS server hostname
    pub server: String,
    /// APRS server port
    pub port: u16,
    /// Callsign for authentication
    pub callsign: String,
    /// APRS-IS passcode; `None` logs in with "-1" (receive-only)
    pub password: Option<String>,
    /// APRS filter expression (optional)
    pub filter: Option<String>,
    /// Fixed delay between reconnection attempts in seconds
    pub retry_delay_seconds: u64,
    /// Whether the receive loop runs at all
    pub incoming_enabled: bool,
}

impl Default for AprsClientConfig {
    fn default() -> Self {
        Self {
            server: "rotate.aprs2.net".to_string(),
            port: 14580,
            callsign: "N0CALL".to_string(),
            password: None,
            filter: None,
            retry_delay_seconds: 10,
            incoming_enabled: false,
        }
    }
}

/// APRS connection manager: one logical connection to APRS-IS with a
/// reconnecting receive loop and a best-effort send path.
///
/// The receive loop owns the read half of the socket; the write half lives in
/// a shared slot so `send_packet` (called from the MQTT side) and the loop's
/// keepalive writer serialize through one mutex and never interleave writes.
pub struct AprsClient {
    config: AprsClientConfig,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    cancel: CancellationToken,
}

impl AprsClient {
    pub fn new(config: AprsClientConfig) -> Self {
        Self {
            config,
            writer: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the receive loop as a background task and return immediately.
    ///
    /// No-op when incoming traffic is disabled by configuration. Enabled but
    /// unfiltered listening proceeds with a warning: on a filtered port the
    /// server sends nothing, on a full-feed port it sends everything.
    pub fn start(&self, handler: Arc<dyn PositionHandler>) {
        if !self.config.incoming_enabled {
            info!("APRS incoming listener is disabled");
            return;
        }

        match &self.config.filter {
            None => warn!("APRS listener enabled with no filter configured"),
            Some(filter) => match filter.parse::<FilterExpr>() {
                Ok(expr) => {
                    for term in expr.unknown_terms() {
                        warn!("Unrecognized APRS filter term {:?}", term);
                    }
                }
                Err(e) => warn!("Could not validate APRS filter {:?}: {}", filter, e),
            },
        }

        let config = self.config.clone();
        let writer = self.writer.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            Self::run_listener(config, writer, cancel, handler).await;
        });
    }

    /// Signal the receive loop to stop. An in-flight read returns at the next
    /// select point or the read timeout, whichever comes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Reconnecting receive loop. Never exits except via the stop signal;
    /// every failure waits the fixed backoff and starts over.
    async fn run_listener(
        config: AprsClientConfig,
        writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
        cancel: CancellationToken,
        handler: Arc<dyn PositionHandler>,
    ) {
        let mut state = ConnectionState::Disconnected;
        let mut retry_count: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if retry_count == 0 {
                transition(&mut state, ConnectionState::Connecting);
                info!(
                    "Connecting to APRS server at {}:{}",
                    config.server, config.port
                );
            } else {
                transition(&mut state, ConnectionState::Reconnecting);
                info!(
                    "Reconnecting to APRS server at {}:{} (retry attempt {})",
                    config.server, config.port, retry_count
                );
                transition(&mut state, ConnectionState::Connecting);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = Self::connect_and_run(&config, &writer, &handler, &mut state) => result,
            };

            // The connection is gone either way; drop the shared writer so
            // send_packet falls back to one-shot connections.
            writer.lock().await.take();

            match result {
                ConnectionResult::Success => {
                    info!("APRS connection closed by server");
                    metrics::counter!("aprs.connection.server_closed_total").increment(1);
                }
                ConnectionResult::ConnectionFailed(e) => {
                    error!("APRS connection failed: {e:#}");
                    metrics::counter!("aprs.connection_failed_total").increment(1);
                }
                ConnectionResult::OperationFailed(e) => {
                    error!("APRS operation failed: {e:#}");
                    metrics::counter!("aprs.connection.operation_failed_total").increment(1);
                }
            }
            retry_count += 1;

            if config.retry_delay_seconds > 0 {
                info!(
                    "Waiting {} seconds before reconnecting",
                    config.retry_delay_seconds
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(config.retry_delay_seconds)) => {}
                }
            }
        }

        transition(&mut state, ConnectionState::Disconnected);
        writer.lock().await.take();
        info!("APRS listener stopped");
    }

    /// Resolve, connect, log in, and run the read loop until the connection
    /// dies.
    async fn connect_and_run(
        config: &AprsClientConfig,
        writer_slot: &Arc<Mutex<Option<OwnedWriteHalf>>>,
        handler: &Arc<dyn PositionHandler>,
        state: &mut ConnectionState,
    ) -> ConnectionResult {
        let server_address = format!("{}:{}", config.server, config.port);
        let socket_addrs = match tokio::net::lookup_host(&server_address).await {
            Ok(addrs) => {
                let all_addrs: Vec<_> = addrs.collect();
                if all_addrs.is_empty() {
                    return ConnectionResult::ConnectionFailed(anyhow!(
                        "DNS resolution returned no addresses for {}",
                        server_address
                    ));
                }
                let ipv4_addrs: Vec<_> = all_addrs
                    .iter()
                    .filter(|addr| addr.is_ipv4())
                    .cloned()
                    .collect();
                if ipv4_addrs.is_empty() { all_addrs } else { ipv4_addrs }
            }
            Err(e) => {
                return ConnectionResult::ConnectionFailed(anyhow!(
                    "DNS resolution failed for {}: {}",
                    server_address,
                    e
                ));
            }
        };

        // Rotate servers (rotate.aprs2.net resolves to a pool)
        let mut shuffled_addrs = socket_addrs;
        {
            use rand::seq::SliceRandom;
            let mut rng = rand::rng();
            shuffled_addrs.shuffle(&mut rng);
        }

        let mut last_error = None;
        for addr in &shuffled_addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!("Connected to APRS server at {}", addr);
                    metrics::counter!("aprs.connection.established_total").increment(1);
                    transition(state, ConnectionState::Connected);
                    return Self::process_connection(stream, config, writer_slot, handler).await;
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        ConnectionResult::ConnectionFailed(anyhow!(
            "Failed to connect to any resolved address for {}: {:?}",
            server_address,
            last_error
        ))
    }

    /// Log in over an established connection, publish the write half to the
    /// shared slot, and consume lines until something breaks.
    async fn process_connection(
        stream: TcpStream,
        config: &AprsClientConfig,
        writer_slot: &Arc<Mutex<Option<OwnedWriteHalf>>>,
        handler: &Arc<dyn PositionHandler>,
    ) -> ConnectionResult {
        let (reader, mut writer) = stream.into_split();
        let mut buf_reader = BufReader::new(reader);

        let login_cmd = Self::build_login_command(config);
        debug!("Sending login: {}", login_cmd.trim());
        if let Err(e) = writer.write_all(login_cmd.as_bytes()).await {
            return ConnectionResult::OperationFailed(anyhow!("Failed to send login: {}", e));
        }
        if let Err(e) = writer.flush().await {
            return ConnectionResult::OperationFailed(anyhow!("Failed to flush login: {}", e));
        }

        // From here on the write half is shared with send_packet
        *writer_slot.lock().await = Some(writer);

        let mut line_buffer = Vec::new();
        let mut first_message = true;
        let mut last_keepalive = tokio::time::Instant::now();

        loop {
            line_buffer.clear();

            if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
                let mut guard = writer_slot.lock().await;
                if let Some(writer) = guard.as_mut() {
                    let keepalive = "# mqtt-aprs keepalive\r\n";
                    if let Err(e) = writer.write_all(keepalive.as_bytes()).await {
                        return ConnectionResult::OperationFailed(anyhow!(
                            "Failed to send keepalive: {}",
                            e
                        ));
                    }
                    if let Err(e) = writer.flush().await {
                        return ConnectionResult::OperationFailed(anyhow!(
                            "Failed to flush keepalive: {}",
                            e
                        ));
                    }
                    trace!("Sent keepalive to APRS server");
                }
                last_keepalive = tokio::time::Instant::now();
            }

            let read_result = timeout(
                MESSAGE_TIMEOUT,
                Self::read_line(&mut buf_reader, &mut line_buffer),
            )
            .await;

            match read_result {
                Ok(Ok(0)) => {
                    return ConnectionResult::Success;
                }
                Ok(Ok(_)) => {
                    let line = match String::from_utf8(line_buffer.clone()) {
                        Ok(valid) => valid,
                        Err(_) => {
                            debug!("Invalid UTF-8 in stream, skipping line");
                            continue;
                        }
                    };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if first_message {
                        info!("First message from server: {}", trimmed);
                        first_message = false;
                    }
                    Self::handle_line(trimmed, handler).await;
                }
                Ok(Err(e)) => {
                    return ConnectionResult::OperationFailed(anyhow!("Connection error: {}", e));
                }
                Err(_) => {
                    return ConnectionResult::OperationFailed(anyhow!(
                        "Message timeout - no data received for {} seconds",
                        MESSAGE_TIMEOUT.as_secs()
                    ));
                }
            }
        }
    }

    /// Parse one inbound line and forward position reports to the handler.
    /// Per-message failures are logged and dropped, never escalated.
    async fn handle_line(line: &str, handler: &Arc<dyn PositionHandler>) {
        if line.starts_with('#') {
            trace!("Server message: {}", line);
            metrics::counter!("aprs.raw_message.received.server_total").increment(1);
            return;
        }
        metrics::counter!("aprs.raw_message.received.aprs_total").increment(1);

        match ogn_parser::parse(line) {
            Ok(packet) => match PositionReport::from_aprs_packet(packet, chrono::Utc::now()) {
                Ok(Some(report)) => {
                    trace!("Position report from {}", report.sender);
                    metrics::counter!("aprs.position.received_total").increment(1);
                    handler.handle_position(report).await;
                }
                Ok(None) => {
                    trace!("Non-position packet: {}", line);
                }
                Err(e) => {
                    warn!("Dropping position packet: {e:#}");
                    metrics::counter!("aprs.position.rejected_total").increment(1);
                }
            },
            Err(e) => {
                debug!("Failed to parse APRS line {:?}: {}", line, e);
                metrics::counter!("aprs.raw_message.parse_error_total").increment(1);
            }
        }
    }

    /// Read a line into `buffer`, tolerating invalid UTF-8 in the stream.
    async fn read_line(
        reader: &mut BufReader<OwnedReadHalf>,
        buffer: &mut Vec<u8>,
    ) -> Result<usize> {
        match reader.read_until(b'\n', buffer).await {
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }

    /// Transmit one packet, best-effort.
    ///
    /// When the listener holds a live connection the packet goes out over it;
    /// otherwise a one-shot connection is opened, logged in, and closed again.
    /// Failures are logged and swallowed: delivery is at-most-once.
    pub async fn send_packet(&self, packet: &str) {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let result = async {
                writer.write_all(packet.as_bytes()).await?;
                writer.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await;
            match result {
                Ok(()) => {
                    debug!("Sent packet over listener connection: {}", packet.trim());
                    metrics::counter!("aprs.packet.sent_total").increment(1);
                }
                Err(e) => {
                    error!("Failed to send packet over listener connection: {}", e);
                    metrics::counter!("aprs.packet.send_error_total").increment(1);
                    // Dead writer; the receive loop will notice and reconnect
                    guard.take();
                }
            }
            return;
        }
        drop(guard);

        if let Err(e) = self.send_oneshot(packet).await {
            error!("Failed to send packet over one-shot connection: {e:#}");
            metrics::counter!("aprs.packet.send_error_total").increment(1);
        } else {
            debug!("Sent packet over one-shot connection: {}", packet.trim());
            metrics::counter!("aprs.packet.sent_total").increment(1);
        }
    }

    /// Connect, log in, send one packet, and close, all bounded by
    /// `ONESHOT_TIMEOUT`. The socket is released on every path.
    async fn send_oneshot(&self, packet: &str) -> Result<()> {
        timeout(ONESHOT_TIMEOUT, self.send_oneshot_inner(packet))
            .await
            .map_err(|_| {
                anyhow!(
                    "one-shot send timed out after {} seconds",
                    ONESHOT_TIMEOUT.as_secs()
                )
            })?
    }

    async fn send_oneshot_inner(&self, packet: &str) -> Result<()> {
        let address = format!("{}:{}", self.config.server, self.config.port);
        let mut stream = TcpStream::connect(&address)
            .await
            .with_context(|| format!("failed to connect to {address}"))?;

        let login_cmd = Self::build_login_command(&self.config);
        stream
            .write_all(login_cmd.as_bytes())
            .await
            .context("failed to send login")?;
        stream
            .write_all(packet.as_bytes())
            .await
            .context("failed to send packet")?;
        stream.flush().await.context("failed to flush packet")?;

        tokio::time::sleep(ONESHOT_LINGER).await;
        stream.shutdown().await.ok();
        Ok(())
    }

    /// Build the APRS-IS login line:
    /// `user <CALLSIGN> pass <PASS> vers "mqtt-aprs"` plus the optional
    /// filter, CRLF terminated.
    fn build_login_command(config: &AprsClientConfig) -> String {
        let mut login_cmd = format!("user {} pass ", config.callsign);

        match &config.password {
            Some(pass) => login_cmd.push_str(pass),
            None => login_cmd.push_str("-1"),
        }

        login_cmd.push_str(" vers \"mqtt-aprs\"");

        if let Some(filter) = &config.filter {
            login_cmd.push_str(" filter ");
            login_cmd.push_str(filter);
        }

        login_cmd.push_str("\r\n");
        login_cmd
    }
}

/// Builder pattern for creating APRS client configurations
pub struct AprsClientConfigBuilder {
    config: AprsClientConfig,
}

impl AprsClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AprsClientConfig::default(),
        }
    }

    pub fn server<S: Into<String>>(mut self, server: S) -> Self {
        self.config.server = server.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn callsign<S: Into<String>>(mut self, callsign: S) -> Self {
        self.config.callsign = callsign.into();
        self
    }

    pub fn password<S: Into<String>>(mut self, password: Option<S>) -> Self {
        self.config.password = password.map(|p| p.into());
        self
    }

    pub fn filter<S: Into<String>>(mut self, filter: Option<S>) -> Self {
        self.config.filter = filter.map(|f| f.into());
        self
    }

    pub fn retry_delay_seconds(mut self, seconds: u64) -> Self {
        self.config.retry_delay_seconds = seconds;
        self
    }

    pub fn incoming_enabled(mut self, enabled: bool) -> Self {
        self.config.incoming_enabled = enabled;
        self
    }

    pub fn build(self) -> AprsClientConfig {
        self.config
    }
}

impl Default for AprsClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
