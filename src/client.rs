//! Telnet-style client for connecting to a DX cluster.
//!
//! This module owns the TCP session to the cluster: it logs in, sends the
//! configured filter commands, waits for the server's prompt and then hands
//! raw bytes to the caller through [`FeedConnector::poll`].
//!
//! Reconnection is a timed state rather than a sleeping task. When the
//! session fails the connector records a retry deadline and every `poll()`
//! waits at most `poll_timeout` towards it, so the calling loop keeps
//! running its housekeeping and can be shut down while backing off.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

/// Default DX cluster host.
pub const DEFAULT_HOST: &str = "cluster.n2wq.com";

/// Default DX cluster port.
pub const DEFAULT_PORT: u16 = 7373;

/// Stop buffering handshake output beyond this many bytes.
const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

/// Errors from the feed connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to {addr} timed out")]
    Timeout { addr: String },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Login handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("No data for {0:?}, connection may be stale")]
    Stale(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gave up after {attempts} reconnect attempts (last error: {last_error})")]
    Exhausted { attempts: u32, last_error: String },
}

impl ClientError {
    /// Whether this error ends ingestion. Everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Exhausted { .. })
    }
}

/// Lifecycle of the cluster session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    LoggedIn,
    Streaming,
    Reconnecting,
    Failed,
}

/// Configuration for the feed connection.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Hostname of the cluster.
    pub host: String,

    /// Port number.
    pub port: u16,

    /// Login identifier sent as the first line.
    pub login: String,

    /// Commands sent after the login line, e.g. `SET/SKIMMER`.
    pub login_commands: Vec<String>,

    /// Text the server sends once it is ready to stream. Empty to skip waiting.
    pub ready_marker: String,

    /// Bound on TCP connect plus the login handshake.
    pub connect_timeout: Duration,

    /// Longest a single `poll()` may wait.
    pub poll_timeout: Duration,

    /// A streaming session silent for this long is treated as dead.
    pub read_timeout: Duration,

    /// First reconnect delay; doubles with each consecutive failure.
    pub reconnect_base_delay: Duration,

    /// Consecutive failed attempts tolerated before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            login: "N0CALL".to_string(),
            login_commands: vec![
                "SET/SKIMMER".to_string(),
                "SET/NOCW".to_string(),
                "SET/NORTTY".to_string(),
            ],
            ready_marker: ">".to_string(),
            connect_timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(120),
            reconnect_base_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

impl FeedConfig {
    /// Create a new configuration with the given login.
    pub fn with_login(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            ..Default::default()
        }
    }

    /// Set the host and port.
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Exponential backoff with a cap on consecutive attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the cap is used up.
    ///
    /// Yields `base`, `2 * base`, `4 * base`, ...
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << self.attempts.min(16);
        self.attempts += 1;
        Some(self.base.saturating_mul(factor))
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// What a single [`FeedConnector::poll`] produced.
#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    /// Bytes read from the server, in arrival order.
    Data(Vec<u8>),

    /// Nothing arrived within the poll timeout.
    Timeout,

    /// Waiting out a reconnect delay; `remaining` is left on it.
    Backoff { remaining: Duration },

    /// A new session replaced a failed one. Partial lines from the old
    /// session must be discarded.
    Reconnected,
}

/// Resilient cluster connection.
pub struct FeedConnector {
    config: FeedConfig,
    state: ConnectionState,
    stream: Option<TcpStream>,
    /// Bytes received during the handshake after the ready marker.
    pending: Vec<u8>,
    read_buf: Vec<u8>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    /// When the current session last delivered bytes.
    last_data: Instant,
    last_delay: Option<Duration>,
    reconnects: u64,
}

impl FeedConnector {
    /// Create a disconnected connector.
    pub fn new(config: FeedConfig) -> Self {
        let backoff = Backoff::new(config.reconnect_base_delay, config.max_reconnect_attempts);
        Self {
            config,
            state: ConnectionState::Disconnected,
            stream: None,
            pending: Vec::new(),
            read_buf: vec![0; 4096],
            backoff,
            retry_at: None,
            last_data: Instant::now(),
            last_delay: None,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// The most recently scheduled reconnect delay.
    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Consecutive failed attempts since the last successful session.
    pub fn failed_attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    /// Sessions re-established after a failure.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Connect and log in.
    ///
    /// On failure the connector is left in `Reconnecting` with a retry
    /// scheduled, and the connection error is returned. If the attempt cap
    /// is already used up, `ClientError::Exhausted` is returned instead.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.schedule_retry(&e)?;
                Err(e)
            }
        }
    }

    /// Wait at most `poll_timeout` for the next bytes from the server.
    ///
    /// Read errors and EOF move the connector to `Reconnecting`; the retry
    /// happens in a later `poll()` once its delay has elapsed. Only
    /// exhausting the reconnect cap returns an error.
    pub async fn poll(&mut self) -> Result<PollOutcome, ClientError> {
        match self.state {
            ConnectionState::Failed => Err(ClientError::Exhausted {
                attempts: self.backoff.attempts(),
                last_error: "connector already failed".to_string(),
            }),
            ConnectionState::Streaming => self.poll_stream().await,
            _ => self.poll_reconnect().await,
        }
    }

    /// Drop the session, e.g. on shutdown.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            info!("Disconnected from {}", self.config.addr());
        }
        self.pending.clear();
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }

    async fn poll_stream(&mut self) -> Result<PollOutcome, ClientError> {
        if !self.pending.is_empty() {
            return Ok(PollOutcome::Data(std::mem::take(&mut self.pending)));
        }

        let Some(stream) = self.stream.as_mut() else {
            let delay = self.schedule_retry(&ClientError::Closed)?;
            return Ok(PollOutcome::Backoff { remaining: delay });
        };

        let failure = match timeout(self.config.poll_timeout, stream.read(&mut self.read_buf)).await
        {
            Err(_) => {
                let idle = self.last_data.elapsed();
                if idle < self.config.read_timeout {
                    return Ok(PollOutcome::Timeout);
                }
                ClientError::Stale(idle)
            }
            Ok(Ok(0)) => ClientError::Closed,
            Ok(Ok(n)) => {
                self.last_data = Instant::now();
                return Ok(PollOutcome::Data(self.read_buf[..n].to_vec()));
            }
            Ok(Err(e)) => ClientError::Io(e),
        };

        warn!("Feed connection lost: {}", failure);
        let delay = self.schedule_retry(&failure)?;
        Ok(PollOutcome::Backoff { remaining: delay })
    }

    async fn poll_reconnect(&mut self) -> Result<PollOutcome, ClientError> {
        if let Some(retry_at) = self.retry_at {
            let now = Instant::now();
            if now < retry_at {
                let wait = (retry_at - now).min(self.config.poll_timeout);
                tokio::time::sleep(wait).await;
                let now = Instant::now();
                if now < retry_at {
                    return Ok(PollOutcome::Backoff {
                        remaining: retry_at - now,
                    });
                }
            }
        }

        info!(
            "Reconnect attempt {}/{}",
            self.backoff.attempts(),
            self.config.max_reconnect_attempts
        );
        match self.establish().await {
            Ok(()) => {
                self.reconnects += 1;
                Ok(PollOutcome::Reconnected)
            }
            Err(e) => {
                let delay = self.schedule_retry(&e)?;
                Ok(PollOutcome::Backoff { remaining: delay })
            }
        }
    }

    /// Record a failure and schedule the next attempt.
    fn schedule_retry(&mut self, cause: &ClientError) -> Result<Duration, ClientError> {
        self.stream = None;
        self.pending.clear();

        match self.backoff.next_delay() {
            Some(delay) => {
                self.state = ConnectionState::Reconnecting;
                self.retry_at = Some(Instant::now() + delay);
                self.last_delay = Some(delay);
                warn!(
                    "Connection error: {}; retrying in {:.1}s (attempt {}/{})",
                    cause,
                    delay.as_secs_f64(),
                    self.backoff.attempts(),
                    self.config.max_reconnect_attempts
                );
                Ok(delay)
            }
            None => {
                self.state = ConnectionState::Failed;
                self.retry_at = None;
                error!(
                    "Giving up on {} after {} reconnect attempts: {}",
                    self.config.addr(),
                    self.backoff.attempts(),
                    cause
                );
                Err(ClientError::Exhausted {
                    attempts: self.backoff.attempts(),
                    last_error: cause.to_string(),
                })
            }
        }
    }

    /// Connect, log in and wait for the ready marker.
    async fn establish(&mut self) -> Result<(), ClientError> {
        let addr = self.config.addr();
        self.state = ConnectionState::Connecting;
        info!("Connecting to {}...", addr);

        let handshake = async {
            let mut stream = TcpStream::connect(&addr)
                .await
                .map_err(|source| ClientError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            info!("Connected to {}", addr);

            stream
                .write_all(format!("{}\n", self.config.login).as_bytes())
                .await?;
            for command in &self.config.login_commands {
                debug!("Sending command: {}", command);
                stream.write_all(format!("{}\n", command).as_bytes()).await?;
            }
            stream.flush().await?;
            info!("Sent login {}", self.config.login);

            let leftover = wait_for_marker(&mut stream, self.config.ready_marker.as_bytes()).await?;
            Ok::<_, ClientError>((stream, leftover))
        };

        let (stream, leftover) = match timeout(self.config.connect_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::Timeout { addr }),
        };

        self.state = ConnectionState::LoggedIn;
        self.stream = Some(stream);
        self.pending = leftover;
        self.retry_at = None;
        self.last_data = Instant::now();
        self.backoff.reset();
        self.state = ConnectionState::Streaming;
        info!("Streaming from {}", addr);
        Ok(())
    }
}

/// Read until `marker` shows up, returning whatever followed it.
async fn wait_for_marker(stream: &mut TcpStream, marker: &[u8]) -> Result<Vec<u8>, ClientError> {
    if marker.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ClientError::Handshake(
                "connection closed before the server was ready".to_string(),
            ));
        }
        seen.extend_from_slice(&buf[..n]);

        if let Some(pos) = find(&seen, marker) {
            debug!(
                "Handshake: {}",
                String::from_utf8_lossy(&seen[..pos]).trim_end()
            );
            return Ok(seen.split_off(pos + marker.len()));
        }

        if seen.len() > MAX_HANDSHAKE_BYTES {
            let keep = marker.len() - 1;
            seen.drain(..seen.len() - keep);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> FeedConfig {
        FeedConfig {
            login_commands: vec!["SET/SKIMMER".to_string()],
            connect_timeout: Duration::from_secs(2),
            poll_timeout: Duration::from_millis(50),
            reconnect_base_delay: Duration::from_millis(20),
            max_reconnect_attempts: 10,
            ..FeedConfig::with_login("LZ3NY").with_server("127.0.0.1", port)
        }
    }

    /// Accept one session: read the login and one command, greet, then send `payload`.
    async fn serve_once(listener: TcpListener, payload: &'static [u8]) -> Vec<String> {
        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);
        let mut received = Vec::new();
        for _ in 0..2 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            received.push(line.trim_end().to_string());
        }
        writer.write_all(b"Hello LZ3NY\r\nN2WQ-2>").await.unwrap();
        writer.write_all(payload).await.unwrap();
        writer.flush().await.unwrap();
        received
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_default_config() {
        let config = FeedConfig::default();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.reconnect_base_delay, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.read_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_builder() {
        let config = FeedConfig::with_login("LZ3NY").with_server("test.example.com", 1234);

        assert_eq!(config.login, "LZ3NY");
        assert_eq!(config.host, "test.example.com");
        assert_eq!(config.port, 1234);
    }

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = Backoff::new(Duration::from_secs(5), 10);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(20)));
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_backoff_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(1), 3);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_backoff_large_attempts_saturate() {
        let mut backoff = Backoff::new(Duration::from_secs(5), 100);
        let last = (0..100).filter_map(|_| backoff.next_delay()).last().unwrap();
        assert!(last >= Duration::from_secs(5 * 65536));
    }

    #[test]
    fn test_find_marker() {
        assert_eq!(find(b"abc>def", b">"), Some(3));
        assert_eq!(find(b"abc", b"de>"), None);
    }

    #[tokio::test]
    async fn test_connect_logs_in_and_keeps_leftover() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, b"\r\nDX de VE3EID-#: 14074.00"));

        let mut connector = FeedConnector::new(test_config(port));
        connector.connect().await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Streaming);

        let received = server.await.unwrap();
        assert_eq!(received, vec!["LZ3NY", "SET/SKIMMER"]);

        let mut bytes = Vec::new();
        while bytes.len() < 26 {
            match connector.poll().await.unwrap() {
                PollOutcome::Data(chunk) => bytes.extend(chunk),
                PollOutcome::Timeout => {}
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(bytes, b"\r\nDX de VE3EID-#: 14074.00");
    }

    #[tokio::test]
    async fn test_poll_times_out_without_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"login ok >").await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut connector = FeedConnector::new(test_config(port));
        connector.connect().await.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(connector.poll().await.unwrap(), PollOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_millis(400));
        server.abort();
    }

    #[tokio::test]
    async fn test_backoff_then_resume_streaming() {
        let port = closed_port().await;
        let mut connector = FeedConnector::new(test_config(port));

        let err = connector.connect().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(connector.state(), ConnectionState::Reconnecting);

        let mut delays = vec![connector.last_delay().unwrap()];
        while delays.len() < 3 {
            let before = connector.failed_attempts();
            let outcome = connector.poll().await.unwrap();
            assert!(matches!(outcome, PollOutcome::Backoff { .. }));
            if connector.failed_attempts() > before {
                delays.push(connector.last_delay().unwrap());
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
            ]
        );

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let server = tokio::spawn(serve_once(listener, b""));

        loop {
            match connector.poll().await.unwrap() {
                PollOutcome::Reconnected => break,
                PollOutcome::Backoff { .. } => {}
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        assert_eq!(connector.state(), ConnectionState::Streaming);
        assert_eq!(connector.failed_attempts(), 0);
        assert_eq!(connector.reconnects(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let port = closed_port().await;
        let mut config = test_config(port);
        config.max_reconnect_attempts = 2;
        config.reconnect_base_delay = Duration::from_millis(5);
        let mut connector = FeedConnector::new(config);

        assert!(connector.connect().await.is_err());
        let err = loop {
            match connector.poll().await {
                Ok(PollOutcome::Backoff { .. }) => {}
                Ok(other) => panic!("unexpected outcome: {:?}", other),
                Err(e) => break e,
            }
        };
        assert!(err.is_fatal());
        assert_eq!(connector.state(), ConnectionState::Failed);
        assert!(connector.poll().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_server_close_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut reader = BufReader::new(reader);
            for _ in 0..2 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
            }
            writer.write_all(b">").await.unwrap();
            listener
        });

        let mut connector = FeedConnector::new(test_config(port));
        connector.connect().await.unwrap();
        let _listener = server.await.unwrap();

        let outcome = loop {
            match connector.poll().await.unwrap() {
                PollOutcome::Timeout => continue,
                other => break other,
            }
        };
        assert_eq!(
            outcome,
            PollOutcome::Backoff {
                remaining: Duration::from_millis(20)
            }
        );
        assert_eq!(connector.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_silent_session_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut reader = BufReader::new(reader);
            for _ in 0..2 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
            }
            writer.write_all(b"ready >").await.unwrap();
            // Keep the socket open but never send another byte.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(reader);
        });

        let mut config = test_config(port);
        config.read_timeout = Duration::from_millis(300);
        let mut connector = FeedConnector::new(config);
        connector.connect().await.unwrap();

        let started = std::time::Instant::now();
        let mut timeouts = 0;
        let outcome = loop {
            match connector.poll().await.unwrap() {
                PollOutcome::Timeout => timeouts += 1,
                other => break other,
            }
            assert!(started.elapsed() < Duration::from_secs(3), "never dropped");
        };

        assert!(timeouts >= 1);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(
            outcome,
            PollOutcome::Backoff {
                remaining: Duration::from_millis(20)
            }
        );
        assert_eq!(connector.state(), ConnectionState::Reconnecting);
        server.abort();
    }
}
