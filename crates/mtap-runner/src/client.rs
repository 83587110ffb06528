//! Protocol client
//!
//! One request line out, one response line back, under a deadline covering
//! connect, write and read. A deadline miss yields a synthesized `E_TIMEOUT`
//! and drops the connection: v1 has no correlation id, so a late reply must
//! never be read as the answer to a later request.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use mtap_core::{Command, CommandName, ErrorCode, ProtocolError, Response, MAX_LINE_BYTES};

use crate::ClientError;

/// Default per-call deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Client configuration
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// DUT address, `host:port`
    pub addr: String,
    /// Deadline applied by [`ProtocolClient::call`]
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:9000".into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        ClientConfig {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(reader),
            writer,
        })
    }
}

/// Line-protocol client holding at most one connection
pub struct ProtocolClient {
    config: ClientConfig,
    conn: Option<Connection>,
}

impl ProtocolClient {
    pub fn new(config: ClientConfig) -> Self {
        ProtocolClient { config, conn: None }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a connection is currently held open
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Drop the connection, if any
    pub fn close(&mut self) {
        self.conn = None;
    }

    /// Send with the configured default deadline
    pub async fn call(&mut self, command: &Command) -> Result<Response, ClientError> {
        let timeout = self.config.timeout;
        self.send(command, timeout).await
    }

    /// Send one command and wait at most `timeout` for its reply.
    ///
    /// Deadline misses and malformed replies come back as synthesized error
    /// responses; connection-level failures as `Err`.
    pub async fn send(&mut self, command: &Command, timeout: Duration) -> Result<Response, ClientError> {
        let line = command.to_line();

        match tokio::time::timeout(timeout, self.exchange(&line)).await {
            Ok(Ok(raw)) => match decode(raw) {
                Ok(response) => {
                    debug!(cmd = command.name(), ok = response.ok, "reply");
                    Ok(response)
                }
                Err(e) => {
                    warn!(cmd = command.name(), error = %e, "malformed reply");
                    Ok(Response::error(ErrorCode::Internal, e.to_string()))
                }
            },
            Ok(Err(e)) => {
                self.conn = None;
                warn!(cmd = command.name(), error = %e, "transport failure");
                Err(e)
            }
            Err(_) => {
                self.conn = None;
                warn!(
                    cmd = command.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "client timeout"
                );
                Ok(Response::error(
                    ErrorCode::Timeout,
                    format!("Client timeout after {:.3}s", timeout.as_secs_f64()),
                ))
            }
        }
    }

    /// PING `sn` and return its firmware version
    pub async fn firmware_version(&mut self, sn: &str) -> Option<String> {
        let ping = Command::new(CommandName::Ping.as_str(), [sn]);
        match self.call(&ping).await {
            Ok(resp) if resp.ok => resp.data_str("fw").map(str::to_string),
            _ => None,
        }
    }

    async fn exchange(&mut self, line: &str) -> Result<Vec<u8>, ClientError> {
        if self.conn.is_none() {
            let conn = Connection::open(&self.config.addr).await?;
            self.conn = Some(conn);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(ClientError::Closed);
        };

        conn.writer.write_all(line.as_bytes()).await?;
        conn.writer.flush().await?;

        let mut reply = Vec::new();
        (&mut conn.reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut reply)
            .await?;
        if !reply.ends_with(b"\n") {
            if reply.len() >= MAX_LINE_BYTES {
                return Err(ClientError::Io(format!("reply exceeds {} bytes", MAX_LINE_BYTES)));
            }
            return Err(ClientError::Closed);
        }
        Ok(reply)
    }
}

/// Parse one complete reply line. Bytes that are not UTF-8 are a malformed
/// reply, not a transport failure: the line boundary is still intact.
fn decode(raw: Vec<u8>) -> Result<Response, ProtocolError> {
    let line = String::from_utf8(raw).map_err(|e| ProtocolError::MalformedResponse(e.to_string()))?;
    Response::from_line(&line)
}
