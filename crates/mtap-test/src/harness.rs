//! In-process DUT harness
//!
//! Each harness owns an independent server with its own device state,
//! fault profile and seed, so tests never share state.

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mtap_core::{FaultProfile, Response};
use mtap_dut::{Dispatcher, DutResult, DutServer, FaultTuning, ServerConfig, ShutdownHandle};
use mtap_runner::{ClientConfig, ProtocolClient, RunnerConfig, RunnerEngine};

static TRACING: Once = Once::new();

/// Route test logs through `RUST_LOG` (default `warn`)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// A running DUT server, stopped on drop
pub struct DutHarness {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownHandle,
}

impl DutHarness {
    /// Start a server on an ephemeral loopback port
    pub async fn start(config: ServerConfig) -> DutResult<Self> {
        init_tracing();
        let profile = config.profile;
        let server = DutServer::bind(&config.with_host("127.0.0.1").with_port(0)).await?;
        let harness = DutHarness {
            addr: server.local_addr(),
            dispatcher: server.dispatcher(),
            shutdown: server.shutdown_handle(),
        };
        info!(addr = %harness.addr, profile = %profile, "dut harness started");
        tokio::spawn(server.run());
        Ok(harness)
    }

    pub async fn clean() -> DutResult<Self> {
        Self::start(ServerConfig::local()).await
    }

    pub async fn with_profile(profile: FaultProfile, tuning: FaultTuning, seed: u64) -> DutResult<Self> {
        Self::start(
            ServerConfig::local()
                .with_profile(profile)
                .with_tuning(tuning)
                .with_seed(seed),
        )
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Server-side state, for assertions
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn client_config(&self, timeout: Duration) -> ClientConfig {
        ClientConfig::new(self.addr.to_string()).with_timeout(timeout)
    }

    pub fn client(&self, timeout: Duration) -> ProtocolClient {
        ProtocolClient::new(self.client_config(timeout))
    }

    /// Runner pointed at this server with no backoff
    pub fn runner(&self, timeout: Duration) -> RunnerEngine {
        RunnerEngine::new(
            RunnerConfig::default()
                .with_client(self.client_config(timeout))
                .with_backoff(Duration::ZERO)
                .with_batch("BATCH-TEST", "STATION-TEST"),
        )
    }

    /// Open a raw line session
    pub async fn session(&self) -> std::io::Result<LineSession> {
        LineSession::connect(self.addr).await
    }
}

impl Drop for DutHarness {
    fn drop(&mut self) {
        debug!(addr = %self.addr, "dut harness stopped");
        self.shutdown.shutdown();
    }
}

/// Raw request/response lines over one connection
pub struct LineSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineSession {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let (reader, writer) = TcpStream::connect(addr).await?.into_split();
        Ok(LineSession {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// Next reply line, terminator included; empty at EOF
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        Ok(line)
    }

    /// Send one request and decode its reply
    pub async fn request(&mut self, line: &str) -> std::io::Result<Response> {
        self.write_raw(format!("{}\n", line.trim_end()).as_bytes()).await?;
        let reply = self.read_line().await?;
        Response::from_line(&reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }
}
