//! Line-framed TCP server
//!
//! One tokio task per accepted session. Each request line is answered with
//! exactly one response line, in order. Stalled replies are held by the
//! session task only; other sessions keep being served.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use mtap_core::MAX_LINE_BYTES;

use crate::{Dispatcher, DutError, DutResult, ServerConfig};

/// Stops a running [`DutServer`]
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting and close idle sessions
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// DUT simulator server
pub struct DutServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownHandle,
}

impl DutServer {
    /// Bind the listener; port 0 picks an ephemeral port
    pub async fn bind(config: &ServerConfig) -> DutResult<Self> {
        let addr = config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| DutError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let dispatcher = Dispatcher::new(
            config.profile,
            config.tuning.clone(),
            config.seed,
            config.defaults.clone(),
        );
        let (tx, _rx) = watch::channel(false);

        info!(
            addr = %local_addr,
            profile = %config.profile,
            seed = config.seed,
            "dut listening"
        );

        Ok(DutServer {
            listener,
            local_addr,
            dispatcher: Arc::new(dispatcher),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared dispatcher, for inspection
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Drop all device state and restore the initial profile and seed
    pub fn reset(&self) {
        self.dispatcher.reset();
    }

    /// Accept sessions until shut down
    pub async fn run(self) -> DutResult<()> {
        let mut stop = self.shutdown.tx.subscribe();

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "session opened");
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let stop = self.shutdown.tx.subscribe();
                        tokio::spawn(async move {
                            match serve_session(stream, dispatcher, stop).await {
                                Ok(()) => debug!(peer = %peer, "session closed"),
                                Err(e) => warn!(peer = %peer, error = %e, "session ended"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        info!(addr = %self.local_addr, "dut stopped");
        Ok(())
    }
}

/// Serve one connection: read a line, dispatch, write one line back.
/// EOF, a read error, invalid UTF-8 or a line over [`MAX_LINE_BYTES`] ends
/// the session.
async fn serve_session(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut buf) => read?,
            _ = stop.changed() => break,
        };
        if read == 0 {
            break;
        }
        if buf.len() >= MAX_LINE_BYTES && !buf.ends_with(b"\n") {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request line too long"));
        }
        let line = std::str::from_utf8(&buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let Some(reply) = dispatcher.dispatch_line(line) else {
            continue;
        };

        if let Some(stall) = &reply.stall {
            tokio::time::sleep(stall.delay).await;
            dispatcher.finish_stall(stall);
        }

        writer.write_all(reply.response.to_line().as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}
