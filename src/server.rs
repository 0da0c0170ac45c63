//! TCP server for measuring inbound transfers.
//!
//! Accepts connections, gives each one its own session, and feeds every
//! inbound segment to that connection's handler.

use crate::config::Config;
use crate::handler::{ConnectionHandler, ConnectionInfo, TransferHandler};
use crate::registry::ConnectionRegistry;
use crate::socket;
use crate::stats::StatsReport;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Receiver server instance
pub struct Server {
    config: Arc<Config>,
    listener: TcpListener,
    connection_limit: Arc<Semaphore>,
    registry: Arc<Mutex<ConnectionRegistry>>,
    reports: Option<mpsc::UnboundedSender<StatsReport>>,
}

impl Server {
    /// Resolve the configured address and bind the listener.
    pub async fn bind(config: Config) -> io::Result<Self> {
        let address = config.address();
        let addr = tokio::net::lookup_host(&address)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{address} did not resolve"),
                )
            })?;

        let listener = socket::bind_listener(addr, config.socket_buffer_size)?;
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            concurrency_limit = config.concurrency_limit,
            "Server listening"
        );

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.concurrency_limit)),
            registry: Arc::new(Mutex::new(ConnectionRegistry::new(
                config.concurrency_limit,
            ))),
            config: Arc::new(config),
            listener,
            reports: None,
        })
    }

    /// Also deliver every completed report to `reports`.
    #[cfg(test)]
    pub fn with_report_sink(mut self, reports: mpsc::UnboundedSender<StatsReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Mutex<ConnectionRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the runtime shuts down.
    pub async fn run(&self) -> io::Result<()> {
        loop {
            // Wait for a connection slot
            let permit = Arc::clone(&self.connection_limit)
                .acquire_owned()
                .await
                .map_err(io::Error::other)?;

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let opened = lock(&self.registry).open(peer, self.config.expected_total_bytes);
            let Some((id, session)) = opened else {
                warn!(peer = %peer, "Connection registry full, dropping connection");
                continue;
            };
            debug!(connection = id, peer = %peer, "New connection");

            let (send_buffer_size, recv_buffer_size) = socket::buffer_sizes(&stream);
            let info = ConnectionInfo {
                id,
                peer,
                send_buffer_size,
                recv_buffer_size,
            };
            let handler = TransferHandler::new(id, session, &self.config, self.reports.clone());
            let registry = Arc::clone(&self.registry);
            let read_buffer_size = self.config.read_buffer_size;

            tokio::spawn(async move {
                let mut handler = handler;
                handler.on_open(&info);
                serve_connection(stream, &mut handler, read_buffer_size).await;
                if let Some(entry) = lock(&registry).close(id) {
                    debug!(
                        connection = id,
                        open_for = ?entry.opened_at.elapsed(),
                        "Connection released"
                    );
                }
                drop(permit);
            });
        }
    }
}

fn lock(registry: &Mutex<ConnectionRegistry>) -> MutexGuard<'_, ConnectionRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read `stream` until it ends or fails, handing every segment to `handler`.
///
/// End of stream is delivered as one empty segment. `on_close` always runs
/// last.
pub async fn serve_connection<S, H>(mut stream: S, handler: &mut H, read_buffer_size: usize)
where
    S: AsyncRead + Unpin,
    H: ConnectionHandler,
{
    let mut buffer = BytesMut::with_capacity(read_buffer_size);

    loop {
        buffer.clear();
        match stream.read_buf(&mut buffer).await {
            Ok(0) => {
                handler.on_data(&[]);
                break;
            }
            Ok(_) => handler.on_data(&buffer),
            Err(e) => {
                handler.on_error(&e);
                break;
            }
        }
    }

    handler.on_close();
}
