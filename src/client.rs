//! Sending side: connect, push the payload, close.

use crate::config::Config;
use crate::error::TransferError;
use crate::socket;
use crate::transport::Outbound;
use crate::writer::{ChunkWriter, SendSummary};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

/// Connect to `address`, giving up after `timeout`.
pub async fn connect(
    address: &str,
    buffer_size: Option<usize>,
    timeout: Duration,
) -> Result<TcpStream, TransferError> {
    let failure = |source: io::Error| TransferError::ConnectFailure {
        addr: address.to_string(),
        source,
    };

    let attempt = async {
        let target = resolve(address).await?;
        socket::client_socket(target, buffer_size)?
            .connect(target)
            .await
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(failure(source)),
        Err(_) => Err(TransferError::ConnectTimeout {
            addr: address.to_string(),
            timeout,
        }),
    }
}

async fn resolve(address: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve"),
        )
    })
}

/// Run one transfer of `expected_total_bytes` against the configured peer.
pub async fn run(config: &Config) -> Result<SendSummary, TransferError> {
    let address = config.address();
    let stream = connect(&address, config.socket_buffer_size, config.connect_timeout).await?;

    let (send_buffer, recv_buffer) = socket::buffer_sizes(&stream);
    info!(
        peer = %address,
        send_buffer = ?send_buffer,
        recv_buffer = ?recv_buffer,
        "Connected"
    );

    // the read half is never used but stays open until the send is done
    let (_reader, writer) = stream.into_split();
    let outbound = Outbound::spawn(writer);

    // validated to fit in usize when the config was loaded
    let len = config.expected_total_bytes as usize;
    let payload = Bytes::from(vec![config.framing.fill_byte(); len]);

    let summary = ChunkWriter::new(config.unit_size, config.write_timeout, config.close_timeout)
        .with_ack_mode(config.ack_mode)
        .with_framing(config.framing)
        .send(&outbound, payload)
        .await?;

    if let Some(report) = summary.report {
        report.emit("sender");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, TomlConfig};
    use clap::Parser;
    use tokio::io::AsyncReadExt;

    fn config(args: &[&str]) -> Config {
        let cli = CliArgs::try_parse_from(
            ["tcp-throughput", "send"].iter().copied().chain(args.iter().copied()),
        )
        .unwrap();
        Config::merge(cli, TomlConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(&addr.to_string(), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ConnectFailure { .. }));
        assert!(!err.is_write_error());
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        let err = connect("not an address", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ConnectFailure { .. }));
    }

    #[tokio::test]
    async fn test_run_sends_whole_payload() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let sink = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let config = config(&["--host", "127.0.0.1", "-p", &port, "-n", "300000", "-u", "4096"]);
        let summary = run(&config).await.unwrap();
        assert_eq!(summary.bytes_written, 300_000);
        assert_eq!(summary.units_written, 74);

        let received = sink.await.unwrap();
        assert_eq!(received.len(), 300_000);
        assert!(received.iter().all(|&b| b == 0));
    }
}
