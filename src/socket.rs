//! Socket setup and introspection.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listener, requesting `buffer_size` for SO_SNDBUF/SO_RCVBUF before
/// `listen` so accepted sockets inherit it.
pub fn bind_listener(addr: SocketAddr, buffer_size: Option<usize>) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Some(size) = buffer_size {
        request_buffer_sizes(&socket, size);
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Create an unconnected client socket with the requested buffer sizes.
pub fn client_socket(addr: SocketAddr, buffer_size: Option<usize>) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(size) = buffer_size {
        request_buffer_sizes(&SockRef::from(&socket), size);
    }
    Ok(socket)
}

fn request_buffer_sizes(socket: &Socket, size: usize) {
    if let Err(e) = socket.set_send_buffer_size(size) {
        warn!(size, error = %e, "Could not set send buffer size");
    }
    if let Err(e) = socket.set_recv_buffer_size(size) {
        warn!(size, error = %e, "Could not set receive buffer size");
    }
    debug!(size, "Requested socket buffer sizes");
}

/// Current SO_SNDBUF and SO_RCVBUF of `stream`.
///
/// Failures are logged and reported as `None`; they never affect the
/// transfer.
pub fn buffer_sizes(stream: &TcpStream) -> (Option<usize>, Option<usize>) {
    let socket = SockRef::from(stream);
    let send = socket
        .send_buffer_size()
        .map_err(|e| warn!(error = %e, "Could not read send buffer size"))
        .ok();
    let recv = socket
        .recv_buffer_size()
        .map_err(|e| warn!(error = %e, "Could not read receive buffer size"))
        .ok();
    (send, recv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_introspect() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), Some(128 * 1024)).unwrap();
        let addr = listener.local_addr().unwrap();

        let socket = client_socket(addr, Some(128 * 1024)).unwrap();
        let (client, accepted) = tokio::join!(socket.connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, _) = accepted.unwrap();

        for stream in [&client, &server] {
            let (send, recv) = buffer_sizes(stream);
            assert!(send.unwrap() > 0);
            assert!(recv.unwrap() > 0);
        }
    }
}
