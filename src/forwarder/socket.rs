use std::{io, net::SocketAddr};

use tokio::net::{TcpListener, TcpSocket, TcpStream};

const BACKLOG: u32 = 8;

/// Listen on `address` with address reuse, so a restart can rebind at once.
pub(crate) fn listen(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    socket.listen(BACKLOG)
}

/// Tune a freshly adopted client connection.
///
/// Keep-alive probes start after one idle second and give up after five,
/// so a vanished peer frees the port quickly.
pub(crate) fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    keepalive(stream)
}

#[cfg(target_os = "linux")]
fn keepalive(stream: &TcpStream) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    setsockopt(fd, sockopt::KeepAlive, &true)?;
    setsockopt(fd, sockopt::TcpKeepIdle, &1)?;
    setsockopt(fd, sockopt::TcpKeepInterval, &1)?;
    setsockopt(fd, sockopt::TcpKeepCount, &5)?;

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn keepalive(_stream: &TcpStream) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rebind_right_after_close() {
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let address = listener.local_addr().unwrap();

        let client = TcpStream::connect(address).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        configure(&server).unwrap();
        assert!(server.nodelay().unwrap());

        drop(server);
        drop(client);
        drop(listener);

        assert!(listen(address).is_ok());
    }
}
