//! Owned non-blocking TCP socket, a thin veneer over socket2.

use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};

/// A non-blocking TCP socket that closes its descriptor on drop.
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a fresh non-blocking stream socket in the address family of
    /// `addr`.
    pub fn tcp_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let socket = socket2::Socket::new(
            Domain::for_address(*addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        Ok(Socket { inner: socket })
    }

    /// Adopt an accepted socket, switching it to non-blocking mode.
    pub fn from_accepted(socket: socket2::Socket) -> io::Result<Socket> {
        socket.set_nonblocking(true)?;
        Ok(Socket { inner: socket })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(*addr))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection. `WouldBlock` when the backlog is
    /// empty.
    pub fn accept(&self) -> io::Result<(socket2::Socket, SocketAddr)> {
        let (socket, sockaddr) = self.inner.accept()?;
        let addr = sockaddr
            .as_socket()
            .ok_or_else(|| io::Error::other("accepted a non-inet peer address"))?;
        Ok((socket, addr))
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    /// Close the write side, letting queued data and the FIN drain out.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self
            .inner
            .local_addr()?
            .as_socket()
            .unwrap_or_else(unspecified_addr))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self
            .inner
            .peer_addr()?
            .as_socket()
            .unwrap_or_else(unspecified_addr))
    }

    /// Consume and return the pending socket error (SO_ERROR), if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    /// One non-blocking write.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }
}

fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn bind_listen_accept_round_trip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::tcp_nonblocking(&addr).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);

        // nothing pending yet
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let client = TcpStream::connect(bound).unwrap();
        // give the kernel a moment to finish the handshake
        let mut accepted = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
        let (socket, peer) = accepted.expect("no connection accepted");
        assert_eq!(peer, client.local_addr().unwrap());

        let socket = Socket::from_accepted(socket).unwrap();
        assert_eq!(socket.write(b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        let mut client = client;
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn shutdown_write_sends_fin() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let socket = Socket::from_accepted(socket2::Socket::from(server_side)).unwrap();
        socket.set_nodelay(true).unwrap();
        socket.shutdown_write().unwrap();

        let mut client = client;
        let mut buf = [0u8; 1];
        // read sees EOF once the FIN arrives
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn take_error_is_empty_on_healthy_socket() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::tcp_nonblocking(&addr).unwrap();
        assert!(socket.take_error().unwrap().is_none());
    }
}
