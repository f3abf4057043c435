//! TCP transport over `std::net`.

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
};

use web_time::Duration;

use crate::{StreamListener, StreamSocket};

/// A non-blocking TCP stream to one peer, with Nagle disabled.
#[derive(Debug)]
pub struct TcpStreamSocket {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpStreamSocket {
    /// Connects (blocking) and switches the stream to non-blocking mode.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::from_stream(TcpStream::connect(addr)?)
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }
}

impl StreamSocket for TcpStreamSocket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.write(buf) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn send_all_blocking(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.set_nonblocking(false)?;
        let result = self.stream.write_all(buf);
        self.stream.set_nonblocking(true)?;
        result
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            other => other,
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut probe = [0u8; 1];
        if timeout.is_zero() {
            return match self.stream.peek(&mut probe) {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            };
        }
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(timeout))?;
        let result = match self.stream.peek(&mut probe) {
            // A zero-length peek means EOF, which the next recv reports.
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(false)
            },
            Err(e) => Err(e),
        };
        self.stream.set_read_timeout(None)?;
        self.stream.set_nonblocking(true)?;
        result
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// A non-blocking TCP listener for the server side.
#[derive(Debug)]
pub struct TcpListenerSocket {
    listener: TcpListener,
}

impl TcpListenerSocket {
    /// Binds to `addr` and switches the listener to non-blocking mode.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    /// The bound address, useful after binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl StreamListener for TcpListenerSocket {
    fn accept(&mut self) -> io::Result<Option<Box<dyn StreamSocket>>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted netplay connection");
                Ok(Some(Box::new(TcpStreamSocket::from_stream(stream)?)))
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn accept_one(listener: &mut TcpListenerSocket) -> Box<dyn StreamSocket> {
        for _ in 0..200 {
            if let Some(socket) = listener.accept().unwrap() {
                return socket;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("no connection accepted");
    }

    #[test]
    #[serial]
    fn loopback_send_and_receive() {
        let mut listener = TcpListenerSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStreamSocket::connect(addr).unwrap();
        let mut server = accept_one(&mut listener);

        assert!(!server.wait_readable(Duration::ZERO).unwrap());
        client.send_all_blocking(b"ranp").unwrap();
        assert!(server.wait_readable(Duration::from_millis(500)).unwrap());

        let mut buf = [0u8; 8];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ranp");
        assert_eq!(client.peer_addr(), Some(addr));
    }

    #[test]
    #[serial]
    fn closed_peer_reports_eof() {
        let mut listener = TcpListenerSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStreamSocket::connect(addr).unwrap();
        let mut server = accept_one(&mut listener);
        drop(client);

        assert!(server.wait_readable(Duration::from_millis(500)).unwrap());
        let mut buf = [0u8; 8];
        let err = server.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    #[serial]
    fn accept_without_pending_is_none() {
        let mut listener = TcpListenerSocket::bind("127.0.0.1:0").unwrap();
        assert!(listener.accept().unwrap().is_none());
    }
}
