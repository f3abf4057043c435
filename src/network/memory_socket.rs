//! In-process stream sockets.
//!
//! [`MemoryStream::pair`] returns two connected ends of a byte pipe; a
//! [`MemoryListener`] hands out such pairs the way a TCP listener accepts
//! connections. They let whole sessions run against each other inside one process,
//! deterministically, with no ports involved.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use web_time::Duration;

use crate::{StreamListener, StreamSocket};

static NEXT_PORT: AtomicU16 = AtomicU16::new(40_000);

#[derive(Debug, Default)]
struct PipeState {
    bytes: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

/// One end of an in-memory byte stream.
#[derive(Debug)]
pub struct MemoryStream {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    peer: SocketAddr,
}

impl MemoryStream {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (MemoryStream, MemoryStream) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let port_a = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let port_b = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let a = MemoryStream {
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
            peer: SocketAddr::from((Ipv4Addr::LOCALHOST, port_b)),
        };
        let b = MemoryStream {
            incoming: a_to_b,
            outgoing: b_to_a,
            peer: SocketAddr::from((Ipv4Addr::LOCALHOST, port_a)),
        };
        (a, b)
    }

    /// Closes both directions, as if the link dropped.
    pub fn shutdown(&self) {
        {
            let mut out = self.outgoing.state.lock();
            out.writer_closed = true;
        }
        self.outgoing.readable.notify_all();
        self.incoming.state.lock().reader_closed = true;
    }

    /// Bytes written by the peer and not yet read.
    #[must_use]
    pub fn available(&self) -> usize {
        self.incoming.state.lock().bytes.len()
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StreamSocket for MemoryStream {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut out = self.outgoing.state.lock();
            if out.reader_closed || out.writer_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "memory stream closed",
                ));
            }
            out.bytes.extend(buf.iter().copied());
        }
        self.outgoing.readable.notify_all();
        Ok(buf.len())
    }

    fn send_all_blocking(&mut self, buf: &[u8]) -> io::Result<()> {
        self.send(buf).map(|_| ())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.incoming.state.lock();
        if state.bytes.is_empty() {
            if state.writer_closed {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ));
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(state.bytes.len());
        for (dst, src) in buf.iter_mut().zip(state.bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut state = self.incoming.state.lock();
        if state.bytes.is_empty() && !state.writer_closed && !timeout.is_zero() {
            let _ = self.incoming.readable.wait_for(&mut state, timeout);
        }
        Ok(!state.bytes.is_empty() || state.writer_closed)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Hands out in-memory connections to a server.
///
/// Clones share the same pending queue, so a test keeps one clone to
/// [`connect`](MemoryListener::connect) while the session owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryListener {
    pending: Arc<Mutex<VecDeque<MemoryStream>>>,
}

impl MemoryListener {
    /// Creates a listener with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection; the server end is accepted on the next poll.
    #[must_use]
    pub fn connect(&self) -> MemoryStream {
        let (client, server) = MemoryStream::pair();
        self.pending.lock().push_back(server);
        client
    }
}

impl StreamListener for MemoryListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn StreamSocket>>> {
        Ok(self
            .pending
            .lock()
            .pop_front()
            .map(|s| Box::new(s) as Box<dyn StreamSocket>))
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

    #[test]
    fn bytes_flow_both_ways() {
        let (mut a, mut b) = MemoryStream::pair();
        a.send(b"ping").unwrap();
        b.send(b"pong!").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(a.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"pong!");
    }

    #[test]
    fn empty_pipe_would_block() {
        let (_a, mut b) = MemoryStream::pair();
        let mut buf = [0u8; 4];
        let err = b.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(!b.wait_readable(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn shutdown_drains_then_eof() {
        let (mut a, mut b) = MemoryStream::pair();
        a.send(b"last").unwrap();
        a.shutdown();
        assert!(a.send(b"more").is_err());

        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(
            b.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
        assert!(b.wait_readable(Duration::ZERO).unwrap());
    }

    #[test]
    fn sending_to_dropped_peer_fails() {
        let (mut a, b) = MemoryStream::pair();
        drop(b);
        assert_eq!(
            a.send(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[test]
    fn listener_accepts_in_order() {
        let listener = MemoryListener::new();
        let mut server_side = listener.clone();
        assert!(server_side.accept().unwrap().is_none());

        let mut first = listener.connect();
        let _second = listener.connect();
        let mut accepted = server_side.accept().unwrap().unwrap();
        first.send(b"1").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(accepted.recv(&mut buf).unwrap(), 1);
        assert!(server_side.accept().unwrap().is_some());
        assert!(server_side.accept().unwrap().is_none());
    }

    #[test]
    fn peers_know_each_others_address() {
        let (a, b) = MemoryStream::pair();
        assert_ne!(a.peer_addr(), b.peer_addr());
    }
}
