//! Per-connection send and receive buffering.
//!
//! Sockets are non-blocking, so a command may be only partly written or partly
//! received at any time. [`SendBuffer`] holds whatever the socket would not take yet.
//! [`RecvBuffer`] accumulates bytes until a whole command is present; an incomplete
//! command is rewound and retried on the next poll instead of being treated as an error.

use std::io;

use crate::error::NetplayError;
use crate::network::codec;
use crate::network::messages::{Command, CommandId, HandshakeHeader, PayloadLimits, HEADER_LEN};
use crate::StreamSocket;

const READ_CHUNK: usize = 4096;

/// Default send queue capacity before a blocking flush is forced.
pub const DEFAULT_SEND_CAPACITY: usize = 64 * 1024;

/// Outgoing bytes not yet accepted by the socket.
#[derive(Debug)]
pub struct SendBuffer {
    data: Vec<u8>,
    sent: usize,
    capacity: usize,
}

impl SendBuffer {
    /// Creates an empty buffer that flushes once it would exceed `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            sent: 0,
            capacity,
        }
    }

    /// Bytes still waiting to be sent.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.data.len() - self.sent
    }

    /// Whether everything has been sent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Queues bytes, first flushing with blocking if they would not fit.
    pub fn queue(&mut self, socket: &mut dyn StreamSocket, bytes: &[u8]) -> io::Result<()> {
        if self.pending() + bytes.len() > self.capacity {
            self.flush(socket, true)?;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Encodes and queues a command.
    pub fn queue_command(
        &mut self,
        socket: &mut dyn StreamSocket,
        command: &Command,
    ) -> Result<(), NetplayError> {
        let bytes = command.to_bytes()?;
        self.queue(socket, &bytes)?;
        Ok(())
    }

    /// Sends as much as possible, or everything when `blocking`.
    pub fn flush(&mut self, socket: &mut dyn StreamSocket, blocking: bool) -> io::Result<()> {
        if blocking {
            let rest = self.data.get(self.sent..).unwrap_or_default();
            socket.send_all_blocking(rest)?;
            self.sent = self.data.len();
        } else {
            while self.sent < self.data.len() {
                let rest = self.data.get(self.sent..).unwrap_or_default();
                match socket.send(rest) {
                    Ok(0) => break,
                    Ok(n) => self.sent += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        if self.sent == self.data.len() {
            self.data.clear();
            self.sent = 0;
        }
        Ok(())
    }
}

/// Incoming bytes, consumed one whole command at a time.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    data: Vec<u8>,
    read: usize,
}

impl RecvBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet committed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.data.len()
    }

    /// Reads everything the socket has without blocking.
    ///
    /// Returns the number of new bytes. An orderly close by the peer is an error of kind
    /// [`io::ErrorKind::UnexpectedEof`].
    pub fn fill(&mut self, socket: &mut dyn StreamSocket) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match socket.recv(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                },
                Ok(n) => {
                    self.data.extend_from_slice(chunk.get(..n).unwrap_or_default());
                    total += n;
                    if n < chunk.len() {
                        return Ok(total);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Takes exactly `n` bytes, or `None` if fewer are buffered.
    pub fn take(&mut self, n: usize) -> Option<&[u8]> {
        let end = self.read.checked_add(n)?;
        let slice = self.data.get(self.read..end)?;
        self.read = end;
        Some(slice)
    }

    /// Rewinds to the last committed position.
    pub fn reset(&mut self) {
        self.read = 0;
    }

    /// Discards everything taken since the last commit.
    pub fn commit(&mut self) {
        self.data.drain(..self.read);
        self.read = 0;
    }

    /// Takes one whole command if it has fully arrived.
    ///
    /// The header's size is checked against `limits` as soon as the header is present,
    /// so an oversized command is rejected without waiting for its payload.
    pub fn next_command(
        &mut self,
        limits: &PayloadLimits,
    ) -> Result<Option<Command>, NetplayError> {
        let (raw_id, size) = match self.take(HEADER_LEN) {
            Some(header) => (codec::read_u32(header, 0)?, codec::read_u32(header, 4)? as usize),
            None => {
                self.reset();
                return Ok(None);
            },
        };
        let id = CommandId::from_u32(raw_id).ok_or_else(|| {
            NetplayError::violation(format!("unknown command 0x{raw_id:02x}"))
        })?;
        id.check_size(size, limits)?;
        let command = match self.take(size) {
            Some(payload) => Command::decode(id, payload)?,
            None => {
                self.reset();
                return Ok(None);
            },
        };
        self.commit();
        Ok(Some(command))
    }

    /// Takes the peer's handshake header if it has fully arrived.
    pub fn next_handshake_header(&mut self) -> Result<Option<HandshakeHeader>, NetplayError> {
        let header = match self.take(HandshakeHeader::LEN) {
            Some(bytes) => codec::decode_value(bytes)?,
            None => {
                self.reset();
                return Ok(None);
            },
        };
        self.commit();
        Ok(Some(header))
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
    use crate::network::memory_socket::MemoryStream;
    use crate::Frame;

    #[test]
    fn short_reads_rewind_until_complete() {
        let (mut a, mut b) = MemoryStream::pair();
        let bytes = Command::Crc {
            frame: Frame::new(9),
            crc: 0xABCD,
        }
        .to_bytes()
        .unwrap();

        a.send_all_blocking(&bytes[..5]).unwrap();
        let mut recv = RecvBuffer::new();
        recv.fill(&mut b).unwrap();
        let limits = PayloadLimits::default();
        assert_eq!(recv.next_command(&limits).unwrap(), None);
        assert_eq!(recv.buffered(), 5);

        a.send_all_blocking(&bytes[5..12]).unwrap();
        recv.fill(&mut b).unwrap();
        assert_eq!(recv.next_command(&limits).unwrap(), None);

        a.send_all_blocking(&bytes[12..]).unwrap();
        recv.fill(&mut b).unwrap();
        assert_eq!(
            recv.next_command(&limits).unwrap(),
            Some(Command::Crc {
                frame: Frame::new(9),
                crc: 0xABCD
            })
        );
        assert_eq!(recv.buffered(), 0);
    }

    #[test]
    fn two_commands_in_one_read() {
        let (mut a, mut b) = MemoryStream::pair();
        let mut bytes = Command::Ack.to_bytes().unwrap();
        Command::Resume.encode(&mut bytes).unwrap();
        a.send_all_blocking(&bytes).unwrap();

        let mut recv = RecvBuffer::new();
        recv.fill(&mut b).unwrap();
        let limits = PayloadLimits::default();
        assert_eq!(recv.next_command(&limits).unwrap(), Some(Command::Ack));
        assert_eq!(recv.next_command(&limits).unwrap(), Some(Command::Resume));
        assert_eq!(recv.next_command(&limits).unwrap(), None);
    }

    #[test]
    fn oversized_header_is_rejected_before_payload() {
        let (mut a, mut b) = MemoryStream::pair();
        // LOAD_SAVESTATE announcing a megabyte, only the header sent.
        a.send_all_blocking(&[0, 0, 0, 0x42, 0, 0x10, 0, 0]).unwrap();
        let mut recv = RecvBuffer::new();
        recv.fill(&mut b).unwrap();
        let err = recv.next_command(&PayloadLimits::default()).unwrap_err();
        assert!(matches!(err, NetplayError::ProtocolViolation { .. }));
    }

    #[test]
    fn unknown_command_is_a_violation() {
        let (mut a, mut b) = MemoryStream::pair();
        a.send_all_blocking(&[0, 0, 0, 0x99, 0, 0, 0, 0]).unwrap();
        let mut recv = RecvBuffer::new();
        recv.fill(&mut b).unwrap();
        assert!(recv.next_command(&PayloadLimits::default()).is_err());
    }

    #[test]
    fn closed_peer_is_eof() {
        let (a, mut b) = MemoryStream::pair();
        drop(a);
        let mut recv = RecvBuffer::new();
        let err = recv.fill(&mut b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn take_and_commit() {
        let (mut a, mut b) = MemoryStream::pair();
        a.send_all_blocking(&[1, 2, 3, 4]).unwrap();
        let mut recv = RecvBuffer::new();
        assert_eq!(recv.fill(&mut b).unwrap(), 4);
        assert_eq!(recv.take(2), Some(&[1u8, 2][..]));
        assert_eq!(recv.take(3), None);
        recv.reset();
        assert_eq!(recv.take(3), Some(&[1u8, 2, 3][..]));
        recv.commit();
        assert_eq!(recv.take(1), Some(&[4u8][..]));
    }

    #[test]
    fn send_buffer_flushes_when_full() {
        let (mut a, mut b) = MemoryStream::pair();
        let mut send = SendBuffer::new(8);
        send.queue(&mut a, &[1; 6]).unwrap();
        assert_eq!(send.pending(), 6);
        send.queue(&mut a, &[2; 6]).unwrap();
        // The first six went out blocking to make room.
        assert_eq!(send.pending(), 6);
        send.flush(&mut a, false).unwrap();
        assert!(send.is_empty());

        let mut recv = RecvBuffer::new();
        assert_eq!(recv.fill(&mut b).unwrap(), 12);
    }
}
