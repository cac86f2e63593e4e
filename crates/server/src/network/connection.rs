//! Client connection
//!
//! Owns the non-blocking socket, the receive and send buffers and the
//! [`Session`] of one client. The reactor calls [`Connection::pump`] whenever
//! the socket becomes ready and [`Connection::deliver`] for device
//! completions; the connection never blocks.

use super::session::{Session, SessionError};
use bytes::{Buf, BytesMut};
use common::{SessionId, UrbCompletion};
use mio::net::TcpStream;
use protocol::{Decoded, Message, ProtocolError, decode, encode_into};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Reasons a connection is torn down
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Malformed message: {0}")]
    Malformed(#[source] ProtocolError),

    #[error("Protocol violation: {0}")]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode reply: {0}")]
    Encode(#[source] ProtocolError),
}

/// One accepted client
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    session: Session,
    recv_buf: BytesMut,
    send_buf: BytesMut,
    max_send_buffer: usize,
    /// Reading stopped because `send_buf` reached `max_send_buffer`
    read_paused: bool,
    last_activity: Instant,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        session: Session,
        max_send_buffer: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            session,
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            max_send_buffer,
            read_paused: false,
            last_activity: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Bytes queued for the peer
    pub fn pending_send(&self) -> usize {
        self.send_buf.len()
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused
    }

    /// Read, dispatch and flush until the socket would block
    ///
    /// `scratch` is the reactor's shared read buffer.
    pub fn pump(&mut self, scratch: &mut [u8]) -> Result<(), ConnectionError> {
        loop {
            self.read_ready(scratch)?;
            self.write_ready()?;
            if !(self.read_paused && self.send_buf.len() < self.max_send_buffer) {
                return Ok(());
            }
            trace!("{}: send buffer drained, resuming reads", self.peer);
        }
    }

    /// Drain the socket into the receive buffer, dispatching complete messages
    fn read_ready(&mut self, scratch: &mut [u8]) -> Result<(), ConnectionError> {
        loop {
            if self.send_buf.len() >= self.max_send_buffer {
                if !self.read_paused {
                    debug!(
                        "{}: {} bytes unsent, pausing reads",
                        self.peer,
                        self.send_buf.len()
                    );
                }
                self.read_paused = true;
                return Ok(());
            }

            match self.stream.read(scratch) {
                Ok(0) => return Err(ConnectionError::PeerClosed),
                Ok(n) => {
                    trace!("{}: read {} bytes", self.peer, n);
                    self.recv_buf.extend_from_slice(&scratch[..n]);
                    self.last_activity = Instant::now();
                    self.process()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_paused = false;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Decode and dispatch every complete message in the receive buffer
    fn process(&mut self) -> Result<(), ConnectionError> {
        loop {
            match decode(&self.recv_buf[..]).map_err(ConnectionError::Malformed)? {
                Decoded::Complete { message, consumed } => {
                    self.recv_buf.advance(consumed);
                    if let Some(reply) = self.session.handle_message(message)? {
                        self.queue(&reply)?;
                    }
                }
                Decoded::NeedMoreBytes => return Ok(()),
            }
        }
    }

    /// Write as much of the send buffer as the socket accepts
    pub fn write_ready(&mut self) -> Result<(), ConnectionError> {
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    trace!("{}: wrote {} bytes", self.peer, n);
                    self.send_buf.advance(n);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Queue the replies for a device completion: its RET_SUBMIT, then any
    /// RET_UNLINK that waited for it. Returns whether anything was queued.
    pub fn deliver(&mut self, completion: UrbCompletion) -> Result<bool, ConnectionError> {
        let replies = self.session.handle_completion(completion);
        for reply in &replies {
            self.queue(reply)?;
        }
        Ok(!replies.is_empty())
    }

    fn queue(&mut self, message: &Message) -> Result<(), ConnectionError> {
        trace!("{}: queueing {}", self.peer, message.name());
        encode_into(message, &mut self.send_buf).map_err(ConnectionError::Encode)
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Close the session, then the socket
    pub fn close(&mut self) {
        self.session.close();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("{}: shutdown: {}", self.peer, e);
        }
    }
}
