//! Response framing strategies.
//!
//! The protocol carries no length prefix, so the end of a response has to
//! be inferred. All strategies share one rule: the first byte is awaited
//! until the statement deadline, and a connection that closes before any
//! byte arrives is a reset, never an empty response.

use std::io::{self, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::STATEMENT_TERMINATOR;
use crate::error::SendError;

/// Default quiet gap for [`ResponseFraming::Idle`].
pub const DEFAULT_IDLE_GAP: Duration = Duration::from_millis(10);

/// How the client decides a response is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFraming {
    /// Read until the socket stays quiet for the gap, a chunk ends with a
    /// NUL byte, or the response cap is reached.
    Idle(Duration),
    /// Read until the given byte is seen. The terminator is not part of the
    /// response.
    Terminator(u8),
    /// Exactly one `recv` of at most the buffer size.
    SingleRead,
}

impl Default for ResponseFraming {
    fn default() -> Self {
        Self::Idle(DEFAULT_IDLE_GAP)
    }
}

/// Raw bytes of one response.
#[derive(Debug)]
pub(crate) struct Frame {
    pub bytes: BytesMut,
    pub truncated: bool,
}

impl Frame {
    fn complete(bytes: BytesMut) -> Self {
        Self {
            bytes,
            truncated: false,
        }
    }

    fn capped(mut bytes: BytesMut, max_bytes: usize) -> Self {
        bytes.truncate(max_bytes);
        Self {
            bytes,
            truncated: true,
        }
    }
}

impl ResponseFraming {
    /// Reads one response from `stream`.
    ///
    /// `timeout` bounds the whole read, measured from `started`.
    pub(crate) fn read(
        self,
        stream: &mut TcpStream,
        chunk_size: usize,
        max_bytes: usize,
        timeout: Duration,
        started: Instant,
    ) -> Result<Frame, SendError> {
        let deadline = started + timeout;
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let mut buf = BytesMut::with_capacity(chunk.len());

        let wait = time_left(deadline).ok_or(SendError::Timeout(timeout))?;
        let n = read_chunk(stream, &mut chunk, wait).map_err(|e| SendError::from_io(timeout, &e))?;
        if n == 0 {
            return Err(SendError::ConnectionReset(
                "connection closed before a response arrived".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        match self {
            Self::SingleRead => Ok(Frame::complete(buf)),
            Self::Terminator(terminator) => loop {
                if let Some(pos) = buf.iter().position(|&b| b == terminator) {
                    buf.truncate(pos);
                    return Ok(Frame::complete(buf));
                }
                if buf.len() >= max_bytes {
                    return Ok(Frame::capped(buf, max_bytes));
                }
                let wait = time_left(deadline).ok_or(SendError::Timeout(timeout))?;
                let n = read_chunk(stream, &mut chunk, wait)
                    .map_err(|e| SendError::from_io(timeout, &e))?;
                if n == 0 {
                    return Ok(Frame::complete(buf));
                }
                buf.extend_from_slice(&chunk[..n]);
            },
            Self::Idle(gap) => loop {
                if buf.last() == Some(&STATEMENT_TERMINATOR) {
                    return Ok(Frame::complete(buf));
                }
                if buf.len() >= max_bytes {
                    return Ok(Frame::capped(buf, max_bytes));
                }
                let Some(left) = time_left(deadline) else {
                    return Ok(Frame::complete(buf));
                };
                let wait = if gap.is_zero() { left } else { gap.min(left) };
                match read_chunk(stream, &mut chunk, wait) {
                    Ok(0) => return Ok(Frame::complete(buf)),
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) if is_timeout(&e) => return Ok(Frame::complete(buf)),
                    Err(e) => return Err(SendError::from_io(timeout, &e)),
                }
            },
        }
    }
}

fn time_left(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn read_chunk(stream: &mut TcpStream, chunk: &mut [u8], wait: Duration) -> io::Result<usize> {
    stream.set_read_timeout(Some(wait))?;
    loop {
        match stream.read(chunk) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}
