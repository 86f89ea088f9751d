//! Byte level I/O over an already established adapter link.
//!
//! This crate never opens sockets or pairs devices itself. Discovery and
//! pairing code hands over a connected byte stream (an RFCOMM socket, a
//! TCP stream to a WiFi adapter, a USB serial port) and [StreamTransport]
//! turns it into the line oriented, timeout bounded interface the rest of
//! the crate is built on.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    io::{ErrorKind, Read, Write},
    sync::Arc,
    time::{Duration, Instant},
};

/// Transport operation result
pub type TransportResult<T> = Result<T, TransportError>;

/// Interval between polls while waiting for adapter bytes
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a transport
pub enum TransportError {
    /// IO error on the physical link
    #[error("IO error")]
    Io(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// No line terminator arrived within the read budget
    #[error("Timed out waiting for data")]
    TimedOut,
    /// The transport has been closed
    #[error("Transport is closed")]
    Closed,
}

/// Line oriented transport over a half duplex adapter link.
///
/// Implementations are not required to be internally synchronized.
/// [crate::connection::ConnectionManager] funnels every call through a
/// single guard, so no two operations ever touch the link concurrently.
pub trait Transport: Send {
    /// Writes raw bytes and flushes the link
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Polls for bytes until a terminator (`\r`, `\n`) or the ELM prompt
    /// `>` arrives, or until `timeout_ms` elapses.
    ///
    /// Returns the accumulated, trimmed text. A terminating prompt is kept
    /// in the returned string so callers can detect the end of a response.
    /// On timeout, bytes accumulated so far must be retained for the next
    /// call - a slow adapter never causes data loss.
    fn read_line(&mut self, timeout_ms: u32) -> TransportResult<String>;

    /// Drains whatever is currently buffered without waiting.
    /// Returns an empty string when nothing is pending.
    fn read_available(&mut self) -> TransportResult<String>;

    /// Best effort close of the underlying handles. Idempotent, never fails.
    fn close(&mut self);
}

/// [Transport] over any injected byte stream.
///
/// The stream's `read` must return [ErrorKind::WouldBlock] or
/// [ErrorKind::TimedOut] when no data is pending. Serial ports configured
/// with a short timeout and sockets in nonblocking mode both behave this
/// way; a stream that blocks indefinitely would defeat the poll loop.
pub struct StreamTransport<S: Read + Write + Send> {
    stream: Option<S>,
    pending: Vec<u8>,
}

impl<S: Read + Write + Send> Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "StreamTransport {{ open: {}, pending: {} }}",
            self.stream.is_some(),
            self.pending.len()
        )
    }
}

impl<S: Read + Write + Send> StreamTransport<S> {
    /// Wraps an already connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            pending: Vec::new(),
        }
    }

    /// Pulls whatever the stream has ready into the pending buffer.
    /// Returns false once the peer has hung up.
    fn fill_pending(&mut self) -> TransportResult<bool> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf) {
                // EOF means the remote side closed the link
                Ok(0) => return Ok(false),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(true);
                }
                Err(e) => return Err(TransportError::Io(Arc::new(e))),
            }
        }
    }

    /// Takes one line out of the pending buffer if a terminator is present
    fn take_line(&mut self) -> Option<String> {
        let pos = self
            .pending
            .iter()
            .position(|b| matches!(b, b'\r' | b'\n' | b'>'))?;
        let terminator = self.pending[pos];
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        if terminator != b'>' {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn write(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        stream
            .write_all(bytes)
            .and_then(|_| stream.flush())
            .map_err(|e| TransportError::Io(Arc::new(e)))
    }

    fn read_line(&mut self, timeout_ms: u32) -> TransportResult<String> {
        let start = Instant::now();
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if !self.fill_pending()? {
                // Flush out anything buffered before reporting the hangup
                if let Some(line) = self.take_line() {
                    return Ok(line);
                }
                return Err(TransportError::Closed);
            }
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if start.elapsed().as_millis() >= timeout_ms as u128 {
                return Err(TransportError::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn read_available(&mut self) -> TransportResult<String> {
        let _ = self.fill_pending()?;
        let drained: Vec<u8> = self.pending.drain(..).collect();
        Ok(String::from_utf8_lossy(&drained).to_string())
    }

    fn close(&mut self) {
        self.pending.clear();
        // Dropping the stream releases the underlying handles
        self.stream = None;
    }
}

#[cfg(feature = "serialport")]
impl StreamTransport<Box<dyn serialport::SerialPort>> {
    /// Wraps an already opened serial port, configuring a short read
    /// timeout so the poll loop never blocks indefinitely.
    pub fn from_serial(mut port: Box<dyn serialport::SerialPort>) -> TransportResult<Self> {
        port.set_timeout(POLL_INTERVAL)
            .map_err(|e| TransportError::Io(Arc::new(e.into())))?;
        Ok(Self::new(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Read/Write stub that yields scripted bytes then reports WouldBlock
    struct FakeStream {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl FakeStream {
        fn with(data: &[u8]) -> Self {
            Self {
                rx: data.iter().copied().collect(),
                tx: Vec::new(),
            }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "no data"));
            }
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_lines_and_keeps_prompt() {
        let mut t = StreamTransport::new(FakeStream::with(b"41 00 BE 3F E8 11\r\r>"));
        assert_eq!(t.read_line(100).unwrap(), "41 00 BE 3F E8 11");
        assert_eq!(t.read_line(100).unwrap(), "");
        assert_eq!(t.read_line(100).unwrap(), ">");
    }

    #[test]
    fn partial_line_survives_timeout() {
        let mut t = StreamTransport::new(FakeStream::with(b"41 0C"));
        assert!(matches!(t.read_line(0), Err(TransportError::TimedOut)));
        // Terminator arrives later
        t.pending.extend_from_slice(b" 1A F8\r");
        assert_eq!(t.read_line(100).unwrap(), "41 0C 1A F8");
    }

    #[test]
    fn read_available_drains_without_blocking() {
        let mut t = StreamTransport::new(FakeStream::with(b"OK\r"));
        assert_eq!(t.read_available().unwrap(), "OK\r");
        assert_eq!(t.read_available().unwrap(), "");
    }

    #[test]
    fn close_is_idempotent() {
        let mut t = StreamTransport::new(FakeStream::with(b""));
        t.close();
        t.close();
        assert!(matches!(t.read_line(10), Err(TransportError::Closed)));
        assert!(matches!(t.write(b"ATZ\r"), Err(TransportError::Closed)));
    }
}
