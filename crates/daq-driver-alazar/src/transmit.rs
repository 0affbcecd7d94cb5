//! Length-prefixed streaming of finished channel arrays.
//!
//! Each logical channel has its own byte connection. A channel array is sent
//! as its native-endian `f32` bytes, split into chunks no larger than the
//! connection's transfer window, each preceded by its byte length as a
//! native-endian `u64`:
//!
//! ```text
//! [len: u64][len bytes of f32 data][len: u64][...] ...
//! ```
//!
//! The window comes from the socket's receive-buffer size, rounded down to a
//! whole number of floats. Any short write is fatal: once a frame is cut the
//! reader can no longer find the next prefix.

use std::fmt;
use std::io::Write;

use tracing::{debug, trace};

use crate::error::{AlazarError, Result};

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// One output connection with its transfer window.
pub struct Connection {
    writer: Box<dyn Write + Send>,
    window: usize,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap any writer with an explicit maximum transfer size in bytes.
    pub fn new<W: Write + Send + 'static>(writer: W, max_transfer: usize) -> Result<Self> {
        let window = max_transfer - max_transfer % SAMPLE_BYTES;
        if window == 0 {
            return Err(AlazarError::Configuration(format!(
                "transfer window of {max_transfer} bytes cannot hold one sample"
            )));
        }
        Ok(Self {
            writer: Box::new(writer),
            window,
        })
    }

    /// Wrap a socket, sizing the window from its `SO_RCVBUF`.
    #[cfg(unix)]
    pub fn from_socket<S>(socket: S) -> Result<Self>
    where
        S: std::os::fd::AsRawFd + Write + Send + 'static,
    {
        let max_transfer = receive_buffer_size(socket.as_raw_fd())?;
        debug!(max_transfer, "socket transfer window");
        Self::new(socket, max_transfer)
    }

    /// Chunk size in bytes, a multiple of 4.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn receive_buffer_size(fd: std::os::fd::RawFd) -> Result<usize> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `len` are live for the call and `len` is the size
    // of `value`; an invalid fd makes getsockopt fail rather than write.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(usize::try_from(value).unwrap_or(0))
}

/// Sends channel A and B arrays over two connections.
#[derive(Debug)]
pub struct StreamTransmitter {
    channels: [Connection; 2],
    scratch: Vec<u8>,
    frames_sent: u64,
}

impl StreamTransmitter {
    /// Transmitter writing channel A to `ch1` and B to `ch2`.
    #[must_use]
    pub fn new(ch1: Connection, ch2: Connection) -> Self {
        let largest = ch1.window.max(ch2.window);
        Self {
            channels: [ch1, ch2],
            scratch: Vec::with_capacity(largest),
            frames_sent: 0,
        }
    }

    /// Completed `send` calls.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Give the connections back for reuse by a later acquisition.
    #[must_use]
    pub fn into_connections(self) -> [Connection; 2] {
        self.channels
    }

    /// Transmit one finished acquisition unit.
    pub fn send(&mut self, ch1: &[f32], ch2: &[f32]) -> Result<()> {
        for (index, data) in [ch1, ch2].into_iter().enumerate() {
            let conn = &mut self.channels[index];
            send_channel(conn, index + 1, data, &mut self.scratch)?;
        }
        self.frames_sent += 1;
        trace!(frame = self.frames_sent, samples = ch1.len(), "frame transmitted");
        Ok(())
    }
}

fn send_channel(
    conn: &mut Connection,
    channel: usize,
    data: &[f32],
    scratch: &mut Vec<u8>,
) -> Result<()> {
    let per_chunk = conn.window / SAMPLE_BYTES;
    for chunk in data.chunks(per_chunk) {
        scratch.clear();
        for value in chunk {
            scratch.extend_from_slice(&value.to_ne_bytes());
        }
        let prefix = (scratch.len() as u64).to_ne_bytes();
        write_exact(conn, channel, &prefix)?;
        write_exact(conn, channel, scratch)?;
    }
    conn.writer.flush().map_err(|e| AlazarError::Transmission {
        channel,
        message: format!("flush failed: {e}"),
    })
}

fn write_exact(conn: &mut Connection, channel: usize, bytes: &[u8]) -> Result<()> {
    let written = conn
        .writer
        .write(bytes)
        .map_err(|e| AlazarError::Transmission {
            channel,
            message: e.to_string(),
        })?;
    if written != bytes.len() {
        return Err(AlazarError::Transmission {
            channel,
            message: format!("short write: {written} of {} bytes", bytes.len()),
        });
    }
    Ok(())
}
