//! Serial link abstraction
//!
//! A [`Link`] is one duplex byte stream to the instrument. It offers exactly what
//! the command client needs: write a line, read a line, throw away input that is
//! already waiting, and close.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`LinkId`]: Name of an endpoint (`/dev/ttyACM0`, `COM3`)
//! - [`LinkOpener`]: Seam through which links are opened; discovery uses it to open
//!   one link per candidate, tests substitute in-memory streams
//!
//! # Example
//!
//! ```rust,ignore
//! use cellsim::serial::{LinkId, LinkOpener, SerialOpener};
//!
//! let opener = SerialOpener::new(115_200);
//! let mut link = opener.open(&LinkId::from("/dev/ttyACM0")).await?;
//! link.discard_pending_input();
//! link.write_line("PING").await?;
//! let reply = link.read_line().await?;
//! link.close().await?;
//! ```

use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::CellSimResult;
#[cfg(feature = "instrument_serial")]
use crate::error::CellSimError;

/// Upper bound on bytes thrown away by one [`Link::discard_pending_input`] call.
///
/// Keeps a device that streams continuously from stalling the caller.
const MAX_DISCARD_BYTES: usize = 64 * 1024;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can back a link:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (simulator and tests)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// LinkId
// =============================================================================

/// Opaque name of a byte-stream endpoint, as produced by host enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(String);

impl LinkId {
    /// Wrap an endpoint name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The endpoint name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for LinkId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Link
// =============================================================================

/// One open duplex byte stream.
///
/// Closing consumes the link, so a closed link can never be used again. Dropping
/// a link without calling [`Link::close`] also releases the port.
pub struct Link {
    id: LinkId,
    reader: BufReader<DynSerial>,
    /// Bytes of a line whose terminator has not arrived yet
    pending: Vec<u8>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("pending_bytes", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Wrap an already opened stream.
    pub fn new(id: LinkId, port: DynSerial) -> Self {
        Self {
            id,
            reader: BufReader::new(port),
            pending: Vec::new(),
        }
    }

    /// Name of the endpoint this link is connected to.
    pub fn id(&self) -> &LinkId {
        &self.id
    }

    /// Write `text` followed by a single `\n` and flush.
    pub async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(b'\n');

        tracing::trace!(link = %self.id, "write {:?}", text);
        let port = self.reader.get_mut();
        port.write_all(&frame).await?;
        port.flush().await
    }

    /// Read the next line, terminator included. Callers trim.
    ///
    /// Returns `Ok(None)` at end of input. Cancel safe: if the future is dropped
    /// while a line is only partially received, the received bytes are kept and
    /// the next call continues the same line. Invalid UTF-8 is replaced, never
    /// reported as an error.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.reader.read_until(b'\n', &mut self.pending).await?;

        // Zero bytes read with nothing buffered is end of input. A partial line
        // cut short by end of input is still delivered.
        if self.pending.is_empty() {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Ok(Some(line))
    }

    /// Throw away every byte that can be read without waiting.
    ///
    /// Clears the partial-line buffer, the `BufReader` buffer and whatever the
    /// underlying stream has ready right now. Returns the number of bytes dropped.
    pub fn discard_pending_input(&mut self) -> usize {
        let mut discarded = self.pending.len();
        self.pending.clear();

        let buffered = self.reader.buffer().len();
        if buffered > 0 {
            self.reader.consume(buffered);
            discarded += buffered;
        }

        let mut discard_buf = [0u8; 256];
        while discarded < MAX_DISCARD_BYTES {
            match self.reader.get_mut().read(&mut discard_buf).now_or_never() {
                Some(Ok(n)) if n > 0 => discarded += n,
                // End of input, nothing ready, or an I/O error the next read will report
                _ => break,
            }
        }

        if discarded > 0 {
            tracing::debug!(link = %self.id, "discarded {} stale bytes", discarded);
        }
        discarded
    }

    /// Shut the stream down and release it.
    pub async fn close(self) -> io::Result<()> {
        tracing::debug!(link = %self.id, "closing link");
        let mut port = self.reader.into_inner();
        port.shutdown().await
    }
}

// =============================================================================
// Opening links
// =============================================================================

/// Opens links by identifier.
///
/// Implementations must tolerate concurrent calls for different identifiers;
/// discovery opens every candidate at the same time.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open the endpoint named `id`.
    ///
    /// # Errors
    ///
    /// `CellSimError::LinkUnavailable` if the endpoint is absent, busy or not
    /// permitted.
    async fn open(&self, id: &LinkId) -> CellSimResult<Link>;
}

/// Opens real serial ports through tokio-serial (8N1, no flow control).
#[cfg(feature = "instrument_serial")]
#[derive(Debug, Clone)]
pub struct SerialOpener {
    baud_rate: u32,
}

#[cfg(feature = "instrument_serial")]
impl SerialOpener {
    /// Opener using `baud_rate` for every port.
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }

    /// Opener configured from the `[link]` section.
    pub fn from_config(config: &crate::config::LinkConfig) -> Self {
        Self::new(config.baud_rate)
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl LinkOpener for SerialOpener {
    async fn open(&self, id: &LinkId) -> CellSimResult<Link> {
        let port = open_serial_async(id.as_str(), self.baud_rate).await?;
        tracing::debug!(link = %id, baud = self.baud_rate, "serial port opened");
        Ok(Link::new(id.clone(), Box::new(port)))
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// `CellSimError::LinkUnavailable` if the port cannot be opened or the blocking
/// task fails.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> CellSimResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| CellSimError::LinkUnavailable {
        link: port_path.to_string(),
        reason: format!("spawn_blocking for serial port opening failed: {}", e),
    })?
    .map_err(|e| CellSimError::LinkUnavailable {
        link: port_path.to_string(),
        reason: e.to_string(),
    })
}

/// Enumerate the host's serial ports as discovery candidates.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> CellSimResult<Vec<LinkId>> {
    let ports = tokio_serial::available_ports().map_err(|e| {
        CellSimError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("serial port enumeration failed: {}", e),
        ))
    })?;
    Ok(ports
        .into_iter()
        .map(|port| LinkId::new(port.port_name))
        .collect())
}
