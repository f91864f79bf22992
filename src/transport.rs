//! Line-oriented links to bench instruments.
//!
//! Every instrument on the bench speaks ASCII commands terminated by a line
//! ending and answers with a single line. [`Transport`] captures that model;
//! [`StreamTransport`] implements it for any byte stream, which gives us the
//! serial (`tokio-serial`) and USBTMC (`/dev/usbtmc*` character device)
//! variants. The concrete kind is picked once, when a [`Connector`] opens a
//! detected [`Endpoint`], and drivers only ever see `Box<dyn Transport>`.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialPortType,
    SerialStream, StopBits,
};
use tracing::{debug, trace};

use crate::error::TransportError;

pub mod mock;

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Serial,
    Usbtmc,
}

impl TransportKind {
    pub fn label(self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Usbtmc => "usbtmc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A device node or port name that may host an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: TransportKind,
    pub id: String,
    /// Whether the endpoint sits behind a USB bridge.
    pub usb: bool,
}

impl Endpoint {
    /// Build an endpoint from a user-supplied path, guessing the kind from the name.
    pub fn from_path(path: &str) -> Self {
        let kind = if path.contains("usbtmc") {
            TransportKind::Usbtmc
        } else {
            TransportKind::Serial
        };
        Endpoint {
            kind,
            id: path.to_string(),
            usb: kind == TransportKind::Usbtmc || looks_like_usb_serial(path),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.kind)
    }
}

fn looks_like_usb_serial(name: &str) -> bool {
    ["ttyUSB", "ttyACM", "cu.usb", "tty.usb"]
        .iter()
        .any(|prefix| name.contains(prefix))
}

/// Connection state owned by exactly one driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentHandle {
    pub kind: TransportKind,
    pub endpoint: String,
    pub is_open: bool,
}

impl InstrumentHandle {
    fn opened(endpoint: &Endpoint) -> Self {
        InstrumentHandle {
            kind: endpoint.kind,
            endpoint: endpoint.id.clone(),
            is_open: true,
        }
    }
}

/// Fixed line settings for one instrument family.
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub write_terminator: &'static str,
    /// Byte that ends a reply. A trailing `\r` is stripped, so `\n` covers
    /// both `\n` and `\r\n` conventions.
    pub read_terminator: u8,
    pub read_timeout: Duration,
    /// Pause after opening before the first command.
    pub open_settle: Duration,
}

impl LineConfig {
    /// 8N1 at `baud_rate`, `\r\n` out, `\n` in, one second read timeout.
    pub fn new(baud_rate: u32) -> Self {
        LineConfig {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            write_terminator: "\r\n",
            read_terminator: b'\n',
            read_timeout: Duration::from_secs(1),
            open_settle: Duration::ZERO,
        }
    }

    pub fn with_write_terminator(mut self, terminator: &'static str) -> Self {
        self.write_terminator = terminator;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_open_settle(mut self, settle: Duration) -> Self {
        self.open_settle = settle;
        self
    }
}

#[async_trait]
pub trait Transport: Send {
    fn handle(&self) -> &InstrumentHandle;

    async fn write_line(&mut self, command: &str) -> Result<(), TransportError>;

    /// Read one reply line with the terminator and surrounding whitespace removed.
    async fn read_line(&mut self) -> Result<String, TransportError>;

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write_line(command).await?;
        self.read_line().await
    }

    /// Drop any stale bytes waiting on the input side.
    async fn clear_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the link. Closing an already closed transport is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Streams that can discard pending input at the device level.
pub trait InputPurge {
    fn purge_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl InputPurge for SerialStream {
    fn purge_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl InputPurge for tokio::fs::File {}

impl InputPurge for tokio::io::DuplexStream {}

/// [`Transport`] over any async byte stream, framing replies on the read terminator.
pub struct StreamTransport<S> {
    handle: InstrumentHandle,
    line: LineConfig,
    stream: Option<S>,
    pending: Vec<u8>,
}

pub type SerialTransport = StreamTransport<SerialStream>;
pub type UsbtmcTransport = StreamTransport<tokio::fs::File>;

impl<S> StreamTransport<S> {
    pub fn from_stream(endpoint: &Endpoint, line: LineConfig, stream: S) -> Self {
        StreamTransport {
            handle: InstrumentHandle::opened(endpoint),
            line,
            stream: Some(stream),
            pending: Vec::new(),
        }
    }
}

impl SerialTransport {
    pub async fn open(endpoint: &Endpoint, line: &LineConfig) -> Result<Self, TransportError> {
        let port = tokio_serial::new(endpoint.id.as_str(), line.baud_rate)
            .data_bits(line.data_bits)
            .parity(line.parity)
            .stop_bits(line.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(line.read_timeout)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                endpoint: endpoint.id.clone(),
                reason: e.to_string(),
            })?;
        debug!("opened {} at {} baud", endpoint.id, line.baud_rate);
        settle(line).await;
        Ok(Self::from_stream(endpoint, line.clone(), port))
    }
}

impl UsbtmcTransport {
    pub async fn open(endpoint: &Endpoint, line: &LineConfig) -> Result<Self, TransportError> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&endpoint.id)
            .await
            .map_err(|e| TransportError::Open {
                endpoint: endpoint.id.clone(),
                reason: e.to_string(),
            })?;
        debug!("opened {}", endpoint.id);
        settle(line).await;
        // USBTMC framing is message based; instruments expect a bare `\n`.
        let line = line.clone().with_write_terminator("\n");
        Ok(Self::from_stream(endpoint, line, file))
    }
}

async fn settle(line: &LineConfig) {
    if !line.open_settle.is_zero() {
        tokio::time::sleep(line.open_settle).await;
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(char::from(0))
        .trim()
        .to_string()
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + InputPurge + Unpin + Send,
{
    fn handle(&self) -> &InstrumentHandle {
        &self.handle
    }

    async fn write_line(&mut self, command: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let framed = format!("{command}{}", self.line.write_terminator);
        trace!("{} <- {:?}", self.handle.endpoint, framed);
        stream.write_all(framed.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let timeout = self.line.read_timeout;
        let terminator = self.line.read_terminator;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == terminator) {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = decode_line(&raw);
                trace!("{} -> {:?}", self.handle.endpoint, line);
                return Ok(line);
            }

            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            let mut chunk = [0u8; READ_CHUNK];
            let n = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => return Err(TransportError::Timeout(timeout)),
            };

            if n == 0 {
                // USBTMC nodes end a message with EOF rather than a terminator.
                if self.pending.is_empty() {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                let raw = std::mem::take(&mut self.pending);
                return Ok(decode_line(&raw));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        if let Some(stream) = self.stream.as_mut() {
            stream.purge_input()?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        self.handle.is_open = false;
        self.pending.clear();
        let flushed = stream.flush().await;
        drop(stream);
        debug!("closed {}", self.handle.endpoint);
        flushed.map_err(Into::into)
    }
}

/// Enumerates endpoints and opens transports onto them.
#[async_trait]
pub trait Connector: Send + Sync {
    fn enumerate(&self) -> Result<Vec<Endpoint>, TransportError>;

    async fn open(
        &self,
        endpoint: &Endpoint,
        line: &LineConfig,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// The host's real serial ports and USBTMC device nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

#[async_trait]
impl Connector for SystemConnector {
    fn enumerate(&self) -> Result<Vec<Endpoint>, TransportError> {
        let ports = tokio_serial::available_ports().map_err(io::Error::from)?;
        let mut endpoints: Vec<Endpoint> = ports
            .into_iter()
            .map(|info| {
                let usb = matches!(info.port_type, SerialPortType::UsbPort(_))
                    || looks_like_usb_serial(&info.port_name);
                Endpoint {
                    kind: TransportKind::Serial,
                    id: info.port_name,
                    usb,
                }
            })
            .collect();
        endpoints.extend(usbtmc_nodes());
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints.dedup_by(|a, b| a.id == b.id);
        Ok(endpoints)
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        line: &LineConfig,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match endpoint.kind {
            TransportKind::Serial => Ok(Box::new(SerialTransport::open(endpoint, line).await?)),
            TransportKind::Usbtmc => Ok(Box::new(UsbtmcTransport::open(endpoint, line).await?)),
        }
    }
}

fn usbtmc_nodes() -> Vec<Endpoint> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.starts_with("usbtmc").then(|| Endpoint {
                kind: TransportKind::Usbtmc,
                id: format!("/dev/{name}"),
                usb: true,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn endpoint() -> Endpoint {
        Endpoint::from_path("/dev/ttyUSB0")
    }

    #[test]
    fn endpoint_kind_follows_path() {
        let tmc = Endpoint::from_path("/dev/usbtmc0");
        assert_eq!(tmc.kind, TransportKind::Usbtmc);
        assert!(tmc.usb);

        let usb = Endpoint::from_path("/dev/ttyUSB3");
        assert_eq!(usb.kind, TransportKind::Serial);
        assert!(usb.usb);

        let onboard = Endpoint::from_path("/dev/ttyS0");
        assert!(!onboard.usb);
    }

    #[tokio::test]
    async fn write_line_appends_terminator() {
        let (client, mut device) = duplex(256);
        let mut link = StreamTransport::from_stream(&endpoint(), LineConfig::new(9600), client);

        link.write_line("*IDN?").await.unwrap();

        let mut buf = [0u8; 7];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"*IDN?\r\n");
    }

    #[tokio::test]
    async fn read_line_joins_chunks_and_strips_crlf() {
        let (client, mut device) = duplex(256);
        let mut link = StreamTransport::from_stream(&endpoint(), LineConfig::new(9600), client);

        device.write_all(b"YOKOGAWA,WT31").await.unwrap();
        device.write_all(b"0E,C3XXX,F1.03\r\nNEXT\n").await.unwrap();

        assert_eq!(link.read_line().await.unwrap(), "YOKOGAWA,WT310E,C3XXX,F1.03");
        assert_eq!(link.read_line().await.unwrap(), "NEXT");
    }

    #[tokio::test]
    async fn blank_reply_reads_as_empty_line() {
        let (client, mut device) = duplex(256);
        let mut link = StreamTransport::from_stream(&endpoint(), LineConfig::new(9600), client);

        device.write_all(b"\r\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (client, _device) = duplex(256);
        let line = LineConfig::new(9600).with_read_timeout(Duration::from_millis(300));
        let mut link = StreamTransport::from_stream(&endpoint(), line, client);

        let err = link.read_line().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(t) if t == Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn clear_input_discards_buffered_bytes() {
        let (client, mut device) = duplex(256);
        let line = LineConfig::new(9600).with_read_timeout(Duration::from_millis(20));
        let mut link = StreamTransport::from_stream(&endpoint(), line, client);

        device.write_all(b"stale").await.unwrap();
        // Pulls the partial line into the framing buffer, then times out.
        assert!(link.read_line().await.is_err());

        link.clear_input().await.unwrap();
        device.write_all(b"fresh\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _device) = duplex(256);
        let mut link = StreamTransport::from_stream(&endpoint(), LineConfig::new(9600), client);
        assert!(link.handle().is_open);

        link.close().await.unwrap();
        link.close().await.unwrap();

        assert!(!link.handle().is_open);
        assert!(matches!(
            link.write_line("OUTP OFF").await,
            Err(TransportError::Closed)
        ));
    }
}
