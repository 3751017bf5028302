//! Transport abstraction: any byte-oriented channel to the controller.
//!
//! Concrete implementations:
//! - TCP socket (controller on the LAN)
//! - USB serial (feature `serial`)
//! - in-process simulated controller ([`super::sim`])
//!
//! The Commander is written against `Transport`, so adding a transport
//! requires zero changes to the RPC logic.  Opening and closing belong to a
//! [`Connector`], driven by the supervisor.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::info;

use super::sim::{SimHandle, SimTransport};
use crate::config::ConnectionTarget;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte-oriented, non-blocking transport channel.
pub trait Transport {
    /// Read up to `buf.len()` bytes into `buf`.
    /// Returns 0 if no data is available; end of stream is an error.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `data`; returns how much was accepted
    /// (0 when the channel is momentarily full).
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Flush any buffered output.
    fn flush(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Opens a fresh transport for every connection attempt.
pub trait Connector {
    fn connect(&mut self) -> io::Result<Box<dyn Transport>>;
}

// ── TCP ──────────────────────────────────────────────────────

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{host}:{port} did not resolve"))
        })?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        info!("TCP: connected to {}", addr);
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.stream.write(data) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

// ── Serial ───────────────────────────────────────────────────

#[cfg(feature = "serial")]
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialTransport {
    /// Open a serial port, e.g. `/dev/ttyACM0` at 115200 baud.
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        use serialport::{DataBits, FlowControl, Parity, StopBits};

        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()?;
        info!("Serial: opened {} at {} baud", path, baud_rate);
        Ok(Self { port })
    }
}

#[cfg(feature = "serial")]
impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.port.write(data) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

// ── Target-driven connector ──────────────────────────────────

/// Connector built from [`ConnectionTarget`].
///
/// Simulation targets reuse one simulated controller across reconnects,
/// the way a physical controller keeps its blocks when the cable drops.
pub struct TargetConnector {
    target: ConnectionTarget,
    sim: SimHandle,
}

impl TargetConnector {
    pub fn new(target: ConnectionTarget) -> Self {
        Self {
            target,
            sim: SimHandle::default(),
        }
    }

    pub fn simulator(&self) -> &SimHandle {
        &self.sim
    }
}

impl Connector for TargetConnector {
    fn connect(&mut self) -> io::Result<Box<dyn Transport>> {
        match &self.target {
            ConnectionTarget::Tcp { host, port } => {
                Ok(Box::new(TcpTransport::connect(host, *port, CONNECT_TIMEOUT)?))
            }
            #[cfg(feature = "serial")]
            ConnectionTarget::Serial { path, baud_rate } => {
                Ok(Box::new(SerialTransport::open(path, *baud_rate)?))
            }
            #[cfg(not(feature = "serial"))]
            ConnectionTarget::Serial { path, .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{path}: built without the `serial` feature"),
            )),
            ConnectionTarget::Simulation => Ok(Box::new(SimTransport::connect(&self.sim))),
        }
    }
}
