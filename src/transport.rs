//! Byte transports to the station hardware.
//!
//! Three backends share the [`Transport`] trait:
//! - [`SerialTransport`]: RS-232 consoles through the `serialport` crate
//! - [`HidTransport`]: USB HID consoles through a Linux `hidraw` node
//! - [`TcpTransport`]: network gateways over TCP
//!
//! Every read and write takes an explicit timeout so a stuck device can never
//! block a session indefinitely.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::config::TransportConfig;
use crate::errors::{ConnectionError, DriverError, Result};

/// Longest time spent draining stale input before a command.
const MAX_DISCARD: Duration = Duration::from_millis(200);

/// Poll interval used while draining stale input.
const DISCARD_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Transport Abstraction
// ============================================================================

/// A bidirectional byte channel to one physical device.
pub trait Transport: Send {
    /// Write all of `bytes`, failing with `Timeout` if the device does not accept them in time.
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<()>;

    /// Read between 1 and `max_bytes` bytes. Never returns an empty buffer:
    /// no data within `timeout` is `Err(Timeout)`.
    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Read exactly `len` bytes within an overall `timeout`.
    fn receive_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DriverError::ShortFrame {
                    declared: len,
                    received: out.len(),
                });
            }
            match self.receive(len - out.len(), remaining) {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(DriverError::Timeout(_)) => {
                    return Err(DriverError::ShortFrame {
                        declared: len,
                        received: out.len(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Drop any bytes the device sent that nobody asked for.
    fn discard_input(&mut self) -> Result<()> {
        let start = Instant::now();
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            match self.receive(256, DISCARD_POLL) {
                Ok(stale) => debug!("discarded {} stale bytes", stale.len()),
                Err(DriverError::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
            if iterations > 64 || start.elapsed() > MAX_DISCARD {
                break;
            }
        }
        Ok(())
    }

    /// Release the underlying handle. Later calls fail with `ConnectionError::Closed`.
    fn close(&mut self);

    /// Human readable endpoint for logs.
    fn describe(&self) -> String;

    /// A handle another thread can use to abort in-flight I/O, if the backend supports it.
    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        None
    }
}

/// Aborts a transport's blocking I/O from outside the owning thread.
pub struct ShutdownHandle(Box<dyn Fn() + Send + Sync>);

impl ShutdownHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn shutdown(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShutdownHandle")
    }
}

/// Open the transport described by `config`.
pub fn open(config: &TransportConfig, io_timeout: Duration) -> Result<Box<dyn Transport>> {
    match config {
        TransportConfig::Serial {
            port,
            baud_rate,
            dtr,
            rts,
        } => {
            let transport = SerialTransport::open(port, *baud_rate, io_timeout, *dtr, *rts)?;
            Ok(Box::new(transport))
        }
        TransportConfig::Hid {
            vendor_id,
            product_id,
            path,
        } => open_hid(*vendor_id, *product_id, path.as_deref()),
        TransportConfig::Tcp { host, port } => {
            let transport = TcpTransport::connect(host, *port, io_timeout)?;
            Ok(Box::new(transport))
        }
    }
}

#[cfg(unix)]
fn open_hid(vendor_id: u16, product_id: u16, path: Option<&str>) -> Result<Box<dyn Transport>> {
    Ok(Box::new(HidTransport::open(vendor_id, product_id, path)?))
}

#[cfg(not(unix))]
fn open_hid(vendor_id: u16, product_id: u16, _path: Option<&str>) -> Result<Box<dyn Transport>> {
    Err(ConnectionError::NotFound {
        what: format!(
            "hidraw device {:04x}:{:04x} (unsupported platform)",
            vendor_id, product_id
        ),
    }
    .into())
}

fn map_io(e: io::Error, what: &str) -> DriverError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            DriverError::Timeout(what.to_string())
        }
        _ => DriverError::Io(e),
    }
}

// ============================================================================
// Serial
// ============================================================================

/// RS-232 console, 8N1 without flow control.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
}

impl SerialTransport {
    /// Open `path` at `baud_rate`. `dtr`/`rts` force the modem control lines,
    /// which some consoles use as their power supply.
    pub fn open(
        path: &str,
        baud_rate: u32,
        timeout: Duration,
        dtr: Option<bool>,
        rts: Option<bool>,
    ) -> Result<Self> {
        let mut port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| ConnectionError::Open {
                target: path.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(level) = dtr {
            port.write_data_terminal_ready(level)?;
        }
        if let Some(level) = rts {
            port.write_request_to_send(level)?;
        }

        info!("serial port opened: path={}, baud={}", path, baud_rate);
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or(DriverError::Connection(ConnectionError::Closed))
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let port = self.port()?;
        port.set_timeout(timeout)?;
        port.write_all(bytes).map_err(|e| map_io(e, "serial write"))?;
        port.flush().map_err(|e| map_io(e, "serial flush"))?;
        Ok(())
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port()?;
        port.set_timeout(timeout)?;
        let mut buf = vec![0u8; max_bytes.max(1)];
        match port.read(&mut buf) {
            Ok(0) => Err(DriverError::Timeout("serial read".into())),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(map_io(e, "serial read")),
        }
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("serial port closed: path={}", self.path);
        }
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.path)
    }
}

// ============================================================================
// USB HID (Linux hidraw)
// ============================================================================

/// Size of one HID output/input report for the consoles we talk to.
#[cfg(unix)]
const HID_REPORT_SIZE: usize = 8;

/// USB HID console accessed through `/dev/hidrawN`.
#[cfg(unix)]
pub struct HidTransport {
    file: Option<std::fs::File>,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl HidTransport {
    /// Open an explicit hidraw `path`, or search sysfs for the first node
    /// matching `vendor_id:product_id`.
    pub fn open(vendor_id: u16, product_id: u16, path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => std::path::PathBuf::from(p),
            None => find_hidraw(vendor_id, product_id)?,
        };

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ConnectionError::Open {
                target: path.display().to_string(),
                reason: e.to_string(),
            })?;

        info!(
            "hid device opened: path={}, id={:04x}:{:04x}",
            path.display(),
            vendor_id,
            product_id
        );
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    fn file(&mut self) -> Result<&mut std::fs::File> {
        self.file
            .as_mut()
            .ok_or(DriverError::Connection(ConnectionError::Closed))
    }

    /// Wait until the descriptor is ready for `events`. `Ok(false)` on timeout.
    fn wait_ready(&mut self, events: libc::c_short, timeout: Duration) -> Result<bool> {
        use std::os::fd::AsRawFd;

        let fd = self.file()?.as_raw_fd();
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(DriverError::Io(err));
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(DriverError::Connection(ConnectionError::Closed));
        }
        Ok(ret > 0)
    }
}

#[cfg(unix)]
impl Transport for HidTransport {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        for report in bytes.chunks(HID_REPORT_SIZE) {
            if !self.wait_ready(libc::POLLOUT, timeout)? {
                return Err(DriverError::Timeout("hid write".into()));
            }
            // Unnumbered reports: hidraw expects a leading report id of zero.
            let mut buf = [0u8; HID_REPORT_SIZE + 1];
            buf[1..1 + report.len()].copy_from_slice(report);
            self.file()?
                .write_all(&buf)
                .map_err(|e| map_io(e, "hid write"))?;
        }
        Ok(())
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        if !self.wait_ready(libc::POLLIN, timeout)? {
            return Err(DriverError::Timeout("hid read".into()));
        }
        let mut buf = vec![0u8; max_bytes.max(HID_REPORT_SIZE)];
        let n = self
            .file()?
            .read(&mut buf)
            .map_err(|e| map_io(e, "hid read"))?;
        if n == 0 {
            return Err(DriverError::Connection(ConnectionError::Closed));
        }
        buf.truncate(n.min(max_bytes));
        Ok(buf)
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("hid device closed: path={}", self.path.display());
        }
    }

    fn describe(&self) -> String {
        format!("hid:{}", self.path.display())
    }
}

/// Find `/dev/hidrawN` whose sysfs `uevent` carries `HID_ID=xxxx:VVVVVVVV:PPPPPPPP`.
#[cfg(unix)]
fn find_hidraw(vendor_id: u16, product_id: u16) -> Result<std::path::PathBuf> {
    let entries = std::fs::read_dir("/sys/class/hidraw").map_err(|e| ConnectionError::NotFound {
        what: format!("hidraw class ({e})"),
    })?;

    for entry in entries.flatten() {
        let uevent = entry.path().join("device").join("uevent");
        let Ok(contents) = std::fs::read_to_string(&uevent) else {
            continue;
        };
        if uevent_matches(&contents, vendor_id, product_id) {
            let node = std::path::Path::new("/dev").join(entry.file_name());
            debug!("hidraw match: node={}", node.display());
            return Ok(node);
        }
    }

    Err(ConnectionError::NotFound {
        what: format!("hid device {:04x}:{:04x}", vendor_id, product_id),
    }
    .into())
}

#[cfg_attr(not(unix), allow(dead_code))]
fn uevent_matches(uevent: &str, vendor_id: u16, product_id: u16) -> bool {
    uevent
        .lines()
        .filter_map(|line| line.strip_prefix("HID_ID="))
        .any(|id| {
            let mut parts = id.split(':').skip(1);
            let vendor = parts.next().and_then(|v| u32::from_str_radix(v, 16).ok());
            let product = parts.next().and_then(|p| u32::from_str_radix(p, 16).ok());
            vendor == Some(vendor_id as u32) && product == Some(product_id as u32)
        })
}

// ============================================================================
// TCP
// ============================================================================

/// Network gateway over TCP.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Resolve `host` and try each address in turn, IPv4 before IPv6.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let mut addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| ConnectionError::NotFound {
                what: format!("{host}:{port} ({e})"),
            })?
            .collect();
        addrs.sort_by_key(|addr| addr.is_ipv6());

        let mut last_error = None;
        for addr in addrs {
            debug!("connecting: addr={}", addr);
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    info!("tcp connection established: addr={}", addr);
                    return Ok(Self::from_stream(stream, addr));
                }
                Err(e) => {
                    warn!("tcp connection attempt failed: addr={}, error={}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(ConnectionError::Open {
            target: format!("{host}:{port}"),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".into()),
        }
        .into())
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or(DriverError::Connection(ConnectionError::Closed))
    }
}

/// Socket timeouts must be non-zero.
fn socket_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<()> {
        let stream = self.stream()?;
        stream.set_write_timeout(socket_timeout(timeout))?;
        stream
            .write_all(bytes)
            .map_err(|e| map_io(e, "tcp write"))?;
        Ok(())
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        stream.set_read_timeout(socket_timeout(timeout))?;
        let mut buf = vec![0u8; max_bytes.max(1)];
        match stream.read(&mut buf) {
            Ok(0) => Err(DriverError::Connection(ConnectionError::Closed)),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(map_io(e, "tcp read")),
        }
    }

    fn discard_input(&mut self) -> Result<()> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut buf = [0u8; 256];
        let result = loop {
            match stream.read(&mut buf) {
                Ok(0) => break Err(DriverError::Connection(ConnectionError::Closed)),
                Ok(n) => debug!("discarded {} stale bytes", n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(DriverError::Io(e)),
            }
        };
        stream.set_nonblocking(false)?;
        result
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("tcp connection closed: addr={}", self.peer);
        }
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.peer)
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        let clone = self.stream.as_ref()?.try_clone().ok()?;
        Some(ShutdownHandle::new(move || {
            let _ = clone.shutdown(Shutdown::Both);
        }))
    }
}
