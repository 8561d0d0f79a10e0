//! Mocks, useful to test the gateway without actual serial ports,
//! USB topology or service discovery.
//!
//! The opener hands out in-memory devices and keeps the far end of each,
//! so a test can play the part of the device.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing::{debug, info};

use crate::{
    announce::{Announcement, Announcer, AnnouncerFactory},
    device::{Handle, Location},
    discovery::DeviceScanner,
    error::Error,
    serial::{
        DeviceOpener, LineSettings, ModemLines, SerialControl, SerialDevice, SerialPortError,
    },
};

const DUPLEX_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The observable state of a mock serial line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLine {
    /// Current line settings.
    pub settings: LineSettings,

    /// RTS as driven by the gateway.
    pub rts: bool,

    /// DTR as driven by the gateway.
    pub dtr: bool,

    /// Whether a break is being sent.
    pub break_on: bool,

    /// Input lines, set by the test.
    pub modem: ModemLines,

    /// How many purges were requested.
    pub purges: usize,
}

impl MockLine {
    fn new(settings: LineSettings) -> Self {
        Self {
            settings,
            rts: false,
            dtr: false,
            break_on: false,
            modem: ModemLines::default(),
            purges: 0,
        }
    }
}

/// An in-memory serial device.
#[derive(Debug)]
pub struct MockDevice {
    io: DuplexStream,
    line: Arc<Mutex<MockLine>>,
}

/// The device side of a [`MockDevice`].
///
/// Bytes written to `io` are read by the gateway, and vice versa.
/// Dropping it looks like the device going away.
#[derive(Debug)]
pub struct MockLink {
    /// The far end of the byte stream.
    pub io: DuplexStream,

    line: Arc<Mutex<MockLine>>,
}

impl MockLink {
    /// Inspect or change the line state.
    pub fn line(&self) -> MutexGuard<'_, MockLine> {
        lock(&self.line)
    }
}

impl MockDevice {
    /// A device and its far end.
    pub fn pair(settings: LineSettings) -> (Self, MockLink) {
        let (near, far) = tokio::io::duplex(DUPLEX_CAPACITY);
        let line = Arc::new(Mutex::new(MockLine::new(settings)));

        (
            Self {
                io: near,
                line: line.clone(),
            },
            MockLink { io: far, line },
        )
    }

    /// Inspect or change the line state.
    pub fn line(&self) -> MutexGuard<'_, MockLine> {
        lock(&self.line)
    }
}

impl AsyncRead for MockDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockDevice {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl SerialControl for MockDevice {
    fn settings(&self) -> Result<LineSettings, SerialPortError> {
        Ok(self.line().settings)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), SerialPortError> {
        if baud_rate == 0 {
            return Err(SerialPortError::Unsupported("baud rate 0".into()));
        }
        self.line().settings.baud_rate = baud_rate;
        Ok(())
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), SerialPortError> {
        self.line().settings.data_bits = data_bits;
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> Result<(), SerialPortError> {
        self.line().settings.parity = parity;
        Ok(())
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), SerialPortError> {
        self.line().settings.stop_bits = stop_bits;
        Ok(())
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), SerialPortError> {
        self.line().settings.flow_control = flow_control;
        Ok(())
    }

    fn write_rts(&mut self, level: bool) -> Result<(), SerialPortError> {
        self.line().rts = level;
        Ok(())
    }

    fn write_dtr(&mut self, level: bool) -> Result<(), SerialPortError> {
        self.line().dtr = level;
        Ok(())
    }

    fn set_break(&mut self, on: bool) -> Result<(), SerialPortError> {
        self.line().break_on = on;
        Ok(())
    }

    fn modem_lines(&mut self) -> Result<ModemLines, SerialPortError> {
        Ok(self.line().modem)
    }

    fn purge(&mut self, _buffer: ClearBuffer) -> Result<(), SerialPortError> {
        self.line().purges += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OpenerState {
    links: HashMap<Handle, MockLink>,
    failing: HashSet<Handle>,
    opened: Vec<(Handle, u32)>,
}

/// Opens [`MockDevice`]s.
///
/// Clones share state, so a test keeps one and gives one to the gateway.
#[derive(Debug, Clone, Default)]
pub struct MockOpener(Arc<Mutex<OpenerState>>);

impl MockOpener {
    /// A new opener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make opening `handle` fail until [`MockOpener::heal`] is called.
    pub fn break_device(&self, handle: impl Into<Handle>) {
        lock(&self.0).failing.insert(handle.into());
    }

    /// Let `handle` open again.
    pub fn heal(&self, handle: impl Into<Handle>) {
        let handle: Handle = handle.into();
        lock(&self.0).failing.remove(&handle);
    }

    /// Take the far end of the latest device opened for `handle`.
    pub fn take_link(&self, handle: impl Into<Handle>) -> Option<MockLink> {
        let handle: Handle = handle.into();
        lock(&self.0).links.remove(&handle)
    }

    /// Every successful open so far, with its baud rate.
    pub fn opened(&self) -> Vec<(Handle, u32)> {
        lock(&self.0).opened.clone()
    }
}

impl DeviceOpener for MockOpener {
    fn open(
        &self,
        handle: &Handle,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialDevice>, SerialPortError> {
        let mut state = lock(&self.0);

        if state.failing.contains(handle) {
            debug!(%handle, "Mock open refused");
            return Err(SerialPortError::IO(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mock device {handle} is broken"),
            )));
        }

        info!(%handle, baud_rate, "Opening mock device");
        let (device, link) = MockDevice::pair(LineSettings::with_baud_rate(baud_rate));

        state.links.insert(handle.clone(), link);
        state.opened.push((handle.clone(), baud_rate));

        Ok(Box::new(device))
    }
}

#[derive(Debug, Default)]
struct ScannerState {
    devices: BTreeMap<Location, Handle>,
    failing: bool,
}

/// A device scanner whose results are set by the test.
#[derive(Debug, Clone, Default)]
pub struct MockScanner(Arc<Mutex<ScannerState>>);

impl MockScanner {
    /// Nothing plugged in.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in.
    pub fn plug(&self, location: impl Into<Location>, handle: impl Into<Handle>) {
        lock(&self.0)
            .devices
            .insert(location.into(), handle.into());
    }

    /// Unplug a device.
    pub fn unplug(&self, location: impl Into<Location>) {
        let location: Location = location.into();
        lock(&self.0).devices.remove(&location);
    }

    /// Make scans fail (or not).
    pub fn set_failing(&self, failing: bool) {
        lock(&self.0).failing = failing;
    }
}

impl DeviceScanner for MockScanner {
    fn scan(&mut self) -> Result<BTreeMap<Location, Handle>, Error> {
        let state = lock(&self.0);

        if state.failing {
            Err(Error::Scan("mock scanner failure".into()))
        } else {
            Ok(state.devices.clone())
        }
    }
}

/// Something a [`RecordingAnnouncers`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// A service was published.
    Published {
        /// The service name.
        name: String,

        /// The TCP port.
        port: u16,
    },

    /// A service was withdrawn.
    Unpublished {
        /// The TCP port.
        port: u16,
    },
}

/// Records publish and unpublish calls instead of announcing anything.
#[derive(Debug, Clone, Default)]
pub struct RecordingAnnouncers(Arc<Mutex<Vec<AnnounceEvent>>>);

impl RecordingAnnouncers {
    /// Nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in order.
    pub fn events(&self) -> Vec<AnnounceEvent> {
        lock(&self.0).clone()
    }

    /// Ports currently published.
    pub fn published(&self) -> Vec<u16> {
        let mut ports = vec![];

        for event in lock(&self.0).iter() {
            match event {
                AnnounceEvent::Published { port, .. } => ports.push(*port),
                AnnounceEvent::Unpublished { port } => ports.retain(|p| p != port),
            }
        }
        ports.sort_unstable();

        ports
    }
}

struct RecordingAnnouncer {
    events: Arc<Mutex<Vec<AnnounceEvent>>>,
    port: Option<u16>,
}

impl Announcer for RecordingAnnouncer {
    fn publish(&mut self, announcement: &Announcement) -> Result<(), Error> {
        self.port = Some(announcement.port);
        lock(&self.events).push(AnnounceEvent::Published {
            name: announcement.name.clone(),
            port: announcement.port,
        });
        Ok(())
    }

    fn unpublish(&mut self) {
        if let Some(port) = self.port.take() {
            lock(&self.events).push(AnnounceEvent::Unpublished { port });
        }
    }
}

impl AnnouncerFactory for RecordingAnnouncers {
    fn create(&self) -> Box<dyn Announcer> {
        Box::new(RecordingAnnouncer {
            events: self.0.clone(),
            port: None,
        })
    }
}
