//! A forwarder bridges one serial device to one TCP port.
//!
//! Each forwarder is a task owning the serial device, the listening socket
//! and at most one client.
//! Every loop iteration it decides what it is interested in
//! and waits for exactly that.

use std::{
    fmt::Display,
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::Poll,
    time::Duration,
};

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use futures::{
    channel::{mpsc, oneshot},
    future::poll_fn,
    StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::{MissedTickBehavior, Sleep},
};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::{
    announce::{Announcement, Announcer},
    device::{DeviceSlot, Handle, Location},
    error::Error,
    rfc2217::PortManager,
    serial::{DeviceOpener, LineSettings, SerialDevice},
};

/// Socket setup.
pub(crate) mod socket;

/// Largest single read from either side.
pub const CHUNK_SIZE: usize = 1024;

/// The client is not read from while a buffer holds this much or more.
pub const BACKPRESSURE_THRESHOLD: usize = 2048;

const MODEM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between accepts after a failed one, e.g. out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Tells one forwarder instance apart from another at the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwarderId(Uuid);

impl ForwarderId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ForwarderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwarderState {
    /// Not serving. Terminal unless restarted.
    Closed,

    /// Serial device open, listening.
    Open,

    /// A client is attached.
    ClientConnected,
}

/// A snapshot of a forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderStatus {
    /// Instance id.
    pub id: ForwarderId,

    /// The slot served.
    pub location: Location,

    /// The device path in use.
    pub handle: Handle,

    /// The TCP port.
    pub port: u16,

    /// The baud rate the device was opened with.
    pub baud_rate: u32,

    /// Current lifecycle state.
    pub state: ForwarderState,

    /// The connected client, if any.
    pub client: Option<SocketAddr>,

    /// When the client connected.
    pub connected_since: Option<DateTime<Utc>>,
}

/// Called once when a forwarder shuts down for good.
pub type OnClose = Box<dyn FnOnce(ForwarderId) + Send>;

#[derive(Debug)]
enum ForwarderRequest {
    Restart {
        baud_rate: Option<u32>,
        handle: Option<Handle>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Builder for a forwarder. [`ForwarderBuilder::open`] starts it.
pub struct ForwarderBuilder {
    slot: DeviceSlot,
    opener: Arc<dyn DeviceOpener>,
    announcer: Box<dyn Announcer>,
    bind_address: IpAddr,
    host: String,
    on_close: Option<OnClose>,
}

impl ForwarderBuilder {
    /// Start a new builder.
    /// Listens on all IPv4 interfaces unless told otherwise.
    pub fn new(
        slot: DeviceSlot,
        opener: Arc<dyn DeviceOpener>,
        announcer: Box<dyn Announcer>,
    ) -> Self {
        Self {
            slot,
            opener,
            announcer,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            host: "localhost".into(),
            on_close: None,
        }
    }

    /// The address to listen on.
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// The host name used in announcements.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Called when the forwarder closes for good.
    pub fn on_close(mut self, on_close: OnClose) -> Self {
        self.on_close = Some(on_close);
        self
    }

    /// Open the device, listen, publish and start forwarding.
    ///
    /// Failing here leaves nothing behind: the caller may simply retry later.
    pub fn open(self) -> Result<ForwarderHandle, Error> {
        let id = ForwarderId::new();

        let mut forwarder = Forwarder {
            id,
            opener: self.opener,
            announcer: self.announcer,
            bind_address: self.bind_address,
            host: self.host,
            on_close: self.on_close,
            status: watch::channel(ForwarderStatus {
                id,
                location: self.slot.location.clone(),
                handle: self.slot.handle.clone(),
                port: self.slot.port,
                baud_rate: self.slot.baud_rate,
                state: ForwarderState::Closed,
                client: None,
                connected_since: None,
            })
            .0,
            slot: self.slot,
        };

        let link = forwarder.bring_up()?;

        let (requests_tx, requests_rx) = mpsc::unbounded();
        let status = forwarder.status.subscribe();

        let span = info_span!(
            "forwarder",
            location = %forwarder.slot.location,
            port = forwarder.slot.port
        );
        tokio::spawn(forwarder.run(link, requests_rx).instrument(span));

        Ok(ForwarderHandle {
            id,
            requests: requests_tx,
            status,
        })
    }
}

/// Talks to a running forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderHandle {
    id: ForwarderId,
    requests: mpsc::UnboundedSender<ForwarderRequest>,
    status: watch::Receiver<ForwarderStatus>,
}

impl ForwarderHandle {
    /// The instance id.
    pub fn id(&self) -> ForwarderId {
        self.id
    }

    /// The latest status.
    pub fn status(&self) -> ForwarderStatus {
        self.status.borrow().clone()
    }

    /// Close and reopen, optionally with a new baud rate or device path.
    ///
    /// If reopening fails the forwarder stays closed and reports the error.
    pub async fn restart(
        &self,
        baud_rate: Option<u32>,
        handle: Option<Handle>,
    ) -> Result<(), Error> {
        let (done, outcome) = oneshot::channel();

        self.requests
            .unbounded_send(ForwarderRequest::Restart {
                baud_rate,
                handle,
                done,
            })
            .map_err(|_| Error::NoSuchForwarder(self.id.to_string()))?;

        outcome
            .await
            .map_err(|_| Error::NoSuchForwarder(self.id.to_string()))?
    }

    /// Close for good. Returns once closed; closing twice is harmless.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();

        if self
            .requests
            .unbounded_send(ForwarderRequest::Close { done })
            .is_ok()
        {
            let _ = closed.await;
        }
    }
}

struct Forwarder {
    id: ForwarderId,
    slot: DeviceSlot,
    opener: Arc<dyn DeviceOpener>,
    announcer: Box<dyn Announcer>,
    bind_address: IpAddr,
    host: String,
    on_close: Option<OnClose>,
    status: watch::Sender<ForwarderStatus>,
}

enum Step {
    Request(Option<ForwarderRequest>),
    PollModem,
    Ready(Readiness),
}

enum Flow {
    Continue,
    Close,
}

impl Forwarder {
    fn bring_up(&mut self) -> Result<Link, Error> {
        let serial = self
            .opener
            .open(&self.slot.handle, self.slot.baud_rate)
            .map_err(|e| Error::OpenSerial {
                handle: self.slot.handle.to_string(),
                problem: e.to_string(),
            })?;

        let address = SocketAddr::new(self.bind_address, self.slot.port);
        let listener = socket::listen(address).map_err(|e| Error::Bind {
            port: self.slot.port,
            problem: e.to_string(),
        })?;

        if let Err(e) = self
            .announcer
            .publish(&Announcement::for_slot(&self.slot, &self.host))
        {
            warn!(%e, "Could not publish, serving anyway");
        }

        info!(slot = %self.slot, "Forwarder open");

        let link = Link::new(serial, listener);
        self.report(&link);

        Ok(link)
    }

    /// Unpublish, stop listening, let go of the client and the device.
    fn tear_down(&mut self, link: Link) {
        self.announcer.unpublish();

        let Link {
            mut serial,
            listener,
            client,
            ..
        } = link;

        drop(listener);

        if let Some(client) = client {
            client.release(serial.as_mut());
        }
        drop(serial);

        self.status.send_modify(|status| {
            status.state = ForwarderState::Closed;
            status.client = None;
            status.connected_since = None;
        });

        info!("Forwarder closed");
    }

    fn report(&self, link: &Link) {
        let status = ForwarderStatus {
            id: self.id,
            location: self.slot.location.clone(),
            handle: self.slot.handle.clone(),
            port: self.slot.port,
            baud_rate: self.slot.baud_rate,
            state: if link.client.is_some() {
                ForwarderState::ClientConnected
            } else {
                ForwarderState::Open
            },
            client: link.client.as_ref().map(|client| client.peer),
            connected_since: link.client.as_ref().map(|client| client.since),
        };

        self.status.send_replace(status);
    }

    fn finish(mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close(self.id);
        }
    }

    async fn run(
        mut self,
        mut link: Link,
        mut requests: mpsc::UnboundedReceiver<ForwarderRequest>,
    ) {
        let mut modem_poll = tokio::time::interval(MODEM_POLL_INTERVAL);
        modem_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                request = requests.next() => Step::Request(request),
                _ = modem_poll.tick(), if link.client.is_some() => Step::PollModem,
                ready = link.next_event() => Step::Ready(ready),
            };

            match step {
                Step::Request(Some(ForwarderRequest::Restart {
                    baud_rate,
                    handle,
                    done,
                })) => {
                    info!(?baud_rate, ?handle, "Restarting");
                    self.tear_down(link);

                    if let Some(baud_rate) = baud_rate {
                        self.slot.baud_rate = baud_rate;
                    }
                    if let Some(handle) = handle {
                        self.slot.handle = handle;
                    }

                    match self.bring_up() {
                        Ok(new_link) => {
                            link = new_link;
                            let _ = done.send(Ok(()));
                        }
                        Err(e) => {
                            warn!(%e, "Could not reopen");
                            let _ = done.send(Err(e));
                            break;
                        }
                    }
                }
                Step::Request(Some(ForwarderRequest::Close { done })) => {
                    self.tear_down(link);
                    self.finish();
                    let _ = done.send(());
                    return;
                }
                Step::Request(None) => {
                    debug!("Handle dropped");
                    self.tear_down(link);
                    break;
                }
                Step::PollModem => link.check_modem_lines(),
                Step::Ready(readiness) => {
                    let had_client = link.client.is_some();

                    if let Flow::Close = link.handle(readiness) {
                        self.tear_down(link);
                        break;
                    }

                    if had_client != link.client.is_some() {
                        self.report(&link);
                    }
                }
            }
        }

        self.finish();
    }
}

/// What became ready.
/// Read results carry the byte count; the bytes sit in the link's scratch buffers.
#[derive(Debug)]
enum Readiness {
    SerialRead(io::Result<usize>),
    SerialWritten(io::Result<usize>),
    ClientRead(io::Result<usize>),
    ClientWritten(io::Result<usize>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    since: DateTime<Utc>,
    manager: PortManager,
    snapshot: Option<LineSettings>,
}

impl Client {
    /// Drop control lines and put the line back the way it was found.
    fn release(self, serial: &mut dyn SerialDevice) {
        if let Err(e) = serial.write_rts(false) {
            warn!(%e, "Could not deassert RTS");
        }
        if let Err(e) = serial.write_dtr(false) {
            warn!(%e, "Could not deassert DTR");
        }
        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = serial.apply(snapshot) {
                warn!(%e, "Could not restore line settings");
            }
        }

        info!(peer = %self.peer, "Client disconnected");
    }
}

/// The open resources of a forwarder and the bytes in flight between them.
struct Link {
    serial: Box<dyn SerialDevice>,
    listener: TcpListener,
    client: Option<Client>,

    /// Network to serial.
    to_serial: BytesMut,

    /// Serial to network.
    to_network: BytesMut,

    serial_scratch: Box<[u8; CHUNK_SIZE]>,
    client_scratch: Box<[u8; CHUNK_SIZE]>,

    /// Set while accepting is paused.
    accept_backoff: Option<Pin<Box<Sleep>>>,
}

impl Link {
    fn new(serial: Box<dyn SerialDevice>, listener: TcpListener) -> Self {
        Self {
            serial,
            listener,
            client: None,
            to_serial: BytesMut::with_capacity(BACKPRESSURE_THRESHOLD),
            to_network: BytesMut::with_capacity(BACKPRESSURE_THRESHOLD),
            serial_scratch: Box::new([0; CHUNK_SIZE]),
            client_scratch: Box::new([0; CHUNK_SIZE]),
            accept_backoff: None,
        }
    }

    /// Wait for whichever interesting descriptor becomes ready first.
    ///
    /// - serial: always readable, writable only with pending network bytes
    /// - client: readable only below the backpressure threshold,
    ///   writable only with pending serial bytes
    /// - listener: unless paused after an accept error
    fn next_event(&mut self) -> impl Future<Output = Readiness> + '_ {
        poll_fn(move |cx| {
            let Link {
                serial,
                listener,
                client,
                to_serial,
                to_network,
                serial_scratch,
                client_scratch,
                accept_backoff,
            } = &mut *self;

            if let Some(client) = client.as_mut() {
                if !to_network.is_empty() {
                    if let Poll::Ready(written) =
                        Pin::new(&mut client.stream).poll_write(cx, &to_network[..])
                    {
                        return Poll::Ready(Readiness::ClientWritten(written));
                    }
                }
            }

            if !to_serial.is_empty() {
                if let Poll::Ready(written) = Pin::new(&mut *serial).poll_write(cx, &to_serial[..]) {
                    return Poll::Ready(Readiness::SerialWritten(written));
                }
            }

            if let Some(backoff) = accept_backoff {
                if backoff.as_mut().poll(cx).is_ready() {
                    *accept_backoff = None;
                }
            }

            if accept_backoff.is_none() {
                if let Poll::Ready(accepted) = listener.poll_accept(cx) {
                    return Poll::Ready(Readiness::Accepted(accepted));
                }
            }

            let mut buf = ReadBuf::new(&mut serial_scratch[..]);
            if let Poll::Ready(read) = Pin::new(&mut *serial).poll_read(cx, &mut buf) {
                return Poll::Ready(Readiness::SerialRead(read.map(|()| buf.filled().len())));
            }

            if let Some(client) = client.as_mut() {
                if to_serial.len() < BACKPRESSURE_THRESHOLD
                    && to_network.len() < BACKPRESSURE_THRESHOLD
                {
                    let mut buf = ReadBuf::new(&mut client_scratch[..]);
                    if let Poll::Ready(read) = Pin::new(&mut client.stream).poll_read(cx, &mut buf)
                    {
                        return Poll::Ready(Readiness::ClientRead(
                            read.map(|()| buf.filled().len()),
                        ));
                    }
                }
            }

            Poll::Pending
        })
    }

    fn handle(&mut self, readiness: Readiness) -> Flow {
        match readiness {
            Readiness::SerialRead(Ok(0)) => {
                info!("Serial device gone");
                return Flow::Close;
            }
            Readiness::SerialRead(Ok(n)) => {
                let data = &self.serial_scratch[..n];

                match &self.client {
                    Some(client) => {
                        trace!(n, "Serial to network");
                        self.to_network.extend(client.manager.escape(data));
                    }
                    None => trace!(n, "No client, discarding serial data"),
                }
            }
            Readiness::SerialRead(Err(e)) => {
                warn!(%e, "Serial read failed");
                return Flow::Close;
            }
            Readiness::SerialWritten(Ok(0)) => {
                warn!("Serial device accepts no more data");
                return Flow::Close;
            }
            Readiness::SerialWritten(Ok(n)) => {
                trace!(n, "Written to serial");
                self.to_serial.advance(n);
            }
            Readiness::SerialWritten(Err(e)) => {
                warn!(%e, "Serial write failed");
                return Flow::Close;
            }
            Readiness::ClientRead(Ok(0)) => {
                debug!("Client hung up");
                self.disconnect();
            }
            Readiness::ClientRead(Ok(n)) => {
                if let Some(client) = self.client.as_mut() {
                    let payload = client
                        .manager
                        .filter(&self.client_scratch[..n], self.serial.as_mut());
                    trace!(n, payload = payload.len(), "Network to serial");

                    self.to_serial.extend(payload);
                    self.to_network.extend(client.manager.take_replies());
                }
            }
            Readiness::ClientRead(Err(e)) => {
                debug!(%e, "Client read failed");
                self.disconnect();
            }
            Readiness::ClientWritten(Ok(n)) => {
                trace!(n, "Written to client");
                self.to_network.advance(n);
            }
            Readiness::ClientWritten(Err(e)) => {
                debug!(%e, "Client write failed");
                self.disconnect();
            }
            Readiness::Accepted(Ok((stream, peer))) => self.adopt(stream, peer),
            Readiness::Accepted(Err(e)) => {
                warn!(%e, backoff = ?ACCEPT_BACKOFF, "Accept failed, pausing accepts");
                self.accept_backoff = Some(Box::pin(tokio::time::sleep(ACCEPT_BACKOFF)));
            }
        }

        Flow::Continue
    }

    fn adopt(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Some(client) = &self.client {
            warn!(%peer, current = %client.peer, "Already serving a client, rejecting");
            return;
        }

        if let Err(e) = socket::configure(&stream) {
            warn!(%e, %peer, "Could not tune client socket");
        }

        if let Err(e) = self.serial.write_rts(true) {
            warn!(%e, "Could not assert RTS");
        }
        if let Err(e) = self.serial.write_dtr(true) {
            warn!(%e, "Could not assert DTR");
        }

        let snapshot = match self.serial.settings() {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(%e, "Could not snapshot line settings, they will not be restored");
                None
            }
        };

        let mut manager = PortManager::new();
        self.to_network.extend(manager.take_replies());

        info!(%peer, "Client connected");

        self.client = Some(Client {
            stream,
            peer,
            since: Utc::now(),
            manager,
            snapshot,
        });
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            client.release(self.serial.as_mut());
            self.to_network.clear();
        }
    }

    fn check_modem_lines(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client
                .manager
                .check_modem_lines(self.serial.as_mut(), false);
            self.to_network.extend(client.manager.take_replies());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[tokio::test]
    async fn accepts_pause_after_a_failure() {
        let (device, _far) = MockDevice::pair(LineSettings::with_baud_rate(115_200));
        let listener = socket::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let address = listener.local_addr().unwrap();
        let mut link = Link::new(Box::new(device), listener);

        // Out of descriptors
        link.handle(Readiness::Accepted(Err(io::Error::from_raw_os_error(24))));

        let _client = TcpStream::connect(address).await.unwrap();

        let paused = tokio::time::timeout(Duration::from_millis(50), link.next_event()).await;
        assert!(paused.is_err(), "{paused:?}");

        tokio::time::sleep(ACCEPT_BACKOFF + Duration::from_millis(50)).await;

        let event = link.next_event().await;
        assert!(matches!(event, Readiness::Accepted(Ok(_))), "{event:?}");
    }
}
