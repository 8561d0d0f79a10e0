//! The gateway owns every forwarder.
//!
//! It is a single task receiving messages, so discovery, cleanup and
//! operator commands never race each other.
//! The port and baud rate maps live here too, which makes the gateway
//! the only writer of their files.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Debug,
    sync::Arc,
};

use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use itertools::Itertools;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    announce::{self, AnnouncerFactory},
    baud::BaudRates,
    commands::{Command, CommandMessage, CommandOutcome, Target},
    config::Config,
    device::{DeviceSlot, Handle, Location},
    discovery::{self, sysfs, DeviceScanner, SerialScanner},
    error::Error,
    forwarder::{ForwarderBuilder, ForwarderHandle, ForwarderId, ForwarderStatus},
    ports::PortAllocator,
    serial::{DeviceOpener, NativeOpener},
};

/// What the gateway talks to outside of itself.
pub struct Collaborators {
    /// Lists present devices.
    pub scanner: Box<dyn DeviceScanner>,

    /// Opens serial devices.
    pub opener: Arc<dyn DeviceOpener>,

    /// Advertises forwarded ports.
    pub announcers: Arc<dyn AnnouncerFactory>,
}

impl Collaborators {
    /// The real system: serial ports, sysfs and the configured announcer.
    pub fn system(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            scanner: Box::new(SerialScanner::new(
                &config.device_pattern,
                &config.sysfs_root,
            )?),
            opener: Arc::new(NativeOpener),
            announcers: announce::factory(config.announce, config.announce_host.clone()),
        })
    }
}

/// Inform the gateway of events.
#[derive(Debug)]
pub(crate) enum Inform {
    /// A forwarder shut down on its own, or failed to reopen.
    ForwarderClosed { location: Location, id: ForwarderId },
}

pub(crate) enum Request {
    Command {
        message: CommandMessage,
        response: Option<oneshot::Sender<Result<CommandOutcome, Error>>>,
    },
    Forwarders(oneshot::Sender<Vec<ForwarderStatus>>),
    Reconcile(oneshot::Sender<()>),
    Cleanup(oneshot::Sender<Vec<u16>>),
    Shutdown(oneshot::Sender<()>),
}

impl Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Command { message, .. } => f
                .debug_struct("Command")
                .field("message", message)
                .finish(),
            Request::Forwarders(_) => write!(f, "Forwarders"),
            Request::Reconcile(_) => write!(f, "Reconcile"),
            Request::Cleanup(_) => write!(f, "Cleanup"),
            Request::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum GatewayMessage {
    Request(Request),
    Inform(Inform),
}

/// Talks to the gateway task.
#[derive(Debug, Clone)]
pub struct GatewayHandle(mpsc::UnboundedSender<GatewayMessage>);

impl GatewayHandle {
    /// Start a gateway.
    /// The first device scan happens right away.
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let (tx, rx) = mpsc::unbounded::<GatewayMessage>();

        let gateway = Gateway::new(config, collaborators, rx, tx.clone());

        tokio::spawn(gateway.run().instrument(info_span!("gateway")));

        Self(tx)
    }

    async fn request<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();

        self.0
            .unbounded_send(GatewayMessage::Request(request(tx)))
            .map_err(|_| Error::InternalIssue("The gateway is not running".into()))?;

        rx.await
            .map_err(|_| Error::InternalIssue("The gateway stopped before answering".into()))
    }

    /// Queue a command without waiting for it.
    pub fn submit(&self, message: CommandMessage) {
        let message = GatewayMessage::Request(Request::Command {
            message,
            response: None,
        });

        if self.0.unbounded_send(message).is_err() {
            warn!("The gateway is not running, command dropped");
        }
    }

    /// Run a command and wait for its outcome.
    pub async fn command(&self, message: CommandMessage) -> Result<CommandOutcome, Error> {
        self.request(|tx| Request::Command {
            message,
            response: Some(tx),
        })
        .await?
    }

    /// The status of every live forwarder, ordered by port.
    pub async fn forwarders(&self) -> Vec<ForwarderStatus> {
        self.request(Request::Forwarders).await.unwrap_or_default()
    }

    /// Scan and reconcile now. Returns once done.
    pub async fn reconcile(&self) {
        let _ = self.request(Request::Reconcile).await;
    }

    /// Purge entries of absent devices now.
    /// Returns the ports that were released.
    pub async fn cleanup(&self) -> Vec<u16> {
        self.request(Request::Cleanup).await.unwrap_or_default()
    }

    /// Close every forwarder and stop.
    pub async fn shutdown(&self) {
        let _ = self.request(Request::Shutdown).await;
    }
}

struct Gateway {
    config: Config,
    host: String,

    messages: mpsc::UnboundedReceiver<GatewayMessage>,
    myself: mpsc::UnboundedSender<GatewayMessage>,

    forwarders: HashMap<Location, ForwarderHandle>,
    latest_scan: Option<BTreeMap<Location, Handle>>,

    ports: PortAllocator,
    bauds: BaudRates,

    collaborators: Collaborators,
}

enum Event {
    Discover,
    Cleanup,
    Message(Option<GatewayMessage>),
}

async fn tick_maybe(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}

impl Gateway {
    fn new(
        config: Config,
        collaborators: Collaborators,
        messages: mpsc::UnboundedReceiver<GatewayMessage>,
        myself: mpsc::UnboundedSender<GatewayMessage>,
    ) -> Self {
        let host = config
            .announce_host
            .clone()
            .unwrap_or_else(announce::system_hostname);

        Self {
            ports: PortAllocator::load(&config.port_map, config.base_port),
            bauds: BaudRates::load(&config.baud_map, config.default_baud_rate),
            config,
            host,
            messages,
            myself,
            forwarders: HashMap::new(),
            latest_scan: None,
            collaborators,
        }
    }

    async fn run(mut self) {
        info!(
            base_port = self.config.base_port,
            pattern = %self.config.device_pattern,
            "Gateway running"
        );

        // First scan before anything else is handled
        self.reconcile().await;

        let period = self.config.discovery_interval();
        let mut discovery = time::interval_at(Instant::now() + period, period);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cleanup = self.config.cleanup_interval().map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let event = tokio::select! {
                _ = discovery.tick() => Event::Discover,
                _ = tick_maybe(&mut cleanup) => Event::Cleanup,
                message = self.messages.next() => Event::Message(message),
            };

            match event {
                Event::Discover => self.reconcile().await,
                Event::Cleanup => {
                    self.cleanup();
                }
                Event::Message(Some(GatewayMessage::Request(request))) => {
                    trace!(?request, "Request");

                    match request {
                        Request::Command { message, response } => {
                            let outcome = self.dispatch(&message).await;

                            match &outcome {
                                Ok(outcome) => info!(?outcome, "Command done"),
                                Err(e) => warn!(%e, ?message, "Command dropped"),
                            }

                            if let Some(response) = response {
                                let _ = response.send(outcome);
                            }
                        }
                        Request::Forwarders(response) => {
                            let _ = response.send(self.statuses());
                        }
                        Request::Reconcile(response) => {
                            self.reconcile().await;
                            let _ = response.send(());
                        }
                        Request::Cleanup(response) => {
                            let _ = response.send(self.cleanup());
                        }
                        Request::Shutdown(response) => {
                            self.close_all().await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
                Event::Message(Some(GatewayMessage::Inform(Inform::ForwarderClosed {
                    location,
                    id,
                }))) => self.forget(location, id),
                Event::Message(None) => {
                    self.close_all().await;
                    break;
                }
            }
        }

        info!("Gateway stopped");
    }

    fn statuses(&self) -> Vec<ForwarderStatus> {
        self.forwarders
            .values()
            .map(ForwarderHandle::status)
            .sorted_by_key(|status| status.port)
            .collect()
    }

    fn forget(&mut self, location: Location, id: ForwarderId) {
        match self.forwarders.get(&location) {
            Some(forwarder) if forwarder.id() == id => {
                info!(%location, "Forwarder closed, forgetting it");
                self.forwarders.remove(&location);
            }
            _ => trace!(%location, %id, "Stale close notification"),
        }
    }

    async fn reconcile(&mut self) {
        let present = match self.collaborators.scanner.scan() {
            Ok(present) => present,
            Err(e) => {
                warn!(%e, "Scan failed, skipping");
                return;
            }
        };

        let owned = self.forwarders.keys().cloned().collect::<BTreeSet<_>>();
        let plan = discovery::plan(&present, &owned);

        if !plan.is_empty() {
            debug!(?plan, "Reconciling");
        }

        for location in plan.removed {
            if let Some(forwarder) = self.forwarders.remove(&location) {
                info!(%location, "Device gone");
                forwarder.close().await;
            }
        }

        for location in plan.added {
            if let Some(handle) = present.get(&location) {
                self.start(location.clone(), handle.clone());
            }
        }

        self.latest_scan = Some(present);
    }

    fn start(&mut self, location: Location, handle: Handle) {
        let port = match self.ports.assign(&location) {
            Ok(port) => port,
            Err(e) => {
                warn!(%e, %location, "No port for device");
                return;
            }
        };

        let slot = DeviceSlot {
            location: location.clone(),
            handle,
            port,
            baud_rate: self.bauds.resolve(port),
        };

        let myself = self.myself.clone();
        let closed_location = location.clone();

        let opened = ForwarderBuilder::new(
            slot.clone(),
            self.collaborators.opener.clone(),
            self.collaborators.announcers.create(),
        )
        .bind_address(self.config.bind_address)
        .host(&self.host)
        .on_close(Box::new(move |id| {
            let _ = myself.unbounded_send(GatewayMessage::Inform(Inform::ForwarderClosed {
                location: closed_location,
                id,
            }));
        }))
        .open();

        match opened {
            Ok(forwarder) => {
                self.forwarders.insert(location, forwarder);
            }
            Err(e) => warn!(%e, %slot, "Could not start forwarder, retrying next scan"),
        }
    }

    /// Forget persisted entries of devices not seen in the latest scan.
    fn cleanup(&mut self) -> Vec<u16> {
        let Some(latest) = &self.latest_scan else {
            debug!("No scan yet, nothing to clean up");
            return vec![];
        };

        let present = latest.keys().cloned().collect::<BTreeSet<_>>();
        let released = self.ports.retain_present(&present);

        for port in &released {
            self.bauds.remove(*port);
        }

        if !released.is_empty() {
            info!(?released, "Cleaned up absent devices");
        }

        released
    }

    async fn close_all(&mut self) {
        info!(forwarders = self.forwarders.len(), "Closing all forwarders");

        for (_, forwarder) in self.forwarders.drain() {
            forwarder.close().await;
        }
    }

    fn find(&self, target: &Target) -> Result<Location, Error> {
        match target {
            Target::Location(location) if self.forwarders.contains_key(location) => {
                Ok(location.clone())
            }
            Target::Location(location) => Err(Error::NoSuchForwarder(location.to_string())),
            Target::Port(port) => self
                .forwarders
                .iter()
                .find(|(_, forwarder)| forwarder.status().port == *port)
                .map(|(location, _)| location.clone())
                .ok_or_else(|| Error::NoSuchForwarder(format!("port {port}"))),
        }
    }

    async fn restart(
        &mut self,
        location: Location,
        baud_rate: Option<u32>,
    ) -> Result<ForwarderStatus, Error> {
        let Some(forwarder) = self.forwarders.get(&location).cloned() else {
            return Err(Error::NoSuchForwarder(location.to_string()));
        };

        let handle = self
            .latest_scan
            .as_ref()
            .and_then(|scan| scan.get(&location))
            .cloned();

        match forwarder.restart(baud_rate, handle).await {
            Ok(()) => Ok(forwarder.status()),
            Err(e) => {
                self.forwarders.remove(&location);
                Err(e)
            }
        }
    }

    async fn dispatch(&mut self, message: &CommandMessage) -> Result<CommandOutcome, Error> {
        let command = Command::try_from(message)?;

        match command {
            Command::Restart(target) => {
                let location = self.find(&target)?;
                info!(%location, "Restarting");

                let status = self.restart(location, None).await?;

                Ok(CommandOutcome::Restarted {
                    location: status.location,
                    port: status.port,
                })
            }
            Command::Reattach(target) => {
                let location = self.find(&target)?;
                info!(%location, "Reattaching driver");

                sysfs::reattach_driver(&self.config.sysfs_root, &location).await?;

                Ok(CommandOutcome::Reattached { location })
            }
            Command::SetBaudRate { port, rate } => {
                let location = self.find(&Target::Port(port))?;

                self.bauds.set_override(port, rate);
                let rate = self.bauds.resolve(port);
                info!(%location, port, rate, "Changing baud rate");

                let status = self.restart(location, Some(rate)).await?;

                Ok(CommandOutcome::BaudRateSet {
                    port: status.port,
                    rate: status.baud_rate,
                })
            }
        }
    }
}
