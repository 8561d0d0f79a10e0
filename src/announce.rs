//! Service-discovery advertisement of forwarded ports.

use std::{process::Stdio, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::{device::DeviceSlot, error::Error};

/// The DNS-SD service type of an RFC 2217 port.
pub const SERVICE_TYPE: &str = "_rfc2217._tcp";

/// What gets advertised for one forwarded port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Human readable service name.
    pub name: String,

    /// The TCP port.
    pub port: u16,

    /// DNS-SD service type.
    pub service_type: String,

    /// The host the service runs on.
    pub host: String,

    /// TXT records.
    pub txt: Vec<(String, String)>,
}

impl Announcement {
    /// The announcement for a device slot served from `host`.
    pub fn for_slot(slot: &DeviceSlot, host: &str) -> Self {
        Self {
            name: format!("{} ({}) on {host}", slot.handle, slot.location),
            port: slot.port,
            service_type: SERVICE_TYPE.into(),
            host: host.into(),
            txt: vec![
                ("location".into(), slot.location.to_string()),
                ("device".into(), slot.handle.as_str().into()),
            ],
        }
    }
}

/// Publishes one service at a time.
pub trait Announcer: Send {
    /// Advertise the service.
    fn publish(&mut self, announcement: &Announcement) -> Result<(), Error>;

    /// Withdraw the service, if published.
    fn unpublish(&mut self);
}

/// Creates one [`Announcer`] per forwarder.
pub trait AnnouncerFactory: Send + Sync {
    /// A fresh announcer.
    fn create(&self) -> Box<dyn Announcer>;
}

/// How forwarded ports are advertised.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum AnnounceMode {
    /// Only log what would be published.
    #[default]
    Log,

    /// Run `avahi-publish-service` per port.
    Avahi,

    /// Do nothing.
    Off,
}

/// The factory for a mode.
///
/// `host` is passed on to avahi only when set explicitly.
pub fn factory(mode: AnnounceMode, host: Option<String>) -> Arc<dyn AnnouncerFactory> {
    match mode {
        AnnounceMode::Log => Arc::new(LogAnnouncers),
        AnnounceMode::Avahi => Arc::new(AvahiAnnouncers { host }),
        AnnounceMode::Off => Arc::new(NoAnnouncers),
    }
}

/// The host name of this machine.
pub fn system_hostname() -> String {
    #[cfg(unix)]
    {
        match nix::unistd::gethostname() {
            Ok(name) => return name.to_string_lossy().into_owned(),
            Err(e) => warn!(%e, "Could not get the host name"),
        }
    }

    "localhost".into()
}

struct LogAnnouncers;

#[derive(Default)]
struct LogAnnouncer {
    published: Option<String>,
}

impl AnnouncerFactory for LogAnnouncers {
    fn create(&self) -> Box<dyn Announcer> {
        Box::<LogAnnouncer>::default()
    }
}

impl Announcer for LogAnnouncer {
    fn publish(&mut self, announcement: &Announcement) -> Result<(), Error> {
        info!(
            name = %announcement.name,
            port = announcement.port,
            service_type = %announcement.service_type,
            "Publishing"
        );
        self.published = Some(announcement.name.clone());

        Ok(())
    }

    fn unpublish(&mut self) {
        if let Some(name) = self.published.take() {
            info!(%name, "Unpublishing");
        }
    }
}

struct NoAnnouncers;

struct NoAnnouncer;

impl AnnouncerFactory for NoAnnouncers {
    fn create(&self) -> Box<dyn Announcer> {
        Box::new(NoAnnouncer)
    }
}

impl Announcer for NoAnnouncer {
    fn publish(&mut self, _announcement: &Announcement) -> Result<(), Error> {
        Ok(())
    }

    fn unpublish(&mut self) {}
}

struct AvahiAnnouncers {
    host: Option<String>,
}

struct AvahiAnnouncer {
    host: Option<String>,
    child: Option<Child>,
}

impl AnnouncerFactory for AvahiAnnouncers {
    fn create(&self) -> Box<dyn Announcer> {
        Box::new(AvahiAnnouncer {
            host: self.host.clone(),
            child: None,
        })
    }
}

impl AvahiAnnouncer {
    fn command(&self, announcement: &Announcement) -> Command {
        let mut command = Command::new("avahi-publish-service");

        if let Some(host) = &self.host {
            command.arg("-H").arg(host);
        }

        command
            .arg(&announcement.name)
            .arg(&announcement.service_type)
            .arg(announcement.port.to_string())
            .args(
                announcement
                    .txt
                    .iter()
                    .map(|(key, value)| format!("{key}={value}")),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        command
    }
}

impl Announcer for AvahiAnnouncer {
    fn publish(&mut self, announcement: &Announcement) -> Result<(), Error> {
        self.unpublish();

        let child = self
            .command(announcement)
            .spawn()
            .map_err(|e| Error::Announce(format!("avahi-publish-service: {e}")))?;

        info!(name = %announcement.name, port = announcement.port, "Published via avahi");
        self.child = Some(child);

        Ok(())
    }

    fn unpublish(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!(%e, "Could not stop avahi-publish-service");
            } else {
                info!("Unpublished via avahi");
            }
        }
    }
}

impl Drop for AvahiAnnouncer {
    fn drop(&mut self) {
        self.unpublish();
    }
}
