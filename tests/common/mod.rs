#![allow(dead_code)]

use std::{collections::BTreeMap, future::Future, path::Path, time::Duration};

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serial_dock::{
    announce::AnnounceMode,
    config::Config,
    gateway::{Collaborators, GatewayHandle},
    mock::{MockOpener, MockScanner, RecordingAnnouncers},
    rfc2217::{COM_PORT_OPTION, DO, ECHO, IAC, SB, SE, SGA, WILL, BINARY},
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::TcpStream,
    time::timeout,
};
use tracing::info;

/// What the gateway sends a fresh client.
pub const NEGOTIATION: [u8; 12] = [
    IAC, WILL, ECHO, //
    IAC, WILL, SGA, //
    IAC, DO, BINARY, //
    IAC, WILL, COM_PORT_OPTION,
];

/// A gateway with all of its surroundings mocked.
pub struct Bench {
    pub gateway: GatewayHandle,
    pub config: Config,
    pub scanner: MockScanner,
    pub opener: MockOpener,
    pub announcers: RecordingAnnouncers,
    pub dir: TempDir,
}

pub fn config(dir: &Path, base_port: u16) -> Config {
    Config {
        base_port,
        bind_address: [127, 0, 0, 1].into(),
        port_map: dir.join("ports.ron"),
        baud_map: dir.join("baudrates.ron"),
        // Tests drive reconciliation themselves
        discovery_interval_secs: 3600,
        cleanup_interval_secs: None,
        control_enabled: false,
        announce: AnnounceMode::Off,
        announce_host: Some("bench".into()),
        sysfs_root: dir.join("sys"),
        ..Default::default()
    }
}

impl Bench {
    pub fn new(base_port: u16) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path(), base_port);

        Ok(Self::start(
            config,
            dir,
            MockScanner::new(),
            MockOpener::new(),
            RecordingAnnouncers::new(),
        ))
    }

    fn start(
        config: Config,
        dir: TempDir,
        scanner: MockScanner,
        opener: MockOpener,
        announcers: RecordingAnnouncers,
    ) -> Self {
        let gateway = GatewayHandle::new(
            config.clone(),
            Collaborators {
                scanner: Box::new(scanner.clone()),
                opener: std::sync::Arc::new(opener.clone()),
                announcers: std::sync::Arc::new(announcers.clone()),
            },
        );

        Self {
            gateway,
            config,
            scanner,
            opener,
            announcers,
            dir,
        }
    }

    /// Shut the gateway down and start a new one with the same files and mocks.
    pub async fn restart(self) -> Self {
        self.gateway.shutdown().await;

        Self::start(
            self.config,
            self.dir,
            self.scanner,
            self.opener,
            self.announcers,
        )
    }

    /// Ports of live forwarders by location.
    pub async fn ports(&self) -> BTreeMap<String, u16> {
        self.gateway
            .forwarders()
            .await
            .into_iter()
            .map(|status| (status.location.to_string(), status.port))
            .collect()
    }

    pub fn port_map(&self) -> BTreeMap<String, u16> {
        read_ron(&self.config.port_map)
    }

    pub fn baud_map(&self) -> BTreeMap<u16, u32> {
        read_ron(&self.config.baud_map)
    }
}

pub fn read_ron<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(contents) => ron::from_str(&contents).unwrap(),
        Err(_) => T::default(),
    }
}

/// Connect as a client and consume the initial negotiation.
pub async fn connect(port: u16) -> Result<TcpStream> {
    info!("Connecting to forwarder on port {port}");
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let negotiation = read_exactly(&mut stream, NEGOTIATION.len()).await?;
    assert_eq!(negotiation, NEGOTIATION);

    Ok(stream)
}

pub async fn read_exactly<R: AsyncRead + Unpin>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; n];
    timeout(Duration::from_secs(5), reader.read_exact(&mut buf)).await??;

    Ok(buf)
}

/// A COM-PORT-OPTION subnegotiation, unescaped values only.
pub fn subnegotiation(code: u8, value: &[u8]) -> Vec<u8> {
    let mut bytes = vec![IAC, SB, COM_PORT_OPTION, code];
    bytes.extend_from_slice(value);
    bytes.extend([IAC, SE]);
    bytes
}

/// Wait until `check` holds, or fail after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Err(eyre!("Timed out waiting for: {what}"))
}
