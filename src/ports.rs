use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
};

use tracing::info;

use crate::{device::Location, error::Error, persistence::Store};

/// Hands out stable TCP ports per [`Location`].
///
/// A location keeps its port for as long as the backing file has it.
/// New locations get the lowest port at or above the base port
/// which no other location holds.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    store: Store<Location, u16>,
}

impl PortAllocator {
    /// Load previous assignments from `path`.
    pub fn load<P: AsRef<Path>>(path: P, base: u16) -> Self {
        Self {
            base,
            store: Store::load(path),
        }
    }

    /// The port for `location`, assigning and persisting a new one if needed.
    pub fn assign(&mut self, location: &Location) -> Result<u16, Error> {
        if let Some(port) = self.store.map().get(location) {
            return Ok(*port);
        }

        let taken = self.store.map().values().copied().collect::<HashSet<_>>();

        let port = (self.base..=u16::MAX)
            .find(|candidate| !taken.contains(candidate))
            .ok_or(Error::PortsExhausted(self.base))?;

        info!(%location, port, "Assigned new port");

        self.store.map_mut().insert(location.clone(), port);
        self.store.save_or_warn();

        Ok(port)
    }

    /// Forget every location not in `present`.
    /// Returns the ports which were released.
    pub fn retain_present(&mut self, present: &BTreeSet<Location>) -> Vec<u16> {
        let gone = self
            .store
            .map()
            .iter()
            .filter(|(location, _)| !present.contains(*location))
            .map(|(location, port)| (location.clone(), *port))
            .collect::<Vec<_>>();

        if gone.is_empty() {
            return vec![];
        }

        for (location, port) in &gone {
            info!(%location, port, "Releasing port of absent device");
            self.store.map_mut().remove(location);
        }
        self.store.save_or_warn();

        gone.into_iter().map(|(_, port)| port).collect()
    }
}
