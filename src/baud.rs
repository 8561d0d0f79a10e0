use std::path::Path;

use tracing::info;

use crate::persistence::Store;

/// Setting this rate means "use the default".
pub const UNSET: u32 = 0;

/// Per-port baud rate overrides.
///
/// Ports without an entry use the system default,
/// and the default itself is never stored.
#[derive(Debug)]
pub struct BaudRates {
    system_default: u32,
    store: Store<u16, u32>,
}

impl BaudRates {
    /// Load previous overrides from `path`.
    pub fn load<P: AsRef<Path>>(path: P, system_default: u32) -> Self {
        Self {
            system_default,
            store: Store::load(path),
        }
    }

    /// The effective baud rate for `port`.
    pub fn resolve(&self, port: u16) -> u32 {
        self.store
            .map()
            .get(&port)
            .copied()
            .unwrap_or(self.system_default)
    }

    /// Override the rate for `port`.
    /// The default rate (or [`UNSET`]) clears the override.
    pub fn set_override(&mut self, port: u16, rate: u32) {
        if rate == self.system_default || rate == UNSET {
            if self.store.map_mut().remove(&port).is_some() {
                info!(port, "Baud rate override cleared");
                self.store.save_or_warn();
            }
        } else {
            info!(port, rate, "Baud rate override stored");
            self.store.map_mut().insert(port, rate);
            self.store.save_or_warn();
        }
    }

    /// Drop any override for `port`.
    pub fn remove(&mut self, port: u16) {
        if self.store.map_mut().remove(&port).is_some() {
            info!(port, "Baud rate override dropped");
            self.store.save_or_warn();
        }
    }

    /// The stored override, if any.
    pub fn get(&self, port: u16) -> Option<u32> {
        self.store.map().get(&port).copied()
    }
}
