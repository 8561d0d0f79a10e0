//! A flat key-value table kept on disk as RON.
//!
//! Loading never fails: a missing or broken file yields an empty table.
//! Saving writes a sibling temporary file and renames it into place,
//! so a crash mid-write can at most lose the latest mutation.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::Error;

/// An on-disk map from `K` to `V`.
#[derive(Debug)]
pub struct Store<K, V> {
    path: PathBuf,
    map: BTreeMap<K, V>,
}

/// Write `contents` and make sure they reached the disk.
fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

impl<K, V> Store<K, V>
where
    K: Ord + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    /// Load the map at `path`.
    /// Absent, unreadable or unparseable files give an empty map.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let map = match fs::read_to_string(&path) {
            Ok(contents) => match ron::from_str::<BTreeMap<K, V>>(&contents) {
                Ok(map) => {
                    debug!(?path, entries = map.len(), "Loaded");
                    map
                }
                Err(e) => {
                    warn!(?path, %e, "Could not parse, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "No file yet, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                warn!(?path, %e, "Could not read, starting empty");
                BTreeMap::new()
            }
        };

        Self { path, map }
    }

    /// Overwrite the file with the current contents.
    pub fn save(&self) -> Result<(), Error> {
        let persist_error = |problem: String| Error::Persist {
            path: self.path.display().to_string(),
            problem,
        };

        let contents = ron::ser::to_string_pretty(&self.map, ron::ser::PrettyConfig::default())
            .map_err(|e| persist_error(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| persist_error(e.to_string()))?;
        }

        let mut temporary = self.path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);

        write_synced(&temporary, contents.as_bytes())
            .map_err(|e| persist_error(e.to_string()))?;
        fs::rename(&temporary, &self.path).map_err(|e| persist_error(e.to_string()))?;

        debug!(path = ?self.path, entries = self.map.len(), "Saved");
        Ok(())
    }

    /// Save, logging instead of returning failures.
    pub(crate) fn save_or_warn(&self) {
        if let Err(e) = self.save() {
            warn!(%e, "Persisting failed, continuing with in-memory state");
        }
    }

    /// The current contents.
    pub fn map(&self) -> &BTreeMap<K, V> {
        &self.map
    }

    /// Mutable access. Call [`Store::save`] afterwards.
    pub(crate) fn map_mut(&mut self) -> &mut BTreeMap<K, V> {
        &mut self.map
    }
}
