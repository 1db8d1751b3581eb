//! Flat JSON preference store.
//!
//! The resolver persists exactly one value here, the last active machine id,
//! read back at startup to restore the selection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

pub const ACTIVE_MACHINE_KEY: &str = "active_machine";

#[derive(Default)]
pub struct Preferences {
    values: BTreeMap<String, String>,
    path: Option<PathBuf>,
}

impl Preferences {
    /// In-memory store, nothing persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store backed by a JSON file; missing or unreadable files start empty.
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Could not parse preferences file {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(_) => {
                debug!("No preferences file at {:?}, starting empty", path);
                BTreeMap::new()
            }
        };
        Self {
            values,
            path: Some(path),
        }
    }

    /// Default per-user location via the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        Some(dirs::config_dir()?.join("printstack").join("preferences.json"))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
        if let Some(path) = self.path.clone() {
            if let Err(e) = self.save_to(&path) {
                warn!("Could not persist preferences: {e:#}");
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating preferences dir {parent:?}"))?;
        }
        let json = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(path, json).with_context(|| format!("writing preferences to {path:?}"))?;
        Ok(())
    }
}
