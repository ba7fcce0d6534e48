// Tunnel status file for external monitoring

//! Status file writer
//!
//! Renders every known tunnel entity into one KEY=VALUE file for consumption
//! by external tools (status bar widgets, shell scripts). The file is
//! rewritten as a whole on every change through a temp file and rename, so
//! readers never see a partial write.

use crate::entity::{EntitySink, TunnelEntity};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Rendered view of one entity
#[derive(Debug, Clone, PartialEq, Eq)]
struct EntityView {
    name: String,
    status: &'static str,
    attributes: Vec<(&'static str, String)>,
}

impl EntityView {
    fn of(entity: &TunnelEntity) -> Self {
        Self {
            name: entity.name(),
            status: entity.status().as_str(),
            attributes: entity.attributes(),
        }
    }
}

/// [`EntitySink`] that mirrors entities into a status file
pub struct StateFileSink {
    path: PathBuf,
    tunnels: Mutex<BTreeMap<String, EntityView>>,
}

impl StateFileSink {
    /// Sink writing to `path`; nothing is written until the first change
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tunnels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Status file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the status file on shutdown
    pub fn cleanup(&self) {
        let _ = fs::remove_file(&self.path);
    }

    fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, EntityView>),
    {
        // Lock held across the write so concurrent publishes land in order
        let mut tunnels = self.tunnels.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut tunnels);
        self.write(&render(&tunnels))
    }

    fn write(&self, content: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).context("Failed to create state directory")?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content).context("Failed to write state file")?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move state file into place at {:?}", self.path))?;
        Ok(())
    }
}

impl EntitySink for StateFileSink {
    fn add_entities(&self, entities: &[Arc<TunnelEntity>]) -> Result<()> {
        self.update(|tunnels| {
            for entity in entities {
                tunnels.insert(entity.unique_id().to_string(), EntityView::of(entity));
            }
        })
    }

    fn publish(&self, entity: &TunnelEntity) -> Result<()> {
        let view = EntityView::of(entity);
        {
            let tunnels = self.tunnels.lock().unwrap_or_else(PoisonError::into_inner);
            if tunnels.get(entity.unique_id()) == Some(&view) {
                return Ok(());
            }
        }
        self.update(|tunnels| {
            tunnels.insert(entity.unique_id().to_string(), view);
        })
    }

    fn remove_entity(&self, unique_id: &str) -> Result<()> {
        self.update(|tunnels| {
            tunnels.remove(unique_id);
        })
    }
}

/// Attribute label as a status file key (`Local addr` -> `LOCAL_ADDR`)
fn key_of(label: &str) -> String {
    label.to_ascii_uppercase().replace(' ', "_")
}

fn render(tunnels: &BTreeMap<String, EntityView>) -> String {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut out = format!("TIMESTAMP={}\nTUNNELS={}\n", timestamp, tunnels.len());
    for (id, view) in tunnels {
        // Writing into a String cannot fail
        let _ = write!(out, "\n[{}]\nNAME={}\nSTATUS={}\n", id, view.name, view.status);
        for (label, value) in &view.attributes {
            let _ = writeln!(out, "{}={}", key_of(label), value);
        }
    }
    out
}
