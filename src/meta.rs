//! Durable broker metadata: exchanges, queues and bindings that survive a
//! restart, kept as one JSON snapshot next to the queue logs.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::registry::{Binding, Exchange, QueueMeta};
use crate::Result;

pub const META_FILE_NAME: &str = "meta.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    #[serde(default)]
    pub queues: Vec<QueueMeta>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

pub struct MetaStore {
    path: PathBuf,
}

impl MetaStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(META_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot; a missing file is an empty broker.
    pub fn load(&self) -> Result<Metadata> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the snapshot atomically (temp file, fsync, rename).
    pub fn save(&self, meta: &Metadata) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(meta)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            "saved metadata: {} exchanges, {} queues, {} bindings",
            meta.exchanges.len(),
            meta.queues.len(),
            meta.bindings.len()
        );
        Ok(())
    }
}
