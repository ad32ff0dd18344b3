//! File-backed key/value store for the station list and the signed-in user.
//!
//! Each key is one JSON document under the data directory. Documents are read
//! once at startup and rewritten whole on every mutation. Runtime writes go
//! through one writer task so they land in the order they were made.

use crate::config::{write_atomic, AppConfig};
use crate::models::{seed_stations, Station, User};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const STATIONS_KEY: &str = "ed_stations";
pub const USER_KEY: &str = "ed_user";

#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
        };
        let value = serde_json::from_slice(&bytes).with_context(|| format!("Invalid JSON in {path:?}"))?;
        Ok(Some(value))
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value).with_context(|| format!("Serialize {key}"))?;
        write_atomic(&self.path_for(key), &data)?;
        debug!(key, bytes = data.len(), "stored document");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {path:?}")),
        }
    }

    /// Loads the station list, seeding and persisting the default station on first run.
    pub fn load_stations(&self) -> Result<Vec<Station>> {
        if let Some(stations) = self.get::<Vec<Station>>(STATIONS_KEY)? {
            return Ok(stations);
        }
        let seeded = seed_stations();
        info!(dir = ?self.dir, "no station list found, seeding defaults");
        self.set(STATIONS_KEY, &seeded)?;
        Ok(seeded)
    }

    pub fn save_stations(&self, stations: &[Station]) -> Result<()> {
        self.set(STATIONS_KEY, &stations)
    }

    pub fn load_user(&self) -> Result<Option<User>> {
        self.get(USER_KEY)
    }

    pub fn save_user(&self, user: &User) -> Result<()> {
        self.set(USER_KEY, user)
    }

    pub fn clear_user(&self) -> Result<()> {
        self.remove(USER_KEY)
    }
}

/// One pending write of local state.
#[derive(Debug)]
pub enum Persist {
    Stations(Vec<Station>),
    /// `None` signs the user out.
    User(Option<User>),
    Config(AppConfig),
}

impl Persist {
    fn write(self, store: &LocalStore, config_path: &Path) -> Result<()> {
        match self {
            Persist::Stations(stations) => store.save_stations(&stations),
            Persist::User(Some(user)) => store.save_user(&user),
            Persist::User(None) => store.clear_user(),
            Persist::Config(cfg) => cfg.save_to(config_path),
        }
    }
}

/// Starts the task that applies writes one at a time, in send order. It exits
/// once every sender is dropped and the queue is drained.
pub fn spawn_writer(store: LocalStore, config_path: PathBuf) -> (mpsc::UnboundedSender<Persist>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Persist>();
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let store = store.clone();
            let path = config_path.clone();
            match tokio::task::spawn_blocking(move || job.write(&store, &path)).await {
                Ok(Err(e)) => warn!(error = ?e, "failed to persist local data"),
                Err(e) => warn!(error = ?e, "store task panicked"),
                Ok(Ok(())) => {}
            }
        }
        debug!("store writer finished");
    });
    (tx, handle)
}
