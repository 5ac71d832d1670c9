// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A durable, append-only journal of outbound events awaiting acknowledgement.
//!
//! Events are persisted as one file per event (`<event_id>.ev`, payload bytes verbatim)
//! plus a sidecar (`<event_id>.meta`, small JSON record) under a configured directory,
//! alongside a `next_id` counter file that is fsynced on every advance. Recovery after a
//! crash or restart relists the directory and rebuilds the in-memory index from it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{JournalError, JournalErrorKind};

/// A locally produced event awaiting acknowledgement by a peer.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonically assigned id, unique within the process and persisted across restarts.
    pub id: u64,
    /// Unix timestamp (seconds) the event was created at.
    pub created_at: u64,
    /// Name of the link this event must be carried on.
    pub target_link: String,
    /// Application-opaque payload.
    pub payload: Bytes,
}

#[derive(Serialize, Deserialize)]
struct EventMeta {
    created_at: u64,
    target_link: String,
}

const NEXT_ID_FILE: &str = "next_id";
const LOCK_FILE: &str = "lock";

/// Durable, ordered store of unacknowledged outbound events.
///
/// Holds an exclusive lock file (`lock`) under the journal directory for its lifetime,
/// released on drop, so a second [`Journal`] cannot silently race the first over the same
/// files. See [`Journal::try_lock`], used by [`crate::dispatcher::Dispatcher::start`] to
/// reject a second start against a directory that is already held.
pub struct Journal {
    dir: PathBuf,
    next_id: Mutex<u64>,
}

impl Journal {
    /// Atomically create the journal directory's lock file, failing if one is already
    /// present.
    ///
    /// Callers hold this for the lifetime of the [`Journal`] and remove it when done; see
    /// [`Journal::open`] and [`Journal::release_lock`].
    ///
    /// # Errors
    /// Returns `Ok(false)` (not an error) if the lock is already held by a live journal.
    /// Returns `Err` for any other I/O failure creating the directory or lock file.
    pub fn try_lock(dir: &Path) -> Result<bool, JournalError> {
        std::fs::create_dir_all(dir)?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(LOCK_FILE))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock file acquired by [`Journal::try_lock`].
    pub fn release_lock(dir: &Path) {
        let _ = std::fs::remove_file(dir.join(LOCK_FILE));
    }

    /// Open (creating if necessary) the journal directory, recovering any events left over
    /// from a previous run.
    ///
    /// Does not itself acquire the lock file; callers are expected to have already done so
    /// via [`Journal::try_lock`] (see [`crate::dispatcher::Dispatcher::start`]).
    ///
    /// # Errors
    /// Returns [`JournalError`] if the directory cannot be created or read, or if its
    /// contents cannot be parsed as valid events.
    pub async fn open(dir: PathBuf) -> Result<Self, JournalError> {
        let dir_clone = dir.clone();
        let next_id = tokio::task::spawn_blocking(move || recover(&dir_clone))
            .await
            .expect("journal recovery task panicked")?;
        Ok(Self {
            dir,
            next_id: Mutex::new(next_id),
        })
    }

    /// Append a new event for `target_link`, returning its assigned id.
    ///
    /// The event is durable (fsynced) before this returns.
    ///
    /// # Errors
    /// Returns [`JournalError`] if the write fails.
    pub async fn append(&self, target_link: String, payload: Bytes) -> Result<u64, JournalError> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let dir = self.dir.clone();
        let meta = EventMeta {
            created_at,
            target_link,
        };
        tokio::task::spawn_blocking(move || write_event(&dir, id, &payload, &meta))
            .await
            .expect("journal write task panicked")?;
        Ok(id)
    }

    /// Remove an event from the journal. Idempotent: quietly succeeds if `event_id` is
    /// already absent.
    ///
    /// # Errors
    /// Returns [`JournalError`] if the removal fails for a reason other than the files
    /// already being absent.
    pub async fn remove(&self, event_id: u64) -> Result<(), JournalError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || remove_event(&dir, event_id))
            .await
            .expect("journal remove task panicked")
    }

    /// Return every unacknowledged event, oldest (lowest id) first.
    ///
    /// # Errors
    /// Returns [`JournalError`] if the directory cannot be listed.
    pub async fn iter_unacked(&self) -> Result<Vec<Event>, JournalError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || list_events(&dir))
            .await
            .expect("journal list task panicked")
    }

    /// Return the number of unacknowledged events.
    ///
    /// # Errors
    /// Returns [`JournalError`] if the directory cannot be listed.
    pub async fn count_unacked(&self) -> Result<usize, JournalError> {
        Ok(self.iter_unacked().await?.len())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        Journal::release_lock(&self.dir);
    }
}

fn recover(dir: &Path) -> Result<u64, JournalError> {
    std::fs::create_dir_all(dir)?;
    let next_id_path = dir.join(NEXT_ID_FILE);
    let recorded_next_id = match std::fs::read_to_string(&next_id_path) {
        Ok(s) => s.trim().parse::<u64>().map_err(|e| {
            JournalError::new(JournalErrorKind::StorageCorruption(format!(
                "malformed next_id file: {e}"
            )))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    let highest_present = list_events(dir)?.into_iter().map(|e| e.id).max();
    let next_id = recorded_next_id.max(highest_present.map_or(0, |id| id + 1));
    persist_next_id(dir, next_id)?;
    Ok(next_id)
}

fn persist_next_id(dir: &Path, next_id: u64) -> Result<(), JournalError> {
    use std::io::Write;
    let path = dir.join(NEXT_ID_FILE);
    let mut file = std::fs::File::create(&path)?;
    file.write_all(next_id.to_string().as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn write_event(dir: &Path, id: u64, payload: &[u8], meta: &EventMeta) -> Result<(), JournalError> {
    use std::io::Write;

    std::fs::create_dir_all(dir)?;

    let ev_path = dir.join(format!("{id}.ev"));
    let mut ev_file = std::fs::File::create(&ev_path)?;
    ev_file.write_all(payload)?;
    ev_file.sync_all()?;

    let meta_json = serde_json::to_vec(meta).map_err(|e| {
        JournalError::new(JournalErrorKind::StorageCorruption(format!(
            "failed to serialize event metadata: {e}"
        )))
    })?;
    let meta_path = dir.join(format!("{id}.meta"));
    let mut meta_file = std::fs::File::create(&meta_path)?;
    meta_file.write_all(&meta_json)?;
    meta_file.sync_all()?;

    persist_next_id(dir, id + 1)?;
    Ok(())
}

fn remove_event(dir: &Path, id: u64) -> Result<(), JournalError> {
    for suffix in [".ev", ".meta"] {
        let path = dir.join(format!("{id}{suffix}"));
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn list_events(dir: &Path) -> Result<Vec<Event>, JournalError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut by_id: BTreeMap<u64, (Option<Vec<u8>>, Option<EventMeta>)> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(id_str) = file_name.strip_suffix(".ev") {
            let Ok(id) = id_str.parse::<u64>() else {
                continue;
            };
            let payload = std::fs::read(entry.path())?;
            by_id.entry(id).or_default().0 = Some(payload);
        } else if let Some(id_str) = file_name.strip_suffix(".meta") {
            let Ok(id) = id_str.parse::<u64>() else {
                continue;
            };
            let raw = std::fs::read(entry.path())?;
            let meta: EventMeta = serde_json::from_slice(&raw).map_err(|e| {
                JournalError::new(JournalErrorKind::StorageCorruption(format!(
                    "malformed metadata for event {id}: {e}"
                )))
            })?;
            by_id.entry(id).or_default().1 = Some(meta);
        }
    }

    let mut events = Vec::with_capacity(by_id.len());
    for (id, (payload, meta)) in by_id {
        let Some(payload) = payload else { continue };
        let (created_at, target_link) = match meta {
            Some(m) => (m.created_at, m.target_link),
            None => (0, String::new()),
        };
        events.push(Event {
            id,
            created_at,
            target_link,
            payload: Bytes::from(payload),
        });
    }
    events.sort_by_key(|e| e.id);
    Ok(events)
}
