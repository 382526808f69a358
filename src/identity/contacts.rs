//! Contact records and the default contact book.
//!
//! The resolver only needs a narrow lookup-and-upsert surface ([`ContactStore`]); the
//! default implementation keeps every record in memory and mirrors the table to a JSON
//! file after each change. Writes take an exclusive `fs2` lock on the destination and
//! go through a temp file + rename so a crash never leaves a half-written book.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::packet::{KeyPrefix, NetworkTag, NodeId};

#[derive(Debug, Error)]
pub enum ContactStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("contact book is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("contact book lock poisoned")]
    Poisoned,
}

/// Durable identity of a node we have heard from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub node_id: NodeId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_prefix: Option<KeyPrefix>,
    pub last_seen: DateTime<Utc>,
    pub network: NetworkTag,
}

impl ContactRecord {
    pub fn new(node_id: NodeId, display_name: impl Into<String>, network: NetworkTag) -> Self {
        Self {
            node_id,
            display_name: display_name.into(),
            public_key_prefix: None,
            last_seen: Utc::now(),
            network,
        }
    }

    pub fn with_key_prefix(mut self, prefix: KeyPrefix) -> Self {
        self.public_key_prefix = Some(prefix);
        self
    }
}

/// Lookup-and-upsert interface the core uses. Treated as synchronous and local-latency.
pub trait ContactStore: Send + Sync {
    fn lookup_by_key_prefix(&self, prefix: &KeyPrefix) -> Result<Option<ContactRecord>, ContactStoreError>;

    /// Case-insensitive display-name match. May return several records.
    fn lookup_by_name(&self, name: &str) -> Result<Vec<ContactRecord>, ContactStoreError>;

    /// Node ids are only unique within one network: a provisional companion id can
    /// equal a real primary node number.
    fn lookup_by_node_id(&self, network: NetworkTag, node_id: NodeId) -> Result<Option<ContactRecord>, ContactStoreError>;

    /// Insert or replace the record keyed by `(network, node_id)`.
    fn upsert(&self, record: ContactRecord) -> Result<(), ContactStoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookFile {
    contacts: Vec<ContactRecord>,
    last_updated: Option<DateTime<Utc>>,
}

type ContactKey = (NetworkTag, NodeId);

/// In-memory contact table, optionally persisted to a JSON file.
pub struct ContactBook {
    contacts: Mutex<HashMap<ContactKey, ContactRecord>>,
    path: Option<PathBuf>,
}

impl ContactBook {
    /// A book that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            contacts: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Load the book at `path`, starting empty if the file does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ContactStoreError> {
        let path = path.as_ref().to_path_buf();
        let mut contacts = HashMap::new();
        match fs::read_to_string(&path) {
            Ok(content) => {
                // Guard against leading NULs from an interrupted write on some filesystems
                let cleaned = content.trim_start_matches('\0');
                if !cleaned.trim().is_empty() {
                    let book: BookFile = serde_json::from_str(cleaned)?;
                    for record in book.contacts {
                        contacts.insert((record.network, record.node_id), record);
                    }
                }
                debug!("Loaded {} contacts from {}", contacts.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No contact book at {}; starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            contacts: Mutex::new(contacts),
            path: Some(path),
        })
    }

    pub fn len(&self) -> usize {
        self.contacts.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, snapshot: Vec<ContactRecord>) -> Result<(), ContactStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let book = BookFile {
            contacts: snapshot,
            last_updated: Some(Utc::now()),
        };
        let content = serde_json::to_string_pretty(&book)?;
        write_json_locked(path, &content)?;
        Ok(())
    }
}

impl ContactStore for ContactBook {
    fn lookup_by_key_prefix(&self, prefix: &KeyPrefix) -> Result<Option<ContactRecord>, ContactStoreError> {
        let contacts = self.contacts.lock().map_err(|_| ContactStoreError::Poisoned)?;
        Ok(contacts
            .values()
            .find(|c| c.public_key_prefix.as_ref() == Some(prefix))
            .cloned())
    }

    fn lookup_by_name(&self, name: &str) -> Result<Vec<ContactRecord>, ContactStoreError> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let contacts = self.contacts.lock().map_err(|_| ContactStoreError::Poisoned)?;
        let mut hits: Vec<ContactRecord> = contacts
            .values()
            .filter(|c| c.display_name.trim().to_lowercase() == needle)
            .cloned()
            .collect();
        hits.sort_by_key(|c| c.node_id);
        Ok(hits)
    }

    fn lookup_by_node_id(&self, network: NetworkTag, node_id: NodeId) -> Result<Option<ContactRecord>, ContactStoreError> {
        let contacts = self.contacts.lock().map_err(|_| ContactStoreError::Poisoned)?;
        Ok(contacts.get(&(network, node_id)).cloned())
    }

    fn upsert(&self, record: ContactRecord) -> Result<(), ContactStoreError> {
        let snapshot = {
            let mut contacts = self.contacts.lock().map_err(|_| ContactStoreError::Poisoned)?;
            // A key prefix names one peer; a newer record for it supersedes any other,
            // including a provisional entry created before the real id was known.
            let key = (record.network, record.node_id);
            if let Some(prefix) = record.public_key_prefix {
                contacts.retain(|k, c| *k == key || c.public_key_prefix != Some(prefix));
            }
            contacts.insert(key, record);
            if self.path.is_none() {
                return Ok(());
            }
            contacts.values().cloned().collect::<Vec<_>>()
        };
        if let Err(e) = self.persist(snapshot) {
            warn!("Failed to persist contact book: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

/// Lock the destination, write a sibling temp file, fsync, then rename over it.
fn write_json_locked(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir)?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("contacts.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    let _ = FileExt::unlock(&lock_file);
    Ok(())
}
