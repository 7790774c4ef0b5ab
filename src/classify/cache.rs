//! Persistent classification cache.
//!
//! Keyed by input fingerprint (which already folds in the classifier version).
//! Readers get an `Arc` snapshot; writers copy-on-write and swap.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::ExtractedTask;
use crate::error::DigestError;
use crate::types::TriageBucket;
use crate::util::atomic_write_str;

const CACHE_FORMAT_VERSION: u32 = 2;

/// A cached model answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Verdict {
    Mail { bucket: TriageBucket },
    Calendar { actionable: bool },
    /// Tasks the model pulled out of one mail; may be empty.
    Tasks { tasks: Vec<ExtractedTask> },
}

impl Verdict {
    pub fn bucket(&self) -> Option<TriageBucket> {
        match self {
            Verdict::Mail { bucket } => Some(*bucket),
            _ => None,
        }
    }

    pub fn actionable(&self) -> Option<bool> {
        match self {
            Verdict::Calendar { actionable } => Some(*actionable),
            _ => None,
        }
    }

    pub fn into_tasks(self) -> Option<Vec<ExtractedTask>> {
        match self {
            Verdict::Tasks { tasks } => Some(tasks),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub verdict: Verdict,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

pub struct ClassificationCache {
    path: Option<PathBuf>,
    entries: RwLock<Arc<HashMap<String, CacheEntry>>>,
}

impl ClassificationCache {
    /// Memory-only cache.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Load from `path`. A missing, corrupt or older-format file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) if file.version == CACHE_FORMAT_VERSION => file.entries,
                Ok(file) => {
                    log::info!(
                        "Discarding classification cache format v{} (current v{})",
                        file.version,
                        CACHE_FORMAT_VERSION
                    );
                    HashMap::new()
                }
                Err(e) => {
                    log::warn!("Ignoring corrupt classification cache: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        log::debug!("Classification cache: {} entries", entries.len());
        Self {
            path: Some(path),
            entries: RwLock::new(Arc::new(entries)),
        }
    }

    /// Unexpired verdict for `key`.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Verdict> {
        let snapshot = Arc::clone(&self.entries.read());
        snapshot
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.verdict.clone())
    }

    pub fn insert(&self, key: String, verdict: Verdict, expires_at: DateTime<Utc>) {
        let mut guard = self.entries.write();
        Arc::make_mut(&mut guard).insert(
            key,
            CacheEntry {
                verdict,
                expires_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries and write the rest to disk.
    pub fn save(&self, now: DateTime<Utc>) -> Result<(), DigestError> {
        let live: HashMap<String, CacheEntry> = {
            let mut guard = self.entries.write();
            let map = Arc::make_mut(&mut guard);
            map.retain(|_, entry| entry.expires_at > now);
            map.clone()
        };

        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries: live,
        };
        atomic_write_str(path, &serde_json::to_string(&file)?)?;
        Ok(())
    }
}
