use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use metrics::counter;
use tracing::{debug, warn};

use crate::metrics_consts::STORAGE_FALLBACK_COUNTER;
use crate::storage::Storage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Impression,
    Click,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Impression => "impression",
            EventKind::Click => "click",
        }
    }

    /// Suffix of the storage key holding this kind's partition.
    pub fn partition_name(&self) -> &'static str {
        match self {
            EventKind::Impression => "impressions",
            EventKind::Click => "clicks",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted at-most-once ledger of tracked entities.
///
/// Each `(page_location, kind)` pair is its own partition, stored under its own key
/// as a JSON list of entity ids. Partitions never share entries: an impression of
/// `V1` on `landing` says nothing about a click on `V1`, nor about `V1` on `browse`.
///
/// Every mark is also kept in memory for the lifetime of the store. When the
/// storage scope fails, answers come from that memory alone, so dedup still holds
/// for everything this instance has seen.
pub struct DedupStore {
    storage: Arc<dyn Storage>,
    memory: Mutex<HashMap<String, HashSet<String>>>,
}

impl DedupStore {
    const KEY_PREFIX: &'static str = "promo_tracked";

    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn partition_key(page_location: &str, kind: EventKind) -> String {
        format!(
            "{}:{}:{}",
            Self::KEY_PREFIX,
            page_location,
            kind.partition_name()
        )
    }

    pub fn has_tracked(&self, page_location: &str, kind: EventKind, entity_id: &str) -> bool {
        let key = Self::partition_key(page_location, kind);
        let memory = self.memory();

        if memory.get(&key).is_some_and(|ids| ids.contains(entity_id)) {
            return true;
        }

        self.load(&key)
            .is_some_and(|ids| ids.iter().any(|id| id == entity_id))
    }

    /// Idempotent: marking an already tracked id changes nothing.
    pub fn mark_tracked(&self, page_location: &str, kind: EventKind, entity_id: &str) {
        self.claim(page_location, kind, entity_id);
    }

    /// Check and mark in one step. Returns `true` only for the caller that newly
    /// marked `entity_id`; everyone after that gets `false`, including callers on
    /// other stores over the same scope.
    pub fn claim(&self, page_location: &str, kind: EventKind, entity_id: &str) -> bool {
        let key = Self::partition_key(page_location, kind);
        let mut memory = self.memory();
        if memory.get(&key).is_some_and(|ids| ids.contains(entity_id)) {
            return false;
        }

        let mut claimed = false;
        let result = self.storage.update(&key, &mut |current: Option<&str>| {
            let mut ids = decode_partition(&key, current);
            if ids.iter().any(|id| id == entity_id) {
                return None;
            }
            ids.push(entity_id.to_owned());
            claimed = true;
            serde_json::to_string(&ids).ok()
        });

        if let Err(e) = result {
            warn!("failed to persist dedup partition {}: {}", key, e);
            counter!(STORAGE_FALLBACK_COUNTER, "store" => "dedup").increment(1);
            // The scope may still be readable even though it cannot be written.
            claimed = match self.storage.get(&key) {
                Ok(raw) => !decode_partition(&key, raw.as_deref())
                    .iter()
                    .any(|id| id == entity_id),
                Err(_) => true,
            };
        }

        memory
            .entry(key)
            .or_default()
            .insert(entity_id.to_owned());

        claimed
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` when the scope is unreadable.
    fn load(&self, key: &str) -> Option<Vec<String>> {
        match self.storage.get(key) {
            Ok(raw) => Some(decode_partition(key, raw.as_deref())),
            Err(e) => {
                debug!("dedup partition {} unreadable, using memory: {}", key, e);
                counter!(STORAGE_FALLBACK_COUNTER, "store" => "dedup").increment(1);
                None
            }
        }
    }
}

/// An undecodable partition reads as empty and gets overwritten by the next mark.
fn decode_partition(key: &str, raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("discarding undecodable dedup partition {}: {}", key, e);
        Vec::new()
    })
}
