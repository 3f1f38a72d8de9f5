use std::sync::Arc;

use metrics::counter;
use tracing::warn;
use uuid::Uuid;

use crate::metrics_consts::STORAGE_FALLBACK_COUNTER;
use crate::storage::Storage;

pub const SESSION_KEY: &str = "promo_session_id";

pub trait SessionProvider: Send + Sync {
    fn get_or_create_session_id(&self) -> String;
}

/// Session identity persisted in a storage scope.
///
/// The first call creates a time-ordered random id and stores it, every later call
/// returns the stored one. Creation goes through [`Storage::update`], so providers
/// on separate handles to one scope agree on a single id. When the scope cannot be
/// written each call hands out a fresh id instead of failing.
pub struct StoredSession {
    storage: Arc<dyn Storage>,
}

impl StoredSession {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl SessionProvider for StoredSession {
    fn get_or_create_session_id(&self) -> String {
        let mut session_id = None;
        let result = self
            .storage
            .update(SESSION_KEY, &mut |current: Option<&str>| match current {
                Some(existing) if !existing.is_empty() => {
                    session_id = Some(existing.to_owned());
                    None
                }
                _ => {
                    let created = new_session_id();
                    session_id = Some(created.clone());
                    Some(created)
                }
            });

        match result {
            Ok(()) => session_id.unwrap_or_else(new_session_id),
            Err(e) => {
                warn!("session storage unavailable, using a transient session: {}", e);
                counter!(STORAGE_FALLBACK_COUNTER, "store" => "session").increment(1);
                match self.storage.get(SESSION_KEY) {
                    Ok(Some(existing)) if !existing.is_empty() => existing,
                    _ => new_session_id(),
                }
            }
        }
    }
}

/// A session that never changes, for hosts that already own a session id.
#[derive(Clone, Debug)]
pub struct FixedSession(pub String);

impl SessionProvider for FixedSession {
    fn get_or_create_session_id(&self) -> String {
        self.0.clone()
    }
}

fn new_session_id() -> String {
    Uuid::now_v7().to_string()
}
