//! Registry of active jails and their provisioning sessions.

use std::sync::Arc;

use dashmap::DashMap;
use jailforge_common::{ForgeError, ForgeResult};

use crate::jail::Jail;
use crate::recorder::Recorder;

/// Active jails, keyed by name.
///
/// Created once per process and handed to whoever needs it; nothing here is
/// global.
#[derive(Debug, Default)]
pub struct JailRegistry {
    jails: DashMap<String, Arc<Jail>>,
    sessions: DashMap<String, Recorder>,
}

impl JailRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a jail.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a jail with the same name is registered.
    pub fn insert(&self, jail: Arc<Jail>) -> ForgeResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.jails.entry(jail.name().to_string()) {
            Entry::Occupied(entry) => Err(ForgeError::AlreadyExists {
                target: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                tracing::debug!(jail = %entry.key(), "Registered jail");
                entry.insert(jail);
                Ok(())
            }
        }
    }

    /// Unregister a jail.
    pub fn remove(&self, name: &str) -> Option<Arc<Jail>> {
        let removed = self.jails.remove(name).map(|(_, jail)| jail);
        if removed.is_some() {
            tracing::debug!(jail = %name, "Unregistered jail");
        }
        removed
    }

    /// Look up a jail.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Jail>> {
        self.jails.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a jail is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.jails.contains_key(name)
    }

    /// Registered jail names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jails.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Keep the session of a finished provisioning run.
    pub fn store_session(&self, name: &str, session: Recorder) {
        self.sessions.insert(name.to_string(), session);
    }

    /// Take the session of a provisioning run back.
    pub fn take_session(&self, name: &str) -> Option<Recorder> {
        self.sessions.remove(name).map(|(_, session)| session)
    }
}
