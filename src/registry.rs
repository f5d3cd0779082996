//! Named TLS configurations shared with database drivers.
//!
//! Drivers look up their TLS config by registration name, like a DSN parameter
//! `?tls=spire-ssl-3-7`. Every rotation registers under a fresh
//! generation-suffixed name so a connection being opened with the previous
//! config never sees it replaced mid-dial. Names also carry the owning
//! factory's id, so pipelines sharing [`TlsRegistry::global`] stay apart.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use rustls::ClientConfig;

use crate::error::{Error, Result};

/// Table of `name -> ClientConfig`.
///
/// Injectable; [`TlsRegistry::global`] returns a process-wide instance.
#[derive(Debug, Default)]
pub struct TlsRegistry {
    configs: RwLock<HashMap<String, Arc<ClientConfig>>>,
}

impl TlsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<TlsRegistry> {
        static GLOBAL: OnceLock<Arc<TlsRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TlsRegistry::new())))
    }

    /// Registers `config` under `name`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if `name` is empty.
    pub fn register(&self, name: &str, config: Arc<ClientConfig>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Registry("registration name must not be empty".into()));
        }
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), config);
        Ok(())
    }

    /// Looks up the config registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<ClientConfig>> {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Removes `name`. Returns whether it was present.
    pub fn deregister(&self, name: &str) -> bool {
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Keeps only the names for which `keep` returns true. Returns the number removed.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut configs = self.configs.write().unwrap_or_else(PoisonError::into_inner);
        let before = configs.len();
        configs.retain(|name, _| keep(name));
        before - configs.len()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
