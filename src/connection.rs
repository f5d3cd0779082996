//! Opening database handles under a named TLS registration.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustls::ClientConfig;
use serde::Deserialize;

use crate::error::{BoxError, Error, Result};
use crate::prelude::debug;
use crate::registry::TlsRegistry;

/// Default registration name prefix.
pub const DEFAULT_REGISTRATION_PREFIX: &str = "spire-ssl";

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionTarget {
    /// Database host name or address.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database user.
    pub user: String,
    /// Database name, if the engine needs one.
    #[serde(default)]
    pub dbname: Option<String>,
}

impl ConnectionTarget {
    /// Creates a target without a database name.
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            dbname: None,
        }
    }

    /// Sets the database name.
    #[must_use]
    pub fn with_dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)?;
        if let Some(db) = &self.dbname {
            write!(f, "/{db}")?;
        }
        Ok(())
    }
}

/// A live database handle.
///
/// Dropping the last reference closes it.
pub trait DatabaseHandle: Send + Sync + 'static {
    /// Executes `statement`, returning the number of affected rows.
    fn execute(&self, statement: &str) -> impl Future<Output = std::result::Result<u64, BoxError>> + Send;
}

/// Opens database handles.
///
/// The driver resolves its TLS config from `registry` by `tls_name`.
pub trait Driver: Send + Sync + 'static {
    /// Handle type produced by this driver.
    type Handle: DatabaseHandle;

    /// Opens a new handle to `target`.
    fn open(
        &self,
        target: &ConnectionTarget,
        registry: &TlsRegistry,
        tls_name: &str,
    ) -> impl Future<Output = std::result::Result<Self::Handle, BoxError>> + Send;
}

/// Registers TLS configs and opens handles with them.
///
/// Each factory owns a namespace in the registry, `"{prefix}-{id}"`, where `id`
/// is unique within the process. Factories sharing a registry (typically
/// [`TlsRegistry::global`]) never write, look up or remove each other's
/// registrations, even when their generation counters coincide.
#[derive(Debug)]
pub struct ConnectionFactory<D> {
    driver: D,
    registry: Arc<TlsRegistry>,
    namespace: String,
    id: u64,
}

impl<D: Driver> ConnectionFactory<D> {
    /// Creates a factory registering into `registry` with the default prefix.
    pub fn new(driver: D, registry: Arc<TlsRegistry>) -> Self {
        let id = NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            driver,
            registry,
            namespace: format!("{DEFAULT_REGISTRATION_PREFIX}-{id}"),
            id,
        }
    }

    /// Sets the registration name prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace = format!("{}-{}", prefix.into(), self.id);
        self
    }

    /// The registry configs are published to.
    pub fn registry(&self) -> &Arc<TlsRegistry> {
        &self.registry
    }

    /// Prefix shared by every registration of this factory, `"{prefix}-{id}"`.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The registration name for `generation`, `"{prefix}-{id}-{generation}"`.
    pub fn registration_name(&self, generation: u64) -> String {
        format!("{}-{generation}", self.namespace)
    }

    /// Registers `tls` under `registration_name` and opens a handle to `target`
    /// with it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the name is rejected, or
    /// [`Error::Connect`] if the driver fails. No retry is attempted.
    pub async fn open(
        &self,
        tls: Arc<ClientConfig>,
        target: &ConnectionTarget,
        registration_name: &str,
    ) -> Result<D::Handle> {
        self.registry.register(registration_name, tls)?;
        debug!("opening {target} with tls registration {registration_name}");

        self.driver
            .open(target, &self.registry, registration_name)
            .await
            .map_err(|source| Error::Connect {
                registration: registration_name.to_owned(),
                source,
            })
    }

    /// Removes the registration for `generation`.
    pub fn deregister(&self, generation: u64) -> bool {
        self.registry.deregister(&self.registration_name(generation))
    }

    /// Removes registrations of this factory older than `generation`.
    ///
    /// Returns the number removed.
    pub fn prune_before(&self, generation: u64) -> usize {
        let prefix = format!("{}-", self.namespace);
        self.registry.retain(|name| {
            name.strip_prefix(&prefix)
                .and_then(|g| g.parse::<u64>().ok())
                .map_or(true, |g| g >= generation)
        })
    }
}
