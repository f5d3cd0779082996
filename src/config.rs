//! File configuration for the rotator.
//!
//! Every section and key is optional; an empty file describes the stock
//! PostgreSQL deployment (SPIRE agent socket under `/run/spire`, credentials
//! under `/spire/certs`, hints `postgres-server` and `postgres-client`, port
//! 5432, reload via `SELECT pg_reload_conf()`).
//!
//! ```toml
//! [workload_api]
//! endpoint = "unix:///run/spire/sockets/agent.sock"
//!
//! [database]
//! host = "db.internal"
//! port = 5432
//! user = "rotator"
//! peer_spiffe_id = "spiffe://example.org/db/server"
//!
//! [tls]
//! client_hint = "db-client"
//!
//! [materialize]
//! hint = "db-server"
//!
//! [materialize.files]
//! dir = "/var/lib/postgresql/tls"
//!
//! [retry]
//! max_attempts = 5
//! min_backoff = 250
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use spiffe::SpiffeId;

use crate::connection::{ConnectionTarget, DEFAULT_REGISTRATION_PREFIX};
use crate::error::{Error, Result};
use crate::materialize::CredentialPaths;
use crate::orchestrator::Role;
use crate::retry::RetryConfig;
use crate::workload::{Endpoint, DEFAULT_ENDPOINT};

/// Largest configuration file accepted by [`Config::load`].
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Statement asking PostgreSQL to re-read its configuration and TLS files.
pub const DEFAULT_RELOAD_STATEMENT: &str = "SELECT pg_reload_conf()";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where the SPIRE agent listens.
    pub workload_api: WorkloadApiConfig,
    /// Database to connect to.
    pub database: DatabaseConfig,
    /// Client identity selection and TLS registration.
    pub tls: TlsConfig,
    /// Server identity files (server role).
    pub materialize: MaterializeConfig,
    /// Reload command (server role).
    pub reload: ReloadConfig,
    /// Retry policy for connect and reload.
    pub retry: RetryConfig,
}

/// `[workload_api]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadApiConfig {
    /// Agent socket URI.
    pub endpoint: String,
}

impl Default for WorkloadApiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
        }
    }
}

/// `[database]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// User the rotator logs in as.
    pub user: String,
    /// Database name.
    pub dbname: Option<String>,
    /// The only SPIFFE ID the server may present.
    pub peer_spiffe_id: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: "spire-tls-reloader".into(),
            dbname: None,
            peer_spiffe_id: "spiffe://example.org/postgres/server".into(),
        }
    }
}

/// `[tls]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    /// Hint of the identity used to authenticate to the database.
    pub client_hint: String,
    /// Prefix of the generation-scoped registration names.
    pub registration_prefix: String,
    /// ALPN protocols offered in the handshake.
    pub alpn_protocols: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            client_hint: "postgres-client".into(),
            registration_prefix: DEFAULT_REGISTRATION_PREFIX.into(),
            alpn_protocols: Vec::new(),
        }
    }
}

/// `[materialize]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaterializeConfig {
    /// Hint of the identity the database server presents.
    pub hint: String,
    /// Target files.
    pub files: CredentialPaths,
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self {
            hint: "postgres-server".into(),
            files: CredentialPaths::default(),
        }
    }
}

/// `[reload]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReloadConfig {
    /// Statement run on the new handle after each server-role rotation.
    pub statement: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            statement: DEFAULT_RELOAD_STATEMENT.to_owned(),
        }
    }
}

impl Config {
    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, and [`Error::Config`]
    /// if it is too large, malformed, or fails [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let io_err = |source| Error::Io {
            path: path.to_path_buf(),
            source,
        };

        let size = fs::metadata(path).map_err(io_err)?.len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(Error::Config(format!(
                "{} exceeds {MAX_CONFIG_FILE_SIZE} bytes",
                path.display()
            )));
        }
        let content = fs::read_to_string(path).map_err(io_err)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text is malformed or invalid.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that deserialization cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        self.peer_spiffe_id()?;

        let required = [
            ("database.host", self.database.host.as_str()),
            ("database.user", self.database.user.as_str()),
            ("tls.registration_prefix", self.tls.registration_prefix.as_str()),
            ("reload.statement", self.reload.statement.as_str()),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{key} must not be empty")));
            }
        }

        if self.database.port == 0 {
            return Err(Error::Config("database.port must not be 0".into()));
        }
        if self.materialize.files.key_mode & !0o777 != 0 {
            return Err(Error::Config(format!(
                "materialize.files.key_mode {:o} has bits outside 0o777",
                self.materialize.files.key_mode
            )));
        }
        if self.materialize.hint.is_empty() {
            return Err(Error::Config(
                "materialize.hint must name the server identity".into(),
            ));
        }
        Ok(())
    }

    /// The parsed agent endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `workload_api.endpoint` is invalid.
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.workload_api.endpoint)
            .map_err(|e| Error::Config(format!("workload_api.endpoint: {e}")))
    }

    /// The pinned server identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `database.peer_spiffe_id` is invalid.
    pub fn peer_spiffe_id(&self) -> Result<SpiffeId> {
        SpiffeId::new(&self.database.peer_spiffe_id)
            .map_err(|e| Error::Config(format!("database.peer_spiffe_id: {e}")))
    }

    /// Connection target of the `[database]` section.
    pub fn target(&self) -> ConnectionTarget {
        let target = ConnectionTarget::new(
            &self.database.host,
            self.database.port,
            &self.database.user,
        );
        match &self.database.dbname {
            Some(db) => target.with_dbname(db),
            None => target,
        }
    }

    /// The server role built from `[materialize]` and `[reload]`.
    pub fn server_role(&self) -> Role {
        Role::Server {
            materialize_hint: self.materialize.hint.clone(),
            paths: self.materialize.files.clone(),
            reload_statement: self.reload.statement.clone(),
        }
    }
}
