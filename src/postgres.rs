//! PostgreSQL driver on top of `tokio-postgres`.
//!
//! The TLS config is taken from the registry by name and handed to
//! `tokio-postgres-rustls`, so the server certificate is checked by the pinned
//! SPIFFE verifier rather than by host name. `sslmode` is always `require`.

use std::fmt;
use std::time::Duration;

use tokio_postgres::config::SslMode;
use tokio_postgres::Client;
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::connection::{ConnectionTarget, DatabaseHandle, Driver};
use crate::error::BoxError;
use crate::prelude::{debug, warn};
use crate::registry::TlsRegistry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens `tokio-postgres` clients over mutual TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Creates the driver.
    pub fn new() -> Self {
        Self
    }
}

impl Driver for PostgresDriver {
    type Handle = PostgresHandle;

    async fn open(
        &self,
        target: &ConnectionTarget,
        registry: &TlsRegistry,
        tls_name: &str,
    ) -> Result<PostgresHandle, BoxError> {
        let tls = registry
            .get(tls_name)
            .ok_or_else(|| format!("no TLS config registered as {tls_name:?}"))?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .user(&target.user)
            .ssl_mode(SslMode::Require)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(dbname) = &target.dbname {
            config.dbname(dbname);
        }

        let (client, connection) = config
            .connect(MakeRustlsConnect::new((*tls).clone()))
            .await?;

        let name = tls_name.to_owned();
        tokio::spawn(async move {
            match connection.await {
                Ok(()) => debug!("postgres connection {name} closed"),
                Err(e) => warn!("postgres connection {name} failed: {e}"),
            }
        });

        debug!("opened postgres connection to {target} with {tls_name}");
        Ok(PostgresHandle { client })
    }
}

/// A `tokio-postgres` client. The connection closes when it is dropped.
pub struct PostgresHandle {
    client: Client,
}

impl fmt::Debug for PostgresHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresHandle")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl PostgresHandle {
    /// The underlying client, for queries beyond [`DatabaseHandle::execute`].
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl DatabaseHandle for PostgresHandle {
    async fn execute(&self, statement: &str) -> Result<u64, BoxError> {
        Ok(self.client.execute(statement, &[]).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_tls_name_fails_before_dialing() {
        let registry = TlsRegistry::new();
        let target = ConnectionTarget::new("127.0.0.1", 1, "rotator");

        let err = PostgresDriver::new()
            .open(&target, &registry, "spire-ssl-9")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("spire-ssl-9"));
    }
}
