//! Crate error type.

use std::path::PathBuf;

use crate::identity::IdentityError;
use crate::subscription::WatchError;
use crate::tls::TlsError;

/// Boxed error returned by [`Driver`](crate::Driver) and
/// [`DatabaseHandle`](crate::DatabaseHandle) implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `spiffe-db-rotator`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No identity in the update matches the requested hint.
    ///
    /// An empty `hint` means the update carried no identities at all.
    #[error("no credential found for hint {hint:?}")]
    CredentialNotFound {
        /// The hint that was requested.
        hint: String,
    },

    /// More than one identity in the update carries the requested hint.
    #[error("more than one credential carries hint {hint:?}")]
    DuplicateHint {
        /// The ambiguous hint.
        hint: String,
    },

    /// The update has no trust bundle for the given trust domain.
    #[error("no trust bundle for trust domain {0}")]
    NoBundle(String),

    /// Identity material could not be parsed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A credential file could not be written.
    #[error("failed writing {}: {source}", path.display())]
    Io {
        /// The file being written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Building the TLS client configuration failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The TLS registry rejected a registration.
    #[error("tls registry: {0}")]
    Registry(String),

    /// Opening a database handle failed.
    #[error("failed connecting with tls registration {registration}: {source}")]
    Connect {
        /// The registration name the driver was asked to use.
        registration: String,
        /// The driver error.
        #[source]
        source: BoxError,
    },

    /// The administrative reload statement failed on the new handle.
    #[error("reload command failed: {0}")]
    ReloadCommand(#[source] BoxError),

    /// The identity subscription failed at the transport level.
    #[error("identity subscription failed: {0}")]
    WatchTransport(#[from] WatchError),

    /// The identity subscription ended before a handle could be installed.
    #[error("identity subscription closed")]
    SubscriptionClosed,

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A handle for an older or equal generation was offered to the store.
    #[error("generation {generation} is not newer than installed generation {current}")]
    StaleGeneration {
        /// Generation of the rejected handle.
        generation: u64,
        /// Generation currently installed.
        current: u64,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
