#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # spiffe-db-rotator
//!
//! `spiffe-db-rotator` keeps a database client's mutual-TLS identity fresh while
//! short-lived SPIFFE X.509-SVIDs are rotated by a SPIRE agent, and carries every
//! rotation into a live connection handle without interrupting queries that are
//! already running.
//!
//! Each identity update pushed by the Workload API flows through a fixed pipeline:
//!
//! 1. [`select`] picks the credential for a hint (or the default one),
//! 2. [`Materializer`] writes certificate, key and bundle files for readers
//!    outside the process (server role),
//! 3. [`ClientConfigBuilder`] builds a `rustls` client config pinned to the
//!    exact SPIFFE ID of the database server,
//! 4. [`ConnectionFactory`] registers that config under a generation-scoped
//!    name and opens a new handle through a [`Driver`],
//! 5. [`HandleStore`] installs the new handle atomically; older leases keep
//!    working until they are dropped,
//! 6. in the server role, a reload statement tells the database engine to
//!    re-read its TLS files.
//!
//! The [`Orchestrator`] drives the pipeline. Any failure leaves the previously
//! installed handle in place.
//!
//! ## Feature flags
//!
//! - `ring` (default): use the `ring` crypto provider for `rustls`.
//! - `aws-lc-rs`: use the `aws-lc-rs` crypto provider instead.
//! - `logging` (default): emit log records through the `log` crate.
//! - `tracing`: emit events through `tracing` (preferred when both are enabled).
//! - `postgres`: PostgreSQL [`Driver`] based on `tokio-postgres`.
//! - `cli`: the `spiffe-db-rotator` binary.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "postgres")]
//! # async fn example() -> Result<(), spiffe_db_rotator::BoxError> {
//! use spiffe_db_rotator::postgres::PostgresDriver;
//! use spiffe_db_rotator::{
//!     ConnectionTarget, DatabaseHandle, Orchestrator, Pipeline, Role, SpiffeId, WorkloadApiClient,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let client = WorkloadApiClient::connect_env().await?;
//! let mut updates = client.stream_identity_updates().await?;
//!
//! let pipeline = Pipeline::builder(
//!     PostgresDriver::new(),
//!     ConnectionTarget::new("db.internal", 5432, "app"),
//!     SpiffeId::new("spiffe://example.org/db/server")?,
//! )
//! .role(Role::Client)
//! .build();
//!
//! let cancel = CancellationToken::new();
//! let orchestrator = Orchestrator::start(pipeline, &mut updates, &cancel).await?;
//! let store = orchestrator.store();
//! tokio::spawn(orchestrator.run(updates, cancel.clone()));
//!
//! let db = store.get();
//! db.execute("SELECT 1").await?;
//! # Ok(())
//! # }
//! ```

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

mod observability;
mod prelude;

pub mod config;
pub mod connection;
mod crypto;
pub mod error;
pub mod identity;
pub mod materialize;
pub mod orchestrator;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod registry;
mod retry;
pub mod selector;
pub mod store;
pub mod subscription;
pub mod tls;
pub mod workload;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use connection::{ConnectionFactory, ConnectionTarget, DatabaseHandle, Driver};
pub use error::{BoxError, Error, Result};
pub use identity::{Identity, IdentityError, IdentityUpdate, TrustBundle};
pub use materialize::{CredentialPaths, Materializer};
pub use orchestrator::{
    Orchestrator, Pipeline, PipelineBuilder, PreparedRotation, ReloadOutcome, Role, RotationError,
    RotationOutcome, RotationStage, RotationStatus,
};
pub use registry::TlsRegistry;
pub use retry::RetryConfig;
pub use selector::select;
pub use spiffe::{SpiffeId, TrustDomain};
pub use store::{HandleStore, Lease};
pub use subscription::WatchError;
pub use tls::{mtls_client_config, ClientConfigBuilder, TlsError};
pub use workload::{Endpoint, EndpointError, IdentityUpdateStream, WorkloadApiClient};
