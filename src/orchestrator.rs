//! The rotation control loop.
//!
//! Every identity update runs through the same stages:
//!
//! ```text
//! Idle -> Selecting -> Materializing -> Building -> Connecting -> Swapping -> Reloading -> Idle
//! ```
//!
//! `Materializing` and `Reloading` only happen in the [`Role::Server`] role.
//! A failure in any stage before `Swapping` abandons the rotation: the previous
//! handle stays installed, and the failed generation's TLS registration is
//! removed. A failed reload does not undo the swap; the new handle stays active
//! and the engine keeps serving its previous TLS files until the next rotation.
//!
//! Updates are processed one at a time in arrival order. [`Pipeline::prepare`] is
//! public for callers that want to prepare rotations concurrently; the
//! [`HandleStore`] still installs them in generation order.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt as _;
use rustls::ClientConfig;
use spiffe::SpiffeId;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionFactory, ConnectionTarget, DatabaseHandle, Driver};
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityUpdate, TrustBundle};
use crate::materialize::{CredentialPaths, Materializer};
use crate::prelude::{debug, error, info, warn};
use crate::registry::TlsRegistry;
use crate::retry::RetryConfig;
use crate::selector::select;
use crate::store::HandleStore;
use crate::subscription::IdentitySubscription;
use crate::tls::ClientConfigBuilder;

/// Deployment role of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Role {
    /// Keep a client connection fresh.
    Client,
    /// Sidecar of the database server: write the server identity to disk and
    /// tell the engine to reload it after every rotation.
    Server {
        /// Hint of the identity the database engine serves.
        materialize_hint: String,
        /// Where the engine reads its TLS files.
        paths: CredentialPaths,
        /// Statement making the engine reload its TLS files.
        reload_statement: String,
    },
}

/// Stage of the rotation currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RotationStage {
    /// Waiting for the next update.
    #[default]
    Idle,
    /// Picking identities by hint.
    Selecting,
    /// Writing the server credential files.
    Materializing,
    /// Building the TLS client config.
    Building,
    /// Opening the new handle.
    Connecting,
    /// Installing the new handle.
    Swapping,
    /// Running the reload statement.
    Reloading,
}

impl fmt::Display for RotationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Selecting => "selecting",
            Self::Materializing => "materializing",
            Self::Building => "building",
            Self::Connecting => "connecting",
            Self::Swapping => "swapping",
            Self::Reloading => "reloading",
        })
    }
}

/// Observable progress of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationStatus {
    /// Stage currently running.
    pub stage: RotationStage,
    /// Generation of the installed handle, 0 before the first install.
    pub installed_generation: u64,
    /// Rotations that installed a handle.
    pub applied: u64,
    /// Rotations abandoned before the swap.
    pub failed: u64,
    /// Reload statements that failed after a swap.
    pub reload_failures: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

/// A rotation that failed before installing a handle.
#[derive(Debug, thiserror::Error)]
#[error("rotation {generation} failed while {stage}: {source}")]
pub struct RotationError {
    /// Generation of the abandoned rotation.
    pub generation: u64,
    /// Stage that failed.
    pub stage: RotationStage,
    /// The failure.
    #[source]
    pub source: Error,
}

/// Result of the reload step.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReloadOutcome {
    /// Client role: nothing to reload.
    NotRequired,
    /// The engine accepted the reload statement.
    Reloaded,
    /// The reload statement failed; the new handle stays installed.
    Failed(String),
}

/// A rotation that installed a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    /// Generation now installed.
    pub generation: u64,
    /// Generation it replaced, `None` for the first install.
    pub replaced: Option<u64>,
    /// What happened to the reload statement.
    pub reload: ReloadOutcome,
}

/// A handle opened for one generation, ready to be installed.
#[derive(Debug)]
pub struct PreparedRotation<H> {
    generation: u64,
    registration: String,
    identity: Arc<Identity>,
    handle: H,
}

impl<H> PreparedRotation<H> {
    /// Generation of this rotation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// TLS registration the handle was opened with.
    pub fn registration(&self) -> &str {
        &self.registration
    }

    /// Identity presented by the handle.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// The opened handle.
    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// The per-update stages, from selection to an opened handle.
#[derive(Debug)]
pub struct Pipeline<D> {
    factory: ConnectionFactory<D>,
    target: ConnectionTarget,
    expected_peer: SpiffeId,
    connect_hint: String,
    role: Role,
    alpn_protocols: Vec<Vec<u8>>,
    retry: RetryConfig,
    status: watch::Sender<RotationStatus>,
}

/// Builder for [`Pipeline`].
#[derive(Debug)]
pub struct PipelineBuilder<D> {
    driver: D,
    target: ConnectionTarget,
    expected_peer: SpiffeId,
    registry: Option<Arc<TlsRegistry>>,
    registration_prefix: Option<String>,
    connect_hint: String,
    role: Role,
    alpn_protocols: Vec<Vec<u8>>,
    retry: RetryConfig,
}

impl<D: Driver> PipelineBuilder<D> {
    /// Registry for TLS configs. Defaults to [`TlsRegistry::global`].
    #[must_use]
    pub fn registry(mut self, registry: Arc<TlsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Prefix of registration names, which continue with the factory id and the
    /// generation. Defaults to `spire-ssl`.
    #[must_use]
    pub fn registration_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.registration_prefix = Some(prefix.into());
        self
    }

    /// Hint of the identity presented to the database. Empty (the default)
    /// selects the issuer's default identity.
    #[must_use]
    pub fn connect_hint(mut self, hint: impl Into<String>) -> Self {
        self.connect_hint = hint.into();
        self
    }

    /// Deployment role. Defaults to [`Role::Client`].
    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// ALPN protocols offered to the database.
    #[must_use]
    pub fn alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Retry policy for connecting and reloading.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the pipeline.
    pub fn build(self) -> Pipeline<D> {
        let registry = self.registry.unwrap_or_else(TlsRegistry::global);
        let mut factory = ConnectionFactory::new(self.driver, registry);
        if let Some(prefix) = self.registration_prefix {
            factory = factory.with_prefix(prefix);
        }

        Pipeline {
            factory,
            target: self.target,
            expected_peer: self.expected_peer,
            connect_hint: self.connect_hint,
            role: self.role,
            alpn_protocols: self.alpn_protocols,
            retry: self.retry.normalized(),
            status: watch::Sender::new(RotationStatus::default()),
        }
    }
}

struct Selected {
    connect: Arc<Identity>,
    peer_bundle: Arc<TrustBundle>,
    server: Option<(Arc<Identity>, Arc<TrustBundle>)>,
}

impl<D: Driver> Pipeline<D> {
    /// Starts a builder connecting `driver` to `target`, accepting only
    /// `expected_peer` as the server identity.
    pub fn builder(
        driver: D,
        target: ConnectionTarget,
        expected_peer: SpiffeId,
    ) -> PipelineBuilder<D> {
        PipelineBuilder {
            driver,
            target,
            expected_peer,
            registry: None,
            registration_prefix: None,
            connect_hint: String::new(),
            role: Role::Client,
            alpn_protocols: Vec::new(),
            retry: RetryConfig::default(),
        }
    }

    /// Subscribes to status changes.
    pub fn status(&self) -> watch::Receiver<RotationStatus> {
        self.status.subscribe()
    }

    /// The connection factory.
    pub fn factory(&self) -> &ConnectionFactory<D> {
        &self.factory
    }

    /// The deployment role.
    pub fn role(&self) -> &Role {
        &self.role
    }

    fn enter(&self, stage: RotationStage) {
        self.status.send_modify(|s| s.stage = stage);
    }

    fn record_failure(&self, err: &RotationError) {
        self.status.send_modify(|s| {
            s.stage = RotationStage::Idle;
            s.failed += 1;
            s.last_error = Some(err.to_string());
        });
    }

    /// Runs select, materialize, build and connect for `update`.
    ///
    /// # Errors
    ///
    /// Returns a [`RotationError`] naming the failed stage. Nothing is
    /// installed, and the generation's TLS registration is removed.
    pub async fn prepare(
        &self,
        update: &IdentityUpdate,
        generation: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<PreparedRotation<D::Handle>, RotationError> {
        let fail = |stage, source| RotationError {
            generation,
            stage,
            source,
        };

        self.enter(RotationStage::Selecting);
        let selected = self
            .select(update)
            .map_err(|e| fail(RotationStage::Selecting, e))?;

        if let (Some((identity, bundle)), Role::Server { paths, .. }) = (&selected.server, &self.role) {
            self.enter(RotationStage::Materializing);
            materialize(paths, identity, bundle)
                .await
                .map_err(|e| fail(RotationStage::Materializing, e))?;
        }

        self.enter(RotationStage::Building);
        let tls = self
            .build_tls(&selected)
            .map_err(|e| fail(RotationStage::Building, e))?;

        self.enter(RotationStage::Connecting);
        let registration = self.factory.registration_name(generation);
        let handle = self
            .connect(tls, &registration, cancel)
            .await
            .map_err(|e| {
                self.factory.deregister(generation);
                fail(RotationStage::Connecting, e)
            })?;

        Ok(PreparedRotation {
            generation,
            registration,
            identity: selected.connect,
            handle,
        })
    }

    fn select(&self, update: &IdentityUpdate) -> Result<Selected> {
        let connect = Arc::clone(select(update.identities(), &self.connect_hint)?);

        let peer_td = self.expected_peer.trust_domain();
        let peer_bundle = update
            .bundle_for(peer_td)
            .cloned()
            .ok_or_else(|| Error::NoBundle(peer_td.to_string()))?;

        let server = match &self.role {
            Role::Client => None,
            Role::Server {
                materialize_hint, ..
            } => {
                let identity = Arc::clone(select(update.identities(), materialize_hint)?);
                let td = identity.spiffe_id().trust_domain();
                let bundle = update
                    .bundle_for(td)
                    .cloned()
                    .ok_or_else(|| Error::NoBundle(td.to_string()))?;
                Some((identity, bundle))
            }
        };

        Ok(Selected {
            connect,
            peer_bundle,
            server,
        })
    }

    fn build_tls(&self, selected: &Selected) -> Result<Arc<ClientConfig>> {
        Ok(ClientConfigBuilder::new(
            Arc::clone(&selected.connect),
            Arc::clone(&selected.peer_bundle),
            self.expected_peer.clone(),
        )
        .with_alpn_protocols(self.alpn_protocols.iter().cloned())
        .build()?)
    }

    async fn connect(
        &self,
        tls: Arc<ClientConfig>,
        registration: &str,
        cancel: &CancellationToken,
    ) -> Result<D::Handle> {
        let factory = &self.factory;
        let target = &self.target;

        self.retry
            .run("connect", cancel, move || {
                factory.open(Arc::clone(&tls), target, registration)
            })
            .await
            .map_err(|e| e.unwrap_or(Error::Cancelled))
    }
}

async fn materialize(
    paths: &CredentialPaths,
    identity: &Arc<Identity>,
    bundle: &Arc<TrustBundle>,
) -> Result<()> {
    let materializer = Materializer::new(paths.clone());
    let identity = Arc::clone(identity);
    let bundle = Arc::clone(bundle);

    tokio::task::spawn_blocking(move || materializer.persist(&identity, &bundle))
        .await
        .map_err(|e| Error::Io {
            path: paths.dir.clone(),
            source: std::io::Error::other(e),
        })?
}

/// Drives the pipeline for every update and owns the handle store.
#[derive(Debug)]
pub struct Orchestrator<D: Driver> {
    pipeline: Pipeline<D>,
    store: Arc<HandleStore<D::Handle>>,
    next_generation: u64,
}

impl<D: Driver> Orchestrator<D> {
    /// Consumes updates until one rotation succeeds and returns an orchestrator
    /// with that handle installed.
    ///
    /// Failed rotations are logged and the next update is awaited.
    ///
    /// # Errors
    ///
    /// - [`Error::WatchTransport`] if the subscription fails,
    /// - [`Error::SubscriptionClosed`] if it ends,
    /// - [`Error::Cancelled`] if `cancel` fires first.
    pub async fn start<S>(
        pipeline: Pipeline<D>,
        updates: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        S: IdentitySubscription,
    {
        let mut generation = 0;

        loop {
            let update = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = updates.next() => match next {
                    Some(Ok(update)) => update,
                    Some(Err(e)) if e.is_canceled() => return Err(Error::Cancelled),
                    Some(Err(e)) => {
                        error!("identity subscription failed before first rotation: {e}");
                        return Err(Error::WatchTransport(e));
                    }
                    None => return Err(Error::SubscriptionClosed),
                },
            };

            log_update(&update);
            generation += 1;

            match pipeline.prepare(&update, generation, cancel).await {
                Ok(prepared) => {
                    let store = Arc::new(HandleStore::new(generation, prepared.into_handle()));
                    let orchestrator = Self {
                        pipeline,
                        store,
                        next_generation: generation + 1,
                    };
                    let outcome = orchestrator.finish(generation, None, cancel).await;
                    info!("initial rotation {generation} applied ({:?})", outcome.reload);
                    return Ok(orchestrator);
                }
                Err(e) => {
                    warn!("{e}; waiting for the next update");
                    pipeline.record_failure(&e);
                    if matches!(e.source, Error::Cancelled) {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    /// The store holding the active handle.
    pub fn store(&self) -> Arc<HandleStore<D::Handle>> {
        Arc::clone(&self.store)
    }

    /// Subscribes to status changes.
    pub fn status(&self) -> watch::Receiver<RotationStatus> {
        self.pipeline.status()
    }

    /// The pipeline this orchestrator drives.
    pub fn pipeline(&self) -> &Pipeline<D> {
        &self.pipeline
    }

    /// Processes updates until the subscription ends or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatchTransport`] if the subscription fails. Rotation
    /// failures are logged and do not end the loop.
    pub async fn run<S>(mut self, mut updates: S, cancel: CancellationToken) -> Result<()>
    where
        S: IdentitySubscription,
    {
        loop {
            let update = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("rotation loop cancelled");
                    return Ok(());
                }
                next = updates.next() => match next {
                    Some(Ok(update)) => update,
                    Some(Err(e)) if e.is_canceled() => {
                        info!("identity subscription cancelled");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        error!("identity subscription failed: {e}");
                        return Err(Error::WatchTransport(e));
                    }
                    None => {
                        info!("identity subscription closed");
                        return Ok(());
                    }
                },
            };

            log_update(&update);
            match self.handle_update(&update, &cancel).await {
                Ok(outcome) => debug!("rotation outcome: {outcome:?}"),
                Err(e) => warn!("{e}; keeping generation {}", self.store.generation()),
            }
        }
    }

    /// Runs one rotation for `update`.
    ///
    /// # Errors
    ///
    /// Returns a [`RotationError`] if the rotation was abandoned; the previous
    /// handle stays installed.
    pub async fn handle_update(
        &mut self,
        update: &IdentityUpdate,
        cancel: &CancellationToken,
    ) -> std::result::Result<RotationOutcome, RotationError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let result = self.rotate(update, generation, cancel).await;
        if let Err(e) = &result {
            self.pipeline.record_failure(e);
        }
        result
    }

    async fn rotate(
        &self,
        update: &IdentityUpdate,
        generation: u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<RotationOutcome, RotationError> {
        let prepared = self.pipeline.prepare(update, generation, cancel).await?;

        self.pipeline.enter(RotationStage::Swapping);
        let replaced = self
            .store
            .install(generation, prepared.into_handle())
            .map_err(|source| {
                self.pipeline.factory.deregister(generation);
                RotationError {
                    generation,
                    stage: RotationStage::Swapping,
                    source,
                }
            })?;

        Ok(self.finish(generation, Some(replaced), cancel).await)
    }

    /// Post-install bookkeeping: prune registrations, reload, publish status.
    async fn finish(
        &self,
        generation: u64,
        replaced: Option<u64>,
        cancel: &CancellationToken,
    ) -> RotationOutcome {
        let pruned = self.pipeline.factory.prune_before(generation);
        if pruned > 0 {
            debug!("pruned {pruned} superseded tls registrations");
        }

        let reload = match &self.pipeline.role {
            Role::Client => ReloadOutcome::NotRequired,
            Role::Server {
                reload_statement, ..
            } => {
                self.pipeline.enter(RotationStage::Reloading);
                self.reload(generation, reload_statement, cancel).await
            }
        };

        let failed_reload = matches!(reload, ReloadOutcome::Failed(_));
        self.pipeline.status.send_modify(|s| {
            s.stage = RotationStage::Idle;
            s.installed_generation = generation;
            s.applied += 1;
            if let ReloadOutcome::Failed(msg) = &reload {
                s.reload_failures += 1;
                s.last_error = Some(msg.clone());
            }
        });

        if !failed_reload {
            info!("rotation {generation} applied");
        }
        RotationOutcome {
            generation,
            replaced,
            reload,
        }
    }

    async fn reload(
        &self,
        generation: u64,
        statement: &str,
        cancel: &CancellationToken,
    ) -> ReloadOutcome {
        let lease = self.store.get();
        if lease.generation() != generation {
            return ReloadOutcome::Failed(format!(
                "generation {generation} was superseded by {} before reload",
                lease.generation()
            ));
        }

        let handle: &D::Handle = &lease;
        let result = self
            .pipeline
            .retry
            .run("reload", cancel, move || handle.execute(statement))
            .await;

        match result {
            Ok(_) => {
                info!("database reloaded TLS material for generation {generation}");
                ReloadOutcome::Reloaded
            }
            Err(e) => {
                let err = e.map_or(Error::Cancelled, Error::ReloadCommand);
                error!(
                    "reload after rotation {generation} failed: {err}; new handle stays active, \
                     server keeps its previous TLS material"
                );
                ReloadOutcome::Failed(err.to_string())
            }
        }
    }
}

fn log_update(update: &IdentityUpdate) {
    if update.identities().is_empty() {
        warn!("received identity update without identities");
    }
    for identity in update.identities() {
        info!(
            "received SVID {} (hint {:?}, expires at {})",
            identity.spiffe_id(),
            identity.hint(),
            identity.not_after()
        );
    }
}
