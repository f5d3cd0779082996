//! Command line entry point.
//!
//! ```text
//! spiffe-db-rotator [--config FILE] [--endpoint URI] <bootstrap|reload|watch>
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use spiffe_db_rotator::postgres::PostgresDriver;
use spiffe_db_rotator::{
    select, BoxError, Config, Error, Materializer, Orchestrator, Pipeline, Role, WorkloadApiClient,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Keeps database mTLS credentials in step with SPIFFE X.509-SVID rotation.
#[derive(Debug, Parser)]
#[command(name = "spiffe-db-rotator", version)]
struct Cli {
    /// TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long, short, env = "SPIFFE_DB_ROTATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Workload API endpoint, overriding the configuration file.
    #[arg(long, env = "SPIFFE_ENDPOINT_SOCKET")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the server identity files once and exit.
    Bootstrap,
    /// Server sidecar: rewrite the files and reload TLS on every rotation.
    Reload,
    /// Client: keep a database connection on the newest identity.
    Watch,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.workload_api.endpoint = endpoint;
        config.validate()?;
    }

    let client = WorkloadApiClient::connect(config.endpoint()?).await?;

    match cli.command {
        Command::Bootstrap => bootstrap(&config, &client).await,
        Command::Reload => serve(&config, &client, config.server_role()).await,
        Command::Watch => serve(&config, &client, Role::Client).await,
    }
}

async fn bootstrap(config: &Config, client: &WorkloadApiClient) -> Result<(), BoxError> {
    let update = client.fetch_identity_update().await?;
    let identity = Arc::clone(select(update.identities(), &config.materialize.hint)?);
    let trust_domain = identity.spiffe_id().trust_domain();
    let bundle = update
        .bundle_for(trust_domain)
        .cloned()
        .ok_or_else(|| Error::NoBundle(trust_domain.to_string()))?;

    let materializer = Materializer::new(config.materialize.files.clone());
    let written = Arc::clone(&identity);
    tokio::task::spawn_blocking(move || materializer.persist(&written, &bundle)).await??;

    info!(
        spiffe_id = %identity.spiffe_id(),
        dir = %config.materialize.files.dir.display(),
        "server identity written"
    );
    Ok(())
}

async fn serve(config: &Config, client: &WorkloadApiClient, role: Role) -> Result<(), BoxError> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    cancel.cancel();
                }
                Err(e) => warn!("cannot listen for interrupts: {e}"),
            }
        }
    });

    let pipeline = Pipeline::builder(
        PostgresDriver::new(),
        config.target(),
        config.peer_spiffe_id()?,
    )
    .connect_hint(&config.tls.client_hint)
    .registration_prefix(&config.tls.registration_prefix)
    .alpn_protocols(config.tls.alpn_protocols.iter().map(String::as_bytes))
    .retry(config.retry)
    .role(role)
    .build();

    let mut updates = client.stream_identity_updates().await?;
    let orchestrator = match Orchestrator::start(pipeline, &mut updates, &cancel).await {
        Ok(orchestrator) => orchestrator,
        Err(Error::Cancelled) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    info!(
        generation = orchestrator.store().generation(),
        target = %config.target(),
        "database handle ready"
    );

    orchestrator.run(updates, cancel).await?;
    Ok(())
}
