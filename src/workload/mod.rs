//! A minimal SPIFFE Workload API client.
//!
//! Only the X.509-SVID stream is implemented. Each response from the agent is
//! converted into an [`IdentityUpdate`] carrying every SVID the workload holds
//! and every bundle (own trust domain and federated) it was sent.
//!
//! ```no_run
//! # async fn run() -> Result<(), spiffe_db_rotator::WatchError> {
//! use futures::StreamExt as _;
//! use spiffe_db_rotator::WorkloadApiClient;
//!
//! let client = WorkloadApiClient::connect_env().await?;
//! let mut updates = client.stream_identity_updates().await?;
//! while let Some(update) = updates.next().await {
//!     let update = update?;
//!     println!("{} identities", update.identities().len());
//! }
//! # Ok(())
//! # }
//! ```

mod endpoint;
mod proto;
mod transport;

use std::collections::HashMap;
use std::pin::Pin;

use futures::{future, Stream, StreamExt as _};
use spiffe::TrustDomain;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;

pub use endpoint::{Endpoint, EndpointError, DEFAULT_ENDPOINT, ENDPOINT_SOCKET_ENV};

use self::proto::{X509SvidRequest, X509SvidResponse, FETCH_X509_SVID_PATH};
use crate::identity::{Identity, IdentityError, IdentityUpdate, TrustBundle};
use crate::prelude::{debug, warn};
use crate::subscription::WatchError;

/// Security header the agent requires on every call.
const SECURITY_HEADER: &str = "workload.spiffe.io";

/// Stream of identity updates returned by
/// [`WorkloadApiClient::stream_identity_updates`].
pub type IdentityUpdateStream =
    Pin<Box<dyn Stream<Item = Result<IdentityUpdate, WatchError>> + Send + 'static>>;

/// Client for the agent's Workload API socket.
#[derive(Debug, Clone)]
pub struct WorkloadApiClient {
    endpoint: Endpoint,
    channel: Channel,
}

impl WorkloadApiClient {
    /// Connects to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Transport`] if the socket cannot be reached.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, WatchError> {
        let channel = transport::connect(&endpoint).await?;
        debug!("connected to workload api at {endpoint}");
        Ok(Self { endpoint, channel })
    }

    /// Parses `uri` and connects to it.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Endpoint`] for an invalid URI, or a transport error.
    pub async fn connect_to(uri: &str) -> Result<Self, WatchError> {
        Self::connect(Endpoint::parse(uri)?).await
    }

    /// Connects to the endpoint named by `SPIFFE_ENDPOINT_SOCKET`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::MissingEndpointSocket`] if the variable is unset.
    pub async fn connect_env() -> Result<Self, WatchError> {
        let endpoint = Endpoint::from_env().ok_or(WatchError::MissingEndpointSocket)??;
        Self::connect(endpoint).await
    }

    /// The endpoint this client is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Subscribes to X.509-SVID updates.
    ///
    /// The agent pushes the current state immediately and again on every
    /// rotation. A response that does not convert into a valid update is logged
    /// and skipped; the stream continues with the next one. gRPC errors are
    /// yielded as items, with cancellation mapped to [`WatchError::Canceled`].
    ///
    /// # Errors
    ///
    /// Returns [`WatchError`] if the call cannot be started.
    pub async fn stream_identity_updates(&self) -> Result<IdentityUpdateStream, WatchError> {
        let responses = self.fetch_x509_svid().await?;
        let updates = responses.filter_map(|message| {
            future::ready(match message {
                Ok(response) => match identity_update_from_response(response) {
                    Ok(update) => Some(Ok(update)),
                    Err(e) => {
                        warn!("skipping workload api response: {e}");
                        None
                    }
                },
                Err(status) => Some(Err(WatchError::from(status))),
            })
        });
        Ok(Box::pin(updates))
    }

    /// Fetches the current identities once.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::EmptyResponse`] if the stream closes without a
    /// message, or the conversion error of the first response.
    pub async fn fetch_identity_update(&self) -> Result<IdentityUpdate, WatchError> {
        let mut responses = self.fetch_x509_svid().await?;
        let response = responses
            .message()
            .await?
            .ok_or(WatchError::EmptyResponse)?;
        identity_update_from_response(response)
    }

    async fn fetch_x509_svid(&self) -> Result<tonic::Streaming<X509SvidResponse>, WatchError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await?;

        let mut request = tonic::Request::new(X509SvidRequest {});
        request
            .metadata_mut()
            .insert(SECURITY_HEADER, MetadataValue::from_static("true"));

        let response = grpc
            .server_streaming(
                request,
                PathAndQuery::from_static(FETCH_X509_SVID_PATH),
                tonic_prost::ProstCodec::<X509SvidRequest, X509SvidResponse>::default(),
            )
            .await?;
        Ok(response.into_inner())
    }
}

/// Converts one agent response into an update.
///
/// The bundle attached to each SVID is keyed by that SVID's trust domain;
/// federated bundles are keyed by the map key. A trust domain seen twice keeps
/// its first bundle.
fn identity_update_from_response(response: X509SvidResponse) -> Result<IdentityUpdate, WatchError> {
    if response.svids.is_empty() {
        return Err(WatchError::EmptyResponse);
    }

    let mut identities = Vec::with_capacity(response.svids.len());
    let mut bundles: HashMap<TrustDomain, TrustBundle> = HashMap::new();

    for svid in &response.svids {
        let identity = Identity::from_der(&svid.x509_svid, &svid.x509_svid_key, svid.hint.as_str())?;
        let trust_domain = identity.spiffe_id().trust_domain().clone();
        if !bundles.contains_key(&trust_domain) {
            let bundle = TrustBundle::from_der(trust_domain.clone(), &svid.bundle)?;
            bundles.insert(trust_domain, bundle);
        }
        identities.push(identity);
    }

    for (name, der) in &response.federated_bundles {
        let trust_domain = TrustDomain::new(name).map_err(IdentityError::from)?;
        if bundles.contains_key(&trust_domain) {
            continue;
        }
        let bundle = TrustBundle::from_der(trust_domain.clone(), der)?;
        bundles.insert(trust_domain, bundle);
    }

    Ok(IdentityUpdate::new(identities, bundles.into_values().collect()))
}
