//! The identity update stream consumed by the orchestrator.
//!
//! Any `Stream<Item = Result<IdentityUpdate, WatchError>>` works as a
//! subscription. The stream ends (`None`) when the issuer closes it; an
//! `Err(WatchError::Canceled)` item is treated the same way. Any other error is
//! a transport failure.

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::identity::{IdentityError, IdentityUpdate};
use crate::workload::EndpointError;

/// Failures of the identity subscription.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WatchError {
    /// The subscription was cancelled by shutdown. Not a failure.
    #[error("subscription cancelled")]
    Canceled,

    /// `SPIFFE_ENDPOINT_SOCKET` is not set.
    #[error("missing SPIFFE endpoint socket path (SPIFFE_ENDPOINT_SOCKET)")]
    MissingEndpointSocket,

    /// The endpoint URI is invalid.
    #[error("invalid workload api endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// The issuer has no identity for this workload.
    #[error("no identity issued")]
    NoIdentityIssued,

    /// The issuer denied the request.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The stream closed without delivering an update.
    #[error("empty Workload API response")]
    EmptyResponse,

    /// A pushed identity could not be parsed.
    #[error("invalid identity in update: {0}")]
    InvalidUpdate(#[from] IdentityError),

    /// gRPC status error.
    #[error("workload api status: {0}")]
    Status(#[source] Box<tonic::Status>),

    /// Connection-level failure.
    #[error("workload api transport: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl WatchError {
    /// Whether this error marks a cancellation rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<tonic::Status> for WatchError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        match status.code() {
            Code::Cancelled => Self::Canceled,
            Code::PermissionDenied if status.message().contains("no identity issued") => {
                Self::NoIdentityIssued
            }
            Code::PermissionDenied => Self::PermissionDenied(status.message().to_owned()),
            _ => Self::Status(Box::new(status)),
        }
    }
}

/// Anything the orchestrator can consume.
pub trait IdentitySubscription:
    Stream<Item = Result<IdentityUpdate, WatchError>> + Unpin + Send
{
}

impl<S> IdentitySubscription for S where
    S: Stream<Item = Result<IdentityUpdate, WatchError>> + Unpin + Send
{
}

/// Receiving half of [`channel`].
pub type UpdateStream = ReceiverStream<Result<IdentityUpdate, WatchError>>;

/// Creates an in-memory subscription.
///
/// Useful for embedding the orchestrator behind another identity source, and in
/// tests. Dropping every [`UpdateSender`] ends the stream.
pub fn channel(buffer: usize) -> (UpdateSender, UpdateStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (UpdateSender { tx }, ReceiverStream::new(rx))
}

/// Sending half of [`channel`].
#[derive(Debug, Clone)]
pub struct UpdateSender {
    tx: mpsc::Sender<Result<IdentityUpdate, WatchError>>,
}

impl UpdateSender {
    /// Pushes an update. Returns `false` if the stream was dropped.
    pub async fn send(&self, update: IdentityUpdate) -> bool {
        self.tx.send(Ok(update)).await.is_ok()
    }

    /// Pushes an error. Returns `false` if the stream was dropped.
    pub async fn fail(&self, err: WatchError) -> bool {
        self.tx.send(Err(err)).await.is_ok()
    }
}
