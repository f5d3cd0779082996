//! Opens the gRPC channel to the agent.

#[cfg(unix)]
use std::sync::Arc;

use hyper_util::rt::TokioIo;
#[cfg(unix)]
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as Target, Uri};
use tower::service_fn;

use super::endpoint::Endpoint;
#[cfg(not(unix))]
use super::endpoint::EndpointError;
use crate::subscription::WatchError;

#[cfg(unix)]
// tonic requires an authority even when the connector ignores it.
const PLACEHOLDER_URI: &str = "http://[::]:50051";

pub(super) async fn connect(endpoint: &Endpoint) -> Result<Channel, WatchError> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let target = match host {
                std::net::IpAddr::V6(ip) => format!("http://[{ip}]:{port}"),
                std::net::IpAddr::V4(ip) => format!("http://{ip}:{port}"),
            };
            Ok(Target::try_from(target)?.connect().await?)
        }
        Endpoint::Unix(path) => {
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(EndpointError::UnsupportedTransport("unix").into())
            }

            #[cfg(unix)]
            {
                let path = Arc::new(path.clone());
                let channel = Target::try_from(PLACEHOLDER_URI)?
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let path = Arc::clone(&path);
                        async move {
                            let stream = UnixStream::connect(path.as_path()).await?;
                            Ok::<_, std::io::Error>(TokioIo::new(stream))
                        }
                    }))
                    .await?;
                Ok(channel)
            }
        }
    }
}
