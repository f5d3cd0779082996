//! Peer-pinned `rustls` client configurations.
//!
//! A config built here presents one [`Identity`] as the client certificate,
//! trusts one [`TrustBundle`], and completes a handshake only with a server
//! whose SPIFFE ID equals the expected peer exactly. The expected peer is a
//! required argument of [`ClientConfigBuilder::new`].

mod verifier;

use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use spiffe::SpiffeId;

use crate::crypto;
use crate::identity::{Identity, IdentityError, TrustBundle};
use crate::prelude::debug;
use verifier::PinnedServerVerifier;

/// Errors raised while building or using a pinned TLS config.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TlsError {
    /// None of the bundle authorities could be used as a trust anchor.
    #[error("trust bundle for {0} has no usable authorities")]
    NoAuthorities(String),

    /// The bundle does not belong to the expected peer's trust domain.
    #[error("trust bundle is for {bundle} but the expected peer {expected} is not")]
    TrustDomainMismatch {
        /// Trust domain of the bundle.
        bundle: String,
        /// The expected peer.
        expected: SpiffeId,
    },

    /// The identity's certificate or key was rejected by `rustls`.
    #[error("invalid client identity: {0}")]
    ClientAuth(#[source] rustls::Error),

    /// `rustls` rejected the configuration.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// The peer certificate carries no usable SPIFFE ID.
    #[error("peer identity: {0}")]
    PeerIdentity(#[source] IdentityError),

    /// The peer presented a valid certificate for a different SPIFFE ID.
    #[error("peer {actual} is not the expected {expected}")]
    UnexpectedPeer {
        /// The only peer this config accepts.
        expected: SpiffeId,
        /// The peer that was presented.
        actual: SpiffeId,
    },
}

/// Builds a pinned mTLS client config.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use spiffe_db_rotator::{ClientConfigBuilder, Identity, SpiffeId, TrustBundle};
/// # fn example(identity: Arc<Identity>, bundle: Arc<TrustBundle>) -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfigBuilder::new(
///     identity,
///     bundle,
///     SpiffeId::new("spiffe://example.org/mysql/server")?,
/// )
/// .with_alpn_protocols([b"postgresql".to_vec()])
/// .build()?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    identity: Arc<Identity>,
    bundle: Arc<TrustBundle>,
    expected_peer: SpiffeId,
    alpn_protocols: Vec<Vec<u8>>,
}

impl ClientConfigBuilder {
    /// Starts a builder presenting `identity`, trusting `bundle`, and accepting
    /// only `expected_peer`.
    pub fn new(identity: Arc<Identity>, bundle: Arc<TrustBundle>, expected_peer: SpiffeId) -> Self {
        Self {
            identity,
            bundle,
            expected_peer,
            alpn_protocols: Vec::new(),
        }
    }

    /// Sets the ALPN protocols offered in the handshake.
    #[must_use]
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Builds the config.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if the bundle belongs to another trust domain than
    /// the expected peer, has no usable authorities, or `rustls` rejects the
    /// identity.
    pub fn build(self) -> Result<Arc<ClientConfig>, TlsError> {
        let bundle_td = self.bundle.trust_domain();
        if self.expected_peer.trust_domain() != bundle_td {
            return Err(TlsError::TrustDomainMismatch {
                bundle: bundle_td.to_string(),
                expected: self.expected_peer,
            });
        }

        let mut roots = RootCertStore::empty();
        let (added, ignored) =
            roots.add_parsable_certificates(self.bundle.authorities().iter().cloned());
        if added == 0 {
            return Err(TlsError::NoAuthorities(bundle_td.to_string()));
        }
        if ignored > 0 {
            debug!("ignored {ignored} unusable authorities in bundle for {bundle_td}");
        }

        let provider = crypto::provider();
        let verifier = Arc::new(PinnedServerVerifier::new(
            Arc::new(roots),
            self.expected_peer,
            Arc::clone(&provider),
        ));

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(self.identity.cert_chain().to_vec(), self.identity.private_key())
            .map_err(TlsError::ClientAuth)?;
        config.alpn_protocols = self.alpn_protocols;

        Ok(Arc::new(config))
    }
}

/// Shorthand for `ClientConfigBuilder::new(identity, bundle, expected_peer).build()`.
///
/// # Errors
///
/// See [`ClientConfigBuilder::build`].
pub fn mtls_client_config(
    identity: Arc<Identity>,
    bundle: Arc<TrustBundle>,
    expected_peer: SpiffeId,
) -> Result<Arc<ClientConfig>, TlsError> {
    ClientConfigBuilder::new(identity, bundle, expected_peer).build()
}
