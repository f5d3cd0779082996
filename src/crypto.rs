//! Crypto provider selection for `rustls`.

use std::sync::{Arc, OnceLock};

use rustls::crypto::CryptoProvider;

/// The provider used for every config this crate builds.
///
/// Also installed as the process default on first use, unless the application
/// installed one already.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    Arc::clone(PROVIDER.get_or_init(|| {
        let provider = Arc::new(feature_provider());
        // Ignored when the application installed its own default.
        let _ = CryptoProvider::install_default(feature_provider());
        provider
    }))
}

#[cfg(feature = "ring")]
fn feature_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
fn feature_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}
