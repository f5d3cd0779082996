//! Identities, trust bundles and update snapshots.
//!
//! An [`IdentityUpdate`] is one push from the identity issuer: every X.509-SVID
//! issued to the workload (in issuer order, the first being the default) plus
//! the trust bundles it should use, keyed by trust domain.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spiffe::{SpiffeId, SpiffeIdError, TrustDomain};
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::oid::Oid;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::oid_registry;
use zeroize::Zeroizing;

const SPIFFE_SCHEME_PREFIX: &str = "spiffe://";
const MAX_CERT_CHAIN_LENGTH: usize = 16;
const MAX_URI_SAN_ENTRIES: usize = 32;

/// Errors raised while parsing identity material.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum IdentityError {
    /// The certificate chain is empty.
    #[error("certificate chain is empty")]
    EmptyChain,

    /// The chain has more certificates than allowed.
    #[error("certificate chain exceeds {max} certificates")]
    ChainTooLong {
        /// Maximum accepted length.
        max: usize,
    },

    /// A certificate is not valid DER X.509.
    #[error("failed parsing certificate: {0}")]
    CertParse(String),

    /// The private key is empty.
    #[error("private key is empty")]
    EmptyKey,

    /// The leaf has no `spiffe://` URI SAN.
    #[error("leaf certificate has no SPIFFE ID")]
    MissingSpiffeId,

    /// The leaf has more than one `spiffe://` URI SAN.
    #[error("leaf certificate has more than one SPIFFE ID")]
    MultipleSpiffeIds,

    /// The URI SAN is not a valid SPIFFE ID.
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(#[from] SpiffeIdError),

    /// The leaf certificate is marked as a CA.
    #[error("leaf certificate must not be a CA")]
    LeafIsCa,

    /// The leaf certificate cannot be used for digital signatures.
    #[error("leaf certificate is missing the digitalSignature key usage")]
    LeafMissingDigitalSignature,

    /// The bundle contains no authorities.
    #[error("trust bundle for {0} has no authorities")]
    EmptyBundle(String),
}

/// An X.509-SVID issued to this workload.
///
/// Immutable once parsed; shared as `Arc<Identity>` between pipeline stages.
pub struct Identity {
    spiffe_id: SpiffeId,
    hint: String,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Zeroizing<Vec<u8>>,
    not_after: i64,
}

impl Identity {
    /// Parses an identity from a concatenated DER certificate chain (leaf first)
    /// and a PKCS#8 DER private key.
    ///
    /// `hint` is the issuer-assigned label; pass `""` for none.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the chain is empty or unparseable, the key is
    /// empty, or the leaf is not a valid X.509-SVID leaf.
    pub fn from_der(
        cert_chain_der: &[u8],
        private_key_der: &[u8],
        hint: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let cert_chain = split_der_certificates(cert_chain_der, Some(MAX_CERT_CHAIN_LENGTH))?;
        let leaf = cert_chain.first().ok_or(IdentityError::EmptyChain)?;

        if private_key_der.is_empty() {
            return Err(IdentityError::EmptyKey);
        }

        let parsed = parse_certificate(leaf.as_ref())?;
        validate_leaf(&parsed)?;
        let spiffe_id = spiffe_id_from_certificate(&parsed)?;
        let not_after = parsed.validity().not_after.timestamp();

        Ok(Self {
            spiffe_id,
            hint: hint.into(),
            cert_chain,
            private_key: Zeroizing::new(private_key_der.to_vec()),
            not_after,
        })
    }

    /// The SPIFFE ID carried by the leaf certificate.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The issuer-assigned hint, empty when none was set.
    pub fn hint(&self) -> &str {
        &self.hint
    }

    /// The certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // `from_der` rejects empty chains.
        &self.cert_chain[0]
    }

    /// The PKCS#8 DER private key.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }

    /// A fresh owned `rustls` private key.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key.to_vec()))
    }

    /// Leaf expiry as seconds since the Unix epoch.
    pub fn not_after(&self) -> i64 {
        self.not_after
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("spiffe_id", &self.spiffe_id)
            .field("hint", &self.hint)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Root authorities of one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    trust_domain: TrustDomain,
    authorities: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Parses concatenated DER authorities for `trust_domain`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the bytes are not a sequence of certificates
    /// or contain none.
    pub fn from_der(trust_domain: TrustDomain, authorities_der: &[u8]) -> Result<Self, IdentityError> {
        if authorities_der.is_empty() {
            return Err(IdentityError::EmptyBundle(trust_domain.to_string()));
        }
        let authorities = split_der_certificates(authorities_der, None)?;
        Self::new(trust_domain, authorities)
    }

    /// Creates a bundle from already split authorities.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::EmptyBundle`] if `authorities` is empty.
    pub fn new(
        trust_domain: TrustDomain,
        authorities: Vec<CertificateDer<'static>>,
    ) -> Result<Self, IdentityError> {
        if authorities.is_empty() {
            return Err(IdentityError::EmptyBundle(trust_domain.to_string()));
        }
        Ok(Self {
            trust_domain,
            authorities,
        })
    }

    /// The trust domain these authorities belong to.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The root authorities.
    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }
}

/// One atomic snapshot pushed by the identity issuer.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    identities: Vec<Arc<Identity>>,
    bundles: HashMap<TrustDomain, Arc<TrustBundle>>,
}

impl IdentityUpdate {
    /// Creates a snapshot. Identity order is preserved; the first is the default.
    pub fn new(identities: Vec<Identity>, bundles: Vec<TrustBundle>) -> Self {
        Self {
            identities: identities.into_iter().map(Arc::new).collect(),
            bundles: bundles
                .into_iter()
                .map(|b| (b.trust_domain().clone(), Arc::new(b)))
                .collect(),
        }
    }

    /// All identities in issuer order.
    pub fn identities(&self) -> &[Arc<Identity>] {
        &self.identities
    }

    /// The issuer's default identity, if any.
    pub fn default_identity(&self) -> Option<&Arc<Identity>> {
        self.identities.first()
    }

    /// The bundle for `trust_domain`.
    pub fn bundle_for(&self, trust_domain: &TrustDomain) -> Option<&Arc<TrustBundle>> {
        self.bundles.get(trust_domain)
    }

    /// All bundles, in no particular order.
    pub fn bundles(&self) -> impl Iterator<Item = &Arc<TrustBundle>> {
        self.bundles.values()
    }
}

/// Splits a concatenation of DER certificates, checking each one parses.
fn split_der_certificates(
    der: &[u8],
    max: Option<usize>,
) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let mut rest = der;
    let mut certs = Vec::new();

    while !rest.is_empty() {
        if let Some(max) = max {
            if certs.len() >= max {
                return Err(IdentityError::ChainTooLong { max });
            }
        }

        let (new_rest, _) = x509_parser::parse_x509_certificate(rest)
            .map_err(|e| IdentityError::CertParse(e.to_string()))?;
        let len = rest.len() - new_rest.len();
        certs.push(CertificateDer::from(rest[..len].to_vec()));
        rest = new_rest;
    }

    if certs.is_empty() {
        return Err(IdentityError::EmptyChain);
    }
    Ok(certs)
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, IdentityError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| IdentityError::CertParse(e.to_string()))
}

fn find_extension<'a>(
    cert: &'a X509Certificate<'_>,
    oid: &Oid<'static>,
) -> Result<Option<&'a ParsedExtension<'a>>, IdentityError> {
    cert.tbs_certificate
        .get_extension_unique(oid)
        .map(|found| found.map(|e| e.parsed_extension()))
        .map_err(|e| IdentityError::CertParse(e.to_string()))
}

fn validate_leaf(cert: &X509Certificate<'_>) -> Result<(), IdentityError> {
    if let Some(ParsedExtension::BasicConstraints(bc)) =
        find_extension(cert, &oid_registry::OID_X509_EXT_BASIC_CONSTRAINTS)?
    {
        if bc.ca {
            return Err(IdentityError::LeafIsCa);
        }
    }

    match find_extension(cert, &oid_registry::OID_X509_EXT_KEY_USAGE)? {
        Some(ParsedExtension::KeyUsage(ku)) if ku.digital_signature() => Ok(()),
        _ => Err(IdentityError::LeafMissingDigitalSignature),
    }
}

/// Extracts the single SPIFFE ID from the URI SANs of `cert`.
pub(crate) fn spiffe_id_from_certificate(
    cert: &X509Certificate<'_>,
) -> Result<SpiffeId, IdentityError> {
    let san = cert
        .tbs_certificate
        .subject_alternative_name()
        .map_err(|e| IdentityError::CertParse(e.to_string()))?
        .ok_or(IdentityError::MissingSpiffeId)?;

    let mut found: Option<SpiffeId> = None;
    let mut uri_count = 0usize;
    for name in &san.value.general_names {
        let GeneralName::URI(uri) = name else {
            continue;
        };

        uri_count += 1;
        if uri_count > MAX_URI_SAN_ENTRIES {
            return Err(IdentityError::CertParse(format!(
                "more than {MAX_URI_SAN_ENTRIES} URI SAN entries"
            )));
        }
        if !uri.starts_with(SPIFFE_SCHEME_PREFIX) {
            continue;
        }
        if found.is_some() {
            return Err(IdentityError::MultipleSpiffeIds);
        }
        found = Some(SpiffeId::new(uri)?);
    }

    found.ok_or(IdentityError::MissingSpiffeId)
}

/// Parses `der` and extracts its SPIFFE ID.
pub(crate) fn spiffe_id_from_der(der: &[u8]) -> Result<SpiffeId, IdentityError> {
    spiffe_id_from_certificate(&parse_certificate(der)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::{Ca, LeafOptions};

    #[test]
    fn parses_leaf_and_intermediates() {
        let ca = Ca::new("example.org");
        let svid = ca.issue("spiffe://example.org/mysql/client");

        let mut chain = svid.leaf_der.clone();
        chain.extend_from_slice(&ca.cert_der);
        let identity = Identity::from_der(&chain, &svid.key_der, "mysql-client").unwrap();

        assert_eq!(
            identity.spiffe_id().to_string(),
            "spiffe://example.org/mysql/client"
        );
        assert_eq!(identity.hint(), "mysql-client");
        assert_eq!(identity.cert_chain().len(), 2);
        assert_eq!(identity.leaf().as_ref(), svid.leaf_der.as_slice());
        assert!(identity.not_after() > 0);
    }

    #[test]
    fn rejects_empty_chain_and_key() {
        let ca = Ca::new("example.org");
        let svid = ca.issue("spiffe://example.org/a");

        assert_eq!(
            Identity::from_der(&[], &svid.key_der, "").unwrap_err(),
            IdentityError::EmptyChain
        );
        assert_eq!(
            Identity::from_der(&svid.leaf_der, &[], "").unwrap_err(),
            IdentityError::EmptyKey
        );
    }

    #[test]
    fn rejects_leaf_without_spiffe_id() {
        let ca = Ca::new("example.org");
        let svid = ca.issue_with(LeafOptions {
            uris: vec![],
            ..LeafOptions::default()
        });

        assert_eq!(
            Identity::from_der(&svid.leaf_der, &svid.key_der, "").unwrap_err(),
            IdentityError::MissingSpiffeId
        );
    }

    #[test]
    fn rejects_leaf_with_two_spiffe_ids() {
        let ca = Ca::new("example.org");
        let svid = ca.issue_with(LeafOptions {
            uris: vec!["spiffe://example.org/a".into(), "spiffe://example.org/b".into()],
            ..LeafOptions::default()
        });

        assert_eq!(
            Identity::from_der(&svid.leaf_der, &svid.key_der, "").unwrap_err(),
            IdentityError::MultipleSpiffeIds
        );
    }

    #[test]
    fn rejects_ca_as_leaf() {
        let ca = Ca::new("example.org");
        let err = Identity::from_der(&ca.cert_der, &ca.key_der, "").unwrap_err();
        assert!(matches!(
            err,
            IdentityError::LeafIsCa | IdentityError::LeafMissingDigitalSignature
        ));
    }

    #[test]
    fn rejects_garbage() {
        let err = Identity::from_der(b"not a certificate", b"key", "").unwrap_err();
        assert!(matches!(err, IdentityError::CertParse(_)));
    }

    #[test]
    fn bundle_requires_authorities() {
        let td = TrustDomain::new("example.org").unwrap();
        assert_eq!(
            TrustBundle::new(td.clone(), vec![]).unwrap_err(),
            IdentityError::EmptyBundle("example.org".into())
        );

        let ca = Ca::new("example.org");
        let bundle = TrustBundle::from_der(td, &ca.cert_der).unwrap();
        assert_eq!(bundle.authorities().len(), 1);
    }

    #[test]
    fn update_keeps_issuer_order_and_indexes_bundles() {
        let ca = Ca::new("example.org");
        let first = ca.identity("spiffe://example.org/one", "one");
        let second = ca.identity("spiffe://example.org/two", "two");

        let update = IdentityUpdate::new(vec![first, second], vec![ca.bundle()]);

        assert_eq!(update.identities().len(), 2);
        assert_eq!(update.default_identity().unwrap().hint(), "one");
        let td = TrustDomain::new("example.org").unwrap();
        assert!(update.bundle_for(&td).is_some());
        let other = TrustDomain::new("other.org").unwrap();
        assert!(update.bundle_for(&other).is_none());
    }
}
