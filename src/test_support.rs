//! Ephemeral SPIFFE PKI for unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use spiffe::TrustDomain;

use crate::identity::{Identity, TrustBundle};

pub(crate) struct Ca {
    pub(crate) trust_domain: String,
    pub(crate) cert_der: Vec<u8>,
    pub(crate) key_der: Vec<u8>,
    issuer: Issuer<'static, KeyPair>,
}

pub(crate) struct IssuedSvid {
    pub(crate) leaf_der: Vec<u8>,
    pub(crate) key_der: Vec<u8>,
}

pub(crate) struct LeafOptions {
    pub(crate) uris: Vec<String>,
}

impl Default for LeafOptions {
    fn default() -> Self {
        Self {
            uris: vec!["spiffe://example.org/workload".into()],
        }
    }
}

impl Ca {
    pub(crate) fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.distinguished_name = common_name(&format!("{trust_domain} root"));
        params
            .subject_alt_names
            .push(SanType::URI(format!("spiffe://{trust_domain}").try_into().unwrap()));

        let cert = params.self_signed(&key).unwrap();
        let key_der = key.serialize_der();

        Self {
            trust_domain: trust_domain.to_owned(),
            cert_der: cert.der().to_vec(),
            key_der,
            issuer: Issuer::new(params, key),
        }
    }

    pub(crate) fn issue(&self, spiffe_id: &str) -> IssuedSvid {
        self.issue_with(LeafOptions {
            uris: vec![spiffe_id.to_owned()],
        })
    }

    pub(crate) fn issue_with(&self, opts: LeafOptions) -> IssuedSvid {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.distinguished_name = common_name("svid");
        for uri in opts.uris {
            params
                .subject_alt_names
                .push(SanType::URI(uri.try_into().unwrap()));
        }

        let cert = params.signed_by(&key, &self.issuer).unwrap();
        IssuedSvid {
            leaf_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
        }
    }

    pub(crate) fn identity(&self, spiffe_id: &str, hint: &str) -> Identity {
        let svid = self.issue(spiffe_id);
        Identity::from_der(&svid.leaf_der, &svid.key_der, hint).unwrap()
    }

    pub(crate) fn bundle(&self) -> TrustBundle {
        TrustBundle::from_der(TrustDomain::new(&self.trust_domain).unwrap(), &self.cert_der)
            .unwrap()
    }
}

fn common_name(cn: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, cn);
    name
}
