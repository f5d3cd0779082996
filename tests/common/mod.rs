//! Shared fixtures: an ephemeral SPIFFE PKI and an in-memory TLS database.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::fmt;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use spiffe_db_rotator::{
    BoxError, ConnectionTarget, DatabaseHandle, Driver, Identity, IdentityUpdate, SpiffeId,
    TlsRegistry, TrustBundle, TrustDomain,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const SERVER_ID: &str = "spiffe://example.org/mysql/server";
pub const CLIENT_ID: &str = "spiffe://example.org/mysql/client";

pub fn provider() -> Arc<CryptoProvider> {
    #[cfg(feature = "aws-lc-rs")]
    return Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    #[cfg(not(feature = "aws-lc-rs"))]
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn target() -> ConnectionTarget {
    ConnectionTarget::new("mysql.internal", 3306, "mysql-tls-reloader")
}

pub fn server_id() -> SpiffeId {
    SpiffeId::new(SERVER_ID).unwrap()
}

/// A trust domain's root CA.
pub struct Pki {
    pub trust_domain: String,
    pub ca_der: Vec<u8>,
    issuer: Issuer<'static, KeyPair>,
}

pub struct Svid {
    pub leaf_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl Svid {
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.leaf_der.clone())]
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
    }
}

impl Pki {
    pub fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.distinguished_name = common_name(&format!("{trust_domain} root"));
        params
            .subject_alt_names
            .push(SanType::URI(format!("spiffe://{trust_domain}").try_into().unwrap()));
        let cert = params.self_signed(&key).unwrap();

        Self {
            trust_domain: trust_domain.to_owned(),
            ca_der: cert.der().to_vec(),
            issuer: Issuer::new(params, key),
        }
    }

    pub fn issue(&self, spiffe_id: &str) -> Svid {
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
        params
            .subject_alt_names
            .push(SanType::URI(spiffe_id.try_into().unwrap()));
        let cert = params.signed_by(&key, &self.issuer).unwrap();

        Svid {
            leaf_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
        }
    }

    pub fn identity(&self, spiffe_id: &str, hint: &str) -> Identity {
        let svid = self.issue(spiffe_id);
        Identity::from_der(&svid.leaf_der, &svid.key_der, hint).unwrap()
    }

    pub fn bundle(&self) -> TrustBundle {
        TrustBundle::from_der(TrustDomain::new(&self.trust_domain).unwrap(), &self.ca_der)
            .unwrap()
    }

    /// An update carrying fresh server and client SVIDs plus this bundle.
    pub fn update(&self) -> IdentityUpdate {
        IdentityUpdate::new(
            vec![
                self.identity(SERVER_ID, "mysql-server"),
                self.identity(CLIENT_ID, "mysql-client"),
            ],
            vec![self.bundle()],
        )
    }

    /// A server config presenting `spiffe_id` and requiring client certs
    /// issued by `clients`.
    pub fn server_config(&self, spiffe_id: &str, clients: &Pki) -> Arc<ServerConfig> {
        let svid = self.issue(spiffe_id);
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(clients.ca_der.clone())).unwrap();

        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .unwrap();
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(svid.chain(), svid.key())
            .unwrap();
        Arc::new(config)
    }
}

fn common_name(cn: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, cn);
    name
}

/// An in-memory database speaking a trivial protocol over TLS: each
/// statement is recorded and acknowledged with `1`.
#[derive(Debug)]
pub struct DbServer {
    config: Mutex<Arc<ServerConfig>>,
    statements: Mutex<Vec<String>>,
    client_leaves: Mutex<Vec<Vec<u8>>>,
}

impl DbServer {
    pub fn new(config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            statements: Mutex::new(Vec::new()),
            client_leaves: Mutex::new(Vec::new()),
        })
    }

    /// Changes the certificate presented to new connections.
    pub fn set_config(&self, config: Arc<ServerConfig>) {
        *self.config.lock().unwrap() = config;
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    /// Leaf certificates presented by clients, in connection order.
    pub fn client_leaves(&self) -> Vec<Vec<u8>> {
        self.client_leaves.lock().unwrap().clone()
    }

    fn accept(self: &Arc<Self>) -> DuplexStream {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let acceptor = TlsAcceptor::from(Arc::clone(&self.config.lock().unwrap()));
        let server = Arc::clone(self);

        tokio::spawn(async move {
            let Ok(mut tls) = acceptor.accept(server_io).await else {
                return;
            };
            if let Some(leaf) = tls.get_ref().1.peer_certificates().and_then(|c| c.first()) {
                server.client_leaves.lock().unwrap().push(leaf.to_vec());
            }

            let mut buf = vec![0u8; 4096];
            loop {
                let n = match tls.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let statement = String::from_utf8_lossy(&buf[..n]).into_owned();
                server.statements.lock().unwrap().push(statement);
                if tls.write_all(b"1").await.is_err() || tls.flush().await.is_err() {
                    return;
                }
            }
        });

        client_io
    }
}

/// Connects to a [`DbServer`] with the registered client config.
#[derive(Debug, Clone)]
pub struct TlsDriver {
    server: Arc<DbServer>,
}

impl TlsDriver {
    pub fn new(server: &Arc<DbServer>) -> Self {
        Self {
            server: Arc::clone(server),
        }
    }
}

impl Driver for TlsDriver {
    type Handle = TlsHandle;

    async fn open(
        &self,
        _target: &ConnectionTarget,
        registry: &TlsRegistry,
        tls_name: &str,
    ) -> Result<TlsHandle, BoxError> {
        let config = registry.get(tls_name).ok_or("missing tls registration")?;
        let io = self.server.accept();
        let stream = TlsConnector::from(config)
            .connect(ServerName::try_from("mysql.internal")?, io)
            .await?;
        Ok(TlsHandle {
            registration: tls_name.to_owned(),
            stream: tokio::sync::Mutex::new(stream),
        })
    }
}

pub struct TlsHandle {
    pub registration: String,
    stream: tokio::sync::Mutex<TlsStream<DuplexStream>>,
}

impl fmt::Debug for TlsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandle")
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle for TlsHandle {
    async fn execute(&self, statement: &str) -> Result<u64, BoxError> {
        let mut stream = self.stream.lock().await;
        stream.write_all(statement.as_bytes()).await?;
        stream.flush().await?;
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await?;
        Ok(u64::from(ack[0].saturating_sub(b'0')))
    }
}
