//! Writes the selected credential to disk for readers outside this process.
//!
//! The database engine reads its server certificate, key and CA bundle from
//! fixed paths. [`Materializer::persist`] replaces all three with
//! temp-write-then-rename:
//!
//! 1. every artifact is written to a temporary file in its destination
//!    directory, flushed and synced;
//! 2. only then are the temporaries renamed over the live files, certificate
//!    first, key second, bundle last.
//!
//! A failure in step 1 leaves the live files untouched. A failure in step 2 can
//! leave the certificate (and key) one generation ahead of the bundle; the
//! caller must not issue a reload after an error.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::identity::{Identity, TrustBundle};
use crate::prelude::debug;

const PEM_LINE_WIDTH: usize = 64;

/// Where the materialized credential lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialPaths {
    /// Directory holding the three files.
    pub dir: PathBuf,
    /// File name of the PEM certificate chain.
    pub cert_file: String,
    /// File name of the PEM PKCS#8 private key.
    pub key_file: String,
    /// File name of the PEM trust bundle.
    pub bundle_file: String,
    /// Unix mode of the key file.
    pub key_mode: u32,
}

impl Default for CredentialPaths {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/spire/certs"),
            cert_file: "svid.0.pem".into(),
            key_file: "svid.0.key".into(),
            bundle_file: "bundle.0.pem".into(),
            key_mode: 0o600,
        }
    }
}

impl CredentialPaths {
    /// Default file names under `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Full path of the certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(&self.cert_file)
    }

    /// Full path of the key file.
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(&self.key_file)
    }

    /// Full path of the bundle file.
    pub fn bundle_path(&self) -> PathBuf {
        self.dir.join(&self.bundle_file)
    }
}

/// Persists identities as PEM files.
#[derive(Debug, Clone)]
pub struct Materializer {
    paths: CredentialPaths,
}

impl Materializer {
    /// Creates a materializer writing to `paths`.
    pub fn new(paths: CredentialPaths) -> Self {
        Self { paths }
    }

    /// The configured paths.
    pub fn paths(&self) -> &CredentialPaths {
        &self.paths
    }

    /// Replaces the certificate, key and bundle files with `identity` and `bundle`.
    ///
    /// Blocking; call from `spawn_blocking` inside async code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] naming the file that could not be written or moved
    /// into place. No retry is attempted.
    pub fn persist(&self, identity: &Identity, bundle: &TrustBundle) -> Result<()> {
        let cert_pem = encode_certificates(identity.cert_chain());
        let key_pem = pem_block("PRIVATE KEY", identity.private_key_der());
        let bundle_pem = encode_certificates(bundle.authorities());

        let staged = [
            stage(&self.paths.cert_path(), cert_pem.as_bytes(), 0o644)?,
            stage(&self.paths.key_path(), key_pem.as_bytes(), self.paths.key_mode)?,
            stage(&self.paths.bundle_path(), bundle_pem.as_bytes(), 0o644)?,
        ];

        for (tmp, target) in staged {
            tmp.persist(&target).map_err(|e| Error::Io {
                path: target.clone(),
                source: e.error,
            })?;
        }

        sync_dir(&self.paths.dir)?;

        debug!(
            "materialized credential for {} into {}",
            identity.spiffe_id(),
            self.paths.dir.display()
        );
        Ok(())
    }
}

fn stage(target: &Path, contents: &[u8], mode: u32) -> Result<(NamedTempFile, PathBuf)> {
    let io_err = |source| Error::Io {
        path: target.to_path_buf(),
        source,
    };

    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    set_mode(tmp.path(), mode).map_err(io_err)?;

    Ok((tmp, target.to_path_buf()))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|source| Error::Io {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn encode_certificates<C: AsRef<[u8]>>(certs: &[C]) -> String {
    certs
        .iter()
        .map(|c| pem_block("CERTIFICATE", c.as_ref()))
        .collect()
}

fn pem_block(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);

    out.push_str("-----BEGIN ");
    out.push_str(label);
    out.push_str("-----\n");
    for (i, c) in body.chars().enumerate() {
        if i > 0 && i % PEM_LINE_WIDTH == 0 {
            out.push('\n');
        }
        out.push(c);
    }
    out.push_str("\n-----END ");
    out.push_str(label);
    out.push_str("-----\n");
    out
}
