//! Certificate Authority management for the intercepting proxy.
//!
//! Generates and persists the root CA certificate, and mints per-host leaf
//! certificates signed by it on the fly. Leaves are cached by lowercased
//! name for the lifetime of the authority.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, trace};

pub use crate::error::CaError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "interpose-ca.crt";
const CA_KEY_FILENAME: &str = "interpose-ca.key";

const ROOT_COMMON_NAME: &str = "Interpose Root CA";
const ROOT_ORGANIZATION: &str = "Interpose";

/// Source of certificates for client-facing TLS handshakes.
pub trait CertificateAuthority: Send + Sync {
    /// Returns a leaf certificate (chained to the root) for `name`.
    fn mint(&self, name: &str) -> Result<Arc<CertifiedKey>, CaError>;

    /// Returns the root certificate clients must trust.
    fn root(&self) -> CertificateDer<'static>;

    /// Returns the root certificate PEM encoded.
    fn root_pem(&self) -> String {
        der_to_pem(self.root().as_ref())
    }
}

/// Manages the root CA files on disk.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default Interpose data directory.
    pub fn with_default_dir() -> Result<Self, CaError> {
        Ok(Self::new(default_ca_dir()?))
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA certificate exists, generating it if necessary, and
    /// loads it.
    pub fn ensure_ca(&self) -> Result<FileCa, CaError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params =
            CertificateParams::new(Vec::new()).map_err(|e| CaError::Generation(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, ROOT_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, ROOT_ORGANIZATION);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaError::Write(e.to_string()))?;
        write_private(&self.key_path(), &key_pair.serialize_pem())?;

        info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the CA certificate and key into a signing authority.
    pub fn load(&self) -> Result<FileCa, CaError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;
        FileCa::from_pem(&cert_pem, &key_pem)
    }
}

/// Returns `<platform data dir>/ca` for Interpose.
pub fn default_ca_dir() -> Result<PathBuf, CaError> {
    let project_dirs = directories::ProjectDirs::from("com", "interpose", "Interpose")
        .ok_or_else(|| CaError::Generation("Failed to get project dirs".into()))?;
    Ok(project_dirs.data_dir().join("ca"))
}

/// A root CA loaded from PEM, with an unbounded leaf cache.
pub struct FileCa {
    issuer: Issuer<'static, KeyPair>,
    root: CertificateDer<'static>,
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl FileCa {
    /// Builds an authority from a PEM certificate and PEM private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        let root = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Parse("no certificate in CA PEM".into()))?
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            root,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Number of cached leaf certificates.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }

    fn generate_leaf(&self, name: &str) -> Result<CertifiedKey, CaError> {
        let mint_err = |e: &dyn fmt::Display| CaError::Mint {
            name: name.to_string(),
            reason: e.to_string(),
        };

        let mut params = CertificateParams::new(vec![name.to_string()]).map_err(|e| mint_err(&e))?;
        params.distinguished_name.push(DnType::CommonName, name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, ROOT_ORGANIZATION);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate().map_err(|e| mint_err(&e))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| mint_err(&e))?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&key_der).map_err(|e| mint_err(&e))?;

        Ok(CertifiedKey::new(
            vec![cert.der().clone(), self.root.clone()],
            signing_key,
        ))
    }
}

impl CertificateAuthority for FileCa {
    fn mint(&self, name: &str) -> Result<Arc<CertifiedKey>, CaError> {
        let key = name.to_lowercase();

        if let Some(cert) = self.cache.read().get(&key) {
            trace!("Certificate cache hit for {}", name);
            return Ok(Arc::clone(cert));
        }

        debug!("Generating certificate for {}", name);
        let minted = Arc::new(self.generate_leaf(&key)?);

        // A concurrent mint for the same name may have won; keep the first.
        let mut cache = self.cache.write();
        Ok(Arc::clone(cache.entry(key).or_insert(minted)))
    }

    fn root(&self) -> CertificateDer<'static> {
        self.root.clone()
    }
}

impl fmt::Debug for FileCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCa")
            .field("cached", &self.cached())
            .finish_non_exhaustive()
    }
}

/// PEM-encodes a DER certificate.
pub fn der_to_pem(der: &[u8]) -> String {
    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    pem::encode_config(&pem::Pem::new("CERTIFICATE", der.to_vec()), config)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<(), CaError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| CaError::Write(e.to_string()))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| CaError::Write(e.to_string()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<(), CaError> {
    fs::write(path, contents).map_err(|e| CaError::Write(e.to_string()))
}
