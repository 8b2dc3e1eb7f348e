//! Certificate authority for sidecar mTLS identities
//!
//! A single self-signed root signs one leaf certificate per service. The root
//! key never leaves the secrets directory. Leaf paths are derived from the
//! service name alone, so the runtime mount step needs no extra bookkeeping.

use std::path::PathBuf;

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::mesh::identity::ServiceIdentity;
use crate::storage::layout::StorageLayout;

const KEY_BITS: u32 = 2048;
const ROOT_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 365;
const SERIAL_BITS: i32 = 159;

const ROOT_KEY_MODE: u32 = 0o600;
// The sidecar process runs under its own uid and reads this through a bind mount.
const LEAF_KEY_MODE: u32 = 0o644;
const CERT_MODE: u32 = 0o644;

/// Where a service's leaf certificate and key live on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Issues and persists the root CA and per-service leaf certificates
#[derive(Debug)]
pub struct CertificateAuthority {
    layout: StorageLayout,
    organization: String,
    network_domain: String,
    root_lock: Mutex<()>,
}

impl CertificateAuthority {
    pub fn new(layout: StorageLayout, organization: impl Into<String>, network_domain: impl Into<String>) -> Self {
        Self {
            layout,
            organization: organization.into(),
            network_domain: network_domain.into(),
            root_lock: Mutex::new(()),
        }
    }

    pub fn root_cert_file(&self) -> File {
        self.layout.ca_cert_file()
    }

    fn root_key_file(&self) -> File {
        self.layout.ca_key_file()
    }

    /// Leaf paths for a service. A pure function of the name.
    pub fn leaf_paths(&self, identity: &ServiceIdentity) -> CertificatePaths {
        CertificatePaths {
            cert: self.layout.service_cert_file(identity.name()).path().to_path_buf(),
            key: self.layout.service_key_file(identity.name()).path().to_path_buf(),
        }
    }

    /// Whether both halves of the service's leaf are on disk
    pub async fn leaf_exists(&self, identity: &ServiceIdentity) -> bool {
        self.layout.service_cert_file(identity.name()).exists().await
            && self.layout.service_key_file(identity.name()).exists().await
    }

    /// Create the root CA unless both its certificate and key already exist
    pub async fn ensure_root(&self) -> Result<(), DeployError> {
        let _guard = self.root_lock.lock().await;

        let cert_file = self.root_cert_file();
        let key_file = self.root_key_file();
        if cert_file.exists().await && key_file.exists().await {
            debug!("Root CA already present at {:?}", cert_file.path());
            return Ok(());
        }

        info!("Generating root CA for '{}'", self.organization);
        let organization = self.organization.clone();
        let (cert_pem, key_pem) = tokio::task::spawn_blocking(move || generate_root(&organization))
            .await
            .map_err(|e| DeployError::Internal(e.to_string()))??;

        key_file.write_atomic(&key_pem, ROOT_KEY_MODE).await?;
        cert_file.write_atomic(&cert_pem, CERT_MODE).await?;
        info!("Root CA written to {:?}", cert_file.path());
        Ok(())
    }

    /// Issue a leaf certificate for a service, overwriting any existing one.
    ///
    /// Callers that want to avoid re-issuance check [`leaf_exists`] first.
    ///
    /// [`leaf_exists`]: CertificateAuthority::leaf_exists
    pub async fn issue_leaf(&self, identity: &ServiceIdentity) -> Result<CertificatePaths, DeployError> {
        self.ensure_root().await?;

        let root_cert_pem = self.root_cert_file().read_bytes().await?;
        let root_key_pem = self.root_key_file().read_bytes().await?;

        let subject = LeafSubject {
            common_name: identity.name().to_string(),
            dns_names: vec![
                identity.name().to_string(),
                identity.network_fqdn(&self.network_domain),
            ],
            organization: self.organization.clone(),
        };
        let (cert_pem, key_pem) = tokio::task::spawn_blocking(move || {
            let root_cert = X509::from_pem(&root_cert_pem)?;
            let root_key = PKey::private_key_from_pem(&root_key_pem)?;
            generate_leaf(&subject, &root_cert, &root_key)
        })
        .await
        .map_err(|e| DeployError::Internal(e.to_string()))??;

        let paths = self.leaf_paths(identity);
        File::new(&paths.key).write_atomic(&key_pem, LEAF_KEY_MODE).await?;
        File::new(&paths.cert).write_atomic(&cert_pem, CERT_MODE).await?;
        info!("Issued certificate for {} at {:?}", identity, paths.cert);
        Ok(paths)
    }
}

struct LeafSubject {
    common_name: String,
    dns_names: Vec<String>,
    organization: String,
}

fn subject_name(organization: &str, common_name: &str) -> Result<X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("C", "US")?;
    name.append_entry_by_text("ST", "CA")?;
    name.append_entry_by_text("L", "San Francisco")?;
    name.append_entry_by_text("O", organization)?;
    name.append_entry_by_text("CN", common_name)?;
    Ok(name.build())
}

fn random_serial() -> Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()
}

fn new_key() -> Result<PKey<Private>, ErrorStack> {
    PKey::from_rsa(Rsa::generate(KEY_BITS)?)
}

fn base_builder(
    subject: &X509Name,
    key: &PKey<Private>,
    validity_days: u32,
) -> Result<X509Builder, ErrorStack> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(validity_days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

/// Returns (certificate PEM, PKCS#8 key PEM)
fn generate_root(organization: &str) -> Result<(Vec<u8>, Vec<u8>), DeployError> {
    let key = new_key()?;
    let subject = subject_name(&format!("{} CA", organization), &format!("{}-ca", organization))?;

    let mut builder = base_builder(&subject, &key, ROOT_VALIDITY_DAYS)?;
    builder.set_issuer_name(&subject)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .key_encipherment()
            .key_agreement()
            .build()?,
    )?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok((builder.build().to_pem()?, key.private_key_to_pem_pkcs8()?))
}

fn generate_leaf(
    subject: &LeafSubject,
    root_cert: &X509,
    root_key: &PKey<Private>,
) -> Result<(Vec<u8>, Vec<u8>), DeployError> {
    let key = new_key()?;
    let name = subject_name(&format!("{} Services", subject.organization), &subject.common_name)?;

    let mut builder = base_builder(&name, &key, LEAF_VALIDITY_DAYS)?;
    // A leaf must not outlive its issuer.
    let leaf_expiry = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS)?;
    if root_cert.not_after() < leaf_expiry {
        builder.set_not_after(root_cert.not_after())?;
    }
    builder.set_issuer_name(root_cert.subject_name())?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .key_agreement()
            .build()?,
    )?;

    let mut san = SubjectAlternativeName::new();
    for dns in &subject.dns_names {
        san.dns(dns);
    }
    let san = san.build(&builder.x509v3_context(Some(root_cert), None))?;
    builder.append_extension(san)?;

    builder.sign(root_key, MessageDigest::sha256())?;

    Ok((builder.build().to_pem()?, key.private_key_to_pem_pkcs8()?))
}
