//! Root certificate authority and per-host leaf issuance for TLS interception.

use anyhow::{anyhow, Context};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
    PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};

pub const CA_CERT_FILE: &str = "tapline_ca.pem";
pub const CA_KEY_FILE: &str = "tapline_ca.key";

const LEAF_CACHE_CAPACITY: usize = 256;

/// Location of the root CA material inside a storage directory.
#[derive(Debug, Clone)]
pub struct CaPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CaPaths {
    pub fn in_dir(storage_dir: &Path) -> Self {
        Self {
            cert: storage_dir.join(CA_CERT_FILE),
            key: storage_dir.join(CA_KEY_FILE),
        }
    }

    /// Presence check only: both files exist and are non-empty.
    fn is_present(&self) -> bool {
        let non_empty = |p: &Path| fs::metadata(p).map(|m| m.len() > 0).unwrap_or(false);
        non_empty(&self.cert) && non_empty(&self.key)
    }
}

/// Generate the root CA if its files are missing or empty.
/// Returns `true` when new material was written.
pub fn ensure_root(storage_dir: &Path) -> anyhow::Result<bool> {
    let paths = CaPaths::in_dir(storage_dir);
    if paths.is_present() {
        return Ok(false);
    }

    let (ca_cert, ca_key) = generate_root()?;
    fs::create_dir_all(storage_dir).context("Failed to create cert storage directory")?;
    fs::write(&paths.cert, ca_cert.pem()).context("Failed to write CA certificate")?;
    fs::write(&paths.key, ca_key.serialize_pem()).context("Failed to write CA key")?;
    tracing::info!("Generated new root CA at {}", paths.cert.display());
    Ok(true)
}

fn generate_root() -> anyhow::Result<(Certificate, KeyPair)> {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let now = OffsetDateTime::now_utc();
    let common_name = format!(
        "Tapline Proxy CA ({}, {:04}-{:02}-{:02})",
        hostname,
        now.year(),
        now.month() as u8,
        now.day()
    );

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Tapline Proxy");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
    params.not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);

    // RSA-2048 keeps older device trust stores happy.
    let key_pair = match KeyPair::generate_for(&PKCS_RSA_SHA256) {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!("RSA key generation unavailable ({err}), using ECDSA P-256");
            KeyPair::generate().context("Failed to generate CA key")?
        }
    };
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign CA certificate")?;
    Ok((cert, key_pair))
}

/// Loaded root CA able to mint leaf certificates on demand.
pub struct CertManager {
    paths: CaPaths,
    pub ca_cert_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    leaf_configs: Mutex<LeafConfigCache>,
}

impl CertManager {
    /// Ensure the root exists, then parse it for interception.
    pub fn new(storage_dir: &Path) -> anyhow::Result<Self> {
        ensure_root(storage_dir)?;
        Self::load_for_mitm(storage_dir)
    }

    /// Parse the PEM pair. Any parse failure is returned, never papered over.
    pub fn load_for_mitm(storage_dir: &Path) -> anyhow::Result<Self> {
        let paths = CaPaths::in_dir(storage_dir);
        let ca_cert_pem =
            fs::read_to_string(&paths.cert).context("Failed to read CA certificate file")?;
        let ca_key_pem = fs::read_to_string(&paths.key).context("Failed to read CA key file")?;

        let ca_der = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow!("No certificate found in {}", paths.cert.display()))?
            .context("Invalid CA PEM")?;
        let (_, parsed) = x509_parser::parse_x509_certificate(ca_der.as_ref())
            .map_err(|e| anyhow!("Invalid CA certificate: {e}"))?;
        if !parsed.is_ca() {
            return Err(anyhow!("{} is not a CA certificate", paths.cert.display()));
        }

        let ca_key = KeyPair::from_pem(&ca_key_pem).context("CA private key is not valid PEM")?;
        let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem).context("Invalid CA PEM")?;
        let ca_cert = params
            .self_signed(&ca_key)
            .context("CA certificate could not be loaded for signing")?;

        // Chain with the on-disk DER so clients see the exact installed root.
        let ca_chain = vec![ca_der];

        Ok(Self {
            paths,
            ca_cert_pem,
            ca_cert,
            ca_key,
            ca_chain,
            leaf_configs: Mutex::new(LeafConfigCache::new()),
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.paths.cert
    }

    pub fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let cache_key = host.to_ascii_lowercase();
        {
            let mut cache = self
                .leaf_configs
                .lock()
                .map_err(|_| anyhow!("leaf config cache lock poisoned"))?;
            if let Some(cfg) = cache.get(&cache_key) {
                return Ok(cfg);
            }
        }

        let (cert_chain, key_der) = self.issue_leaf_cert(&cache_key)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key_der)
            .context("building MITM server config failed")?;

        // Exchanges are parsed as HTTP/1.1; h2-capable clients fall back.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        let mut cache = self
            .leaf_configs
            .lock()
            .map_err(|_| anyhow!("leaf config cache lock poisoned"))?;
        cache.insert(cache_key, config.clone());
        Ok(config)
    }

    fn issue_leaf_cert(
        &self,
        host: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(host) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(
                Ia5String::try_from(host)
                    .map_err(|_| anyhow!("Invalid hostname for certificate: {host}"))?,
            )];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "Tapline Proxy Intercepted");
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated an hour for clock skew between device and host.
        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 3)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("generating leaf key pair failed")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("signing leaf certificate failed")?;

        let mut chain = Vec::with_capacity(2);
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }

    #[cfg(test)]
    pub fn test_ca_der(&self) -> CertificateDer<'static> {
        self.ca_chain[0].clone()
    }
}

struct LeafConfigCache {
    map: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl LeafConfigCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<ServerConfig>> {
        let cfg = self.map.get(key)?.clone();
        self.promote(key);
        Some(cfg)
    }

    fn insert(&mut self, key: String, config: Arc<ServerConfig>) {
        self.map.insert(key.clone(), config);
        self.promote(&key);
        while self.order.len() > LEAF_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}
