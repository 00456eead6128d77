use std::{
    collections::HashMap,
    fs,
    io::Write,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, bail};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, string::Ia5String,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use x509_parser::{parse_x509_certificate, pem::parse_x509_pem};

use crate::error::IssueError;

pub const CA_CERT_FILE_NAME: &str = "cert.pem";
pub const CA_KEY_FILE_NAME: &str = "key.pem";
pub const DEFAULT_EXPORT_CERT_FILE_NAME: &str = "tapproxy-ca.pem";

const DIR_MODE_RESTRICTED: u32 = 0o700;
const FILE_MODE_RESTRICTED: u32 = 0o600;
const FILE_MODE_READABLE: u32 = 0o644;
const LEAF_BACKDATE: time::Duration = time::Duration::days(1);
const LEAF_LIFETIME: time::Duration = time::Duration::days(30);
const DEFAULT_LEAF_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterialPaths {
    pub ca_dir: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaMaterialPaths {
    pub fn from_dir(ca_dir: &Path) -> Self {
        Self {
            ca_dir: ca_dir.to_path_buf(),
            cert_path: ca_dir.join(CA_CERT_FILE_NAME),
            key_path: ca_dir.join(CA_KEY_FILE_NAME),
        }
    }
}

/// Long-lived CA certificate and key, immutable after load.
pub struct CaKeystore {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    common_name: String,
}

impl std::fmt::Debug for CaKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaKeystore")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

impl CaKeystore {
    pub fn load(cert_path: &Path, key_path: &Path, common_name: &str) -> anyhow::Result<Self> {
        validate_ca_material(cert_path, key_path)?;

        let ca_cert_pem = fs::read_to_string(cert_path)
            .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
        let ca_key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("read CA private key {}", key_path.display()))?;
        Self::from_pem(&ca_cert_pem, &ca_key_pem, common_name)
    }

    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str, common_name: &str) -> anyhow::Result<Self> {
        let (_, pem_block) = parse_x509_pem(ca_cert_pem.as_bytes())
            .map_err(|err| anyhow::anyhow!("parse CA certificate PEM: {err}"))?;
        let cert_der = CertificateDer::from(pem_block.contents);

        let key_pair =
            KeyPair::from_pem(ca_key_pem).context("parse CA private key for leaf issuance")?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key_pair)
            .context("parse CA certificate for leaf issuance")?;

        Ok(Self {
            issuer,
            cert_der,
            common_name: common_name.to_owned(),
        })
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Subject CN used for leaves that carry no DNS name.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    fn sign(
        &self,
        params: &CertificateParams,
        leaf_key: &KeyPair,
    ) -> Result<rcgen::Certificate, rcgen::Error> {
        params.signed_by(leaf_key, &self.issuer)
    }
}

/// A minted end-entity certificate plus its private key. Shared read-only
/// between the TLS sessions that present it.
#[derive(Debug, Clone)]
pub struct LeafCert {
    pub names: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    cert_chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl LeafCert {
    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        self.cert_chain.clone()
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    /// TLS server configuration presenting this leaf; HTTP/1.1 only.
    pub fn server_config(&self) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain(), self.private_key())
            .map_err(|err| anyhow::anyhow!("build TLS server certificate: {err}"))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

#[derive(Debug)]
pub struct LeafIssuer {
    ca: Arc<CaKeystore>,
    cache: Mutex<HashMap<String, (Instant, Arc<LeafCert>)>>,
    cache_ttl: Duration,
}

impl LeafIssuer {
    pub fn new(ca: Arc<CaKeystore>) -> Self {
        Self::with_cache_ttl(ca, DEFAULT_LEAF_CACHE_TTL)
    }

    /// A zero `cache_ttl` disables caching.
    pub fn with_cache_ttl(ca: Arc<CaKeystore>, cache_ttl: Duration) -> Self {
        Self {
            ca,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    pub fn ca(&self) -> &CaKeystore {
        &self.ca
    }

    pub fn issue_for_host(&self, name: &str) -> Result<Arc<LeafCert>, IssueError> {
        self.issue(&[name])
    }

    pub fn issue<S: AsRef<str>>(&self, names: &[S]) -> Result<Arc<LeafCert>, IssueError> {
        let mut normalized = Vec::with_capacity(names.len());
        for name in names {
            let name = normalize_leaf_name(name.as_ref())?;
            if !normalized.contains(&name) {
                normalized.push(name);
            }
        }
        if normalized.is_empty() {
            return Err(IssueError::BadName("no names requested".to_owned()));
        }

        let cache_key = normalized.join(",");
        if !self.cache_ttl.is_zero() {
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match cache.get(&cache_key) {
                Some((issued_at, leaf)) if issued_at.elapsed() < self.cache_ttl => {
                    return Ok(Arc::clone(leaf));
                }
                Some(_) => {
                    cache.remove(&cache_key);
                }
                None => {}
            }
        }

        let leaf = Arc::new(self.mint(normalized)?);
        if !self.cache_ttl.is_zero() {
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let ttl = self.cache_ttl;
            cache.retain(|_, (issued_at, _)| issued_at.elapsed() < ttl);
            cache.insert(cache_key, (Instant::now(), Arc::clone(&leaf)));
        }
        Ok(leaf)
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn mint(&self, names: Vec<String>) -> Result<LeafCert, IssueError> {
        let primary = names[0].clone();
        let ca_unusable = |reason: String| IssueError::CaUnusable {
            name: primary.clone(),
            reason,
        };

        let mut subject_alt_names = Vec::with_capacity(names.len());
        for name in &names {
            let san = match name.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(
                    Ia5String::try_from(name.clone())
                        .map_err(|err| IssueError::BadName(format!("`{name}`: {err}")))?,
                ),
            };
            subject_alt_names.push(san);
        }
        let common_name = names
            .iter()
            .find(|name| name.parse::<IpAddr>().is_err())
            .cloned()
            .unwrap_or_else(|| self.ca.common_name().to_owned());

        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params.subject_alt_names = subject_alt_names;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.not_before = now - LEAF_BACKDATE;
        params.not_after = now + LEAF_LIFETIME;
        params.serial_number = Some(next_serial_number());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = true;

        let leaf_key =
            KeyPair::generate().map_err(|err| ca_unusable(format!("generate leaf key: {err}")))?;
        let cert = self
            .ca
            .sign(&params, &leaf_key)
            .map_err(|err| ca_unusable(format!("sign leaf: {err}")))?;

        Ok(LeafCert {
            names,
            not_before: params.not_before,
            not_after: params.not_after,
            cert_chain: vec![cert.der().clone(), self.ca.certificate_der().clone()],
            key_der: leaf_key.serialize_der(),
        })
    }
}

/// Serial numbers combine the process start time with a counter so they
/// never repeat within one run.
fn next_serial_number() -> SerialNumber {
    static PROCESS_EPOCH_NANOS: OnceLock<u64> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let epoch = *PROCESS_EPOCH_NANOS.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    });
    let sequence = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&epoch.to_be_bytes());
    bytes[8..].copy_from_slice(&sequence.to_be_bytes());
    // positive and without a leading zero octet
    bytes[0] = (bytes[0] & 0x3f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

fn normalize_leaf_name(name: &str) -> Result<String, IssueError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(IssueError::BadName("name must not be empty".to_owned()));
    }

    let mut normalized = if name.starts_with('[') && name.ends_with(']') {
        name[1..name.len() - 1].to_owned()
    } else {
        name.to_owned()
    };
    if let Some(stripped) = normalized.strip_suffix('.')
        && !stripped.is_empty()
    {
        normalized = stripped.to_owned();
    }
    if normalized.is_empty() {
        return Err(IssueError::BadName("name must not be empty".to_owned()));
    }
    if let Ok(ip) = normalized.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    Ok(normalized.to_ascii_lowercase())
}

pub fn generate_ca(ca_dir: &Path, common_name: &str, force: bool) -> anyhow::Result<CaMaterialPaths> {
    let paths = CaMaterialPaths::from_dir(ca_dir);

    fs::create_dir_all(ca_dir)
        .with_context(|| format!("create CA directory {}", ca_dir.display()))?;
    set_dir_permissions(ca_dir, DIR_MODE_RESTRICTED)?;

    if !force && (paths.cert_path.exists() || paths.key_path.exists()) {
        bail!(
            "CA material already exists at {}; pass `--force` to overwrite",
            ca_dir.display()
        );
    }

    let mut params =
        CertificateParams::new(Vec::new()).context("initialize root CA certificate parameters")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let key_pair = KeyPair::generate().context("generate root CA private key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("self-sign root CA certificate")?;

    write_file_with_permissions(
        &paths.cert_path,
        cert.pem().as_bytes(),
        force,
        FILE_MODE_RESTRICTED,
    )?;
    write_file_with_permissions(
        &paths.key_path,
        key_pair.serialize_pem().as_bytes(),
        force,
        FILE_MODE_RESTRICTED,
    )?;

    Ok(paths)
}

pub fn validate_ca_material(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    let cert_pem = fs::read(cert_path)
        .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
    let key_pem = fs::read_to_string(key_path)
        .with_context(|| format!("read CA private key {}", key_path.display()))?;

    let key_pair = KeyPair::from_pem(&key_pem)
        .with_context(|| format!("parse CA private key PEM {}", key_path.display()))?;

    let (_, pem_block) = parse_x509_pem(&cert_pem).map_err(|err| {
        anyhow::anyhow!("parse CA certificate PEM {}: {err}", cert_path.display())
    })?;
    if pem_block.label != "CERTIFICATE" {
        bail!(
            "parse CA certificate PEM {}: expected CERTIFICATE block, got {}",
            cert_path.display(),
            pem_block.label
        );
    }

    let (_, certificate) = parse_x509_certificate(&pem_block.contents).map_err(|err| {
        anyhow::anyhow!(
            "parse CA certificate DER payload {}: {err}",
            cert_path.display()
        )
    })?;
    if !certificate.is_ca() {
        bail!(
            "certificate {} is not a CA (basicConstraints CA:false or missing)",
            cert_path.display()
        );
    }

    let cert_public_key = certificate
        .tbs_certificate
        .subject_pki
        .subject_public_key
        .data
        .as_ref();
    if cert_public_key != key_pair.public_key_raw() {
        bail!(
            "CA certificate {} and private key {} do not match",
            cert_path.display(),
            key_path.display()
        );
    }

    Ok(())
}

pub fn export_ca_cert(ca_dir: &Path, out_path: &Path, force: bool) -> anyhow::Result<PathBuf> {
    let paths = CaMaterialPaths::from_dir(ca_dir);
    if !paths.cert_path.exists() {
        bail!(
            "CA certificate not found at {}; run `tapproxy ca generate` first",
            paths.cert_path.display()
        );
    }

    let cert_pem = fs::read(&paths.cert_path)
        .with_context(|| format!("read CA certificate {}", paths.cert_path.display()))?;
    write_file_with_permissions(out_path, &cert_pem, force, FILE_MODE_READABLE)?;

    Ok(out_path.to_path_buf())
}

fn write_file_with_permissions(
    path: &Path,
    contents: &[u8],
    force: bool,
    mode: u32,
) -> anyhow::Result<()> {
    if force && path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("remove existing file {}", path.display()))?;
    }

    if path.exists() {
        bail!(
            "file {} already exists; pass `--force` to overwrite",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent directory {}", parent.display()))?;
    }

    let mut file = create_file_with_mode(path, mode)?;
    file.write_all(contents)
        .with_context(|| format!("write file {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync file {}", path.display()))?;
    Ok(())
}

fn create_file_with_mode(path: &Path, mode: u32) -> anyhow::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    opts.open(path)
        .with_context(|| format!("create file {}", path.display()))
}

fn set_dir_permissions(path: &Path, mode: u32) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}
