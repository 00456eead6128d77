use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, ServerName, pem::PemObject as _},
};

pub type UpstreamHttpsConnector = HttpsConnector<HttpConnector>;

pub fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

/// Trust store for origin connections: the platform roots plus any extra PEM
/// anchors from `upstream_root_certs`.
pub fn upstream_root_store(extra_roots: &[PathBuf]) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::debug!("skipping unreadable native root certificate: {err}");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "loaded native TLS root certificates");

    for path in extra_roots {
        let certs = CertificateDer::pem_file_iter(path)
            .with_context(|| format!("read upstream root certificates {}", path.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("parse upstream root certificates {}", path.display()))?;
        if certs.is_empty() {
            anyhow::bail!("no certificates found in {}", path.display());
        }
        for cert in certs {
            roots
                .add(cert)
                .with_context(|| format!("add upstream root certificate {}", path.display()))?;
        }
    }

    Ok(roots)
}

/// Client configuration for origin TLS sessions. No ALPN is advertised; the
/// interception engine sets `http/1.1` on its own copy.
pub fn upstream_client_config(extra_roots: &[PathBuf]) -> anyhow::Result<Arc<ClientConfig>> {
    ensure_rustls_crypto_provider()?;
    let roots = upstream_root_store(extra_roots)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn https_connector(
    client_config: &ClientConfig,
    connect_timeout: Duration,
) -> UpstreamHttpsConnector {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));

    HttpsConnectorBuilder::new()
        .with_tls_config(client_config.clone())
        .https_or_http()
        .enable_http1()
        .wrap_connector(http)
}

/// TLS server name for `host`; IP literals (bracketed or not) become IP names.
pub fn server_name(host: &str) -> anyhow::Result<ServerName<'static>> {
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    ServerName::try_from(host.to_owned())
        .map_err(|err| anyhow::anyhow!("invalid TLS server name `{host}`: {err}"))
}
