use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

const STATE_DIR: &str = "/var/lib/netwatch";

type PemPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Build a `rustls::ServerConfig` from the configured PEM paths, from a
/// self-signed pair persisted under `/var/lib/netwatch`, or by minting a
/// fresh self-signed certificate.
pub fn build_tls_config(cert_path: Option<&str>, key_path: Option<&str>) -> Result<ServerConfig> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => read_pem_pair(cert, key)?,
        _ => self_signed_pair()?,
    };

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")
}

/// Parse a certificate chain and private key from a pair of PEM files.
fn read_pem_pair(cert_path: &str, key_path: &str) -> Result<PemPair> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open TLS cert: {cert_path}"))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
            .collect::<std::result::Result<_, _>>()
            .with_context(|| format!("Failed to parse certificate PEM in {cert_path}"))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {cert_path}");
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("Failed to open TLS key: {key_path}"))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .with_context(|| format!("Failed to parse private key PEM in {key_path}"))?
        .with_context(|| format!("No private key found in {key_path}"))?;

    tracing::info!(%cert_path, %key_path, "Loaded TLS certificate");
    Ok((certs, key))
}

/// Reuse the persisted self-signed pair when it still parses, otherwise mint
/// a localhost certificate and persist it so agent connections survive
/// controller restarts.
fn self_signed_pair() -> Result<PemPair> {
    let cert_path = format!("{STATE_DIR}/server-cert.pem");
    let key_path = format!("{STATE_DIR}/server-key.pem");
    std::fs::create_dir_all(STATE_DIR)
        .with_context(|| format!("Failed to create {STATE_DIR}"))?;

    if std::path::Path::new(&cert_path).exists() && std::path::Path::new(&key_path).exists() {
        match read_pem_pair(&cert_path, &key_path) {
            Ok(pair) => return Ok(pair),
            Err(e) => {
                tracing::warn!("Persisted self-signed cert invalid, regenerating: {e}");
            }
        }
    }

    let mut params =
        CertificateParams::new(vec!["localhost".to_string()]).context("Bad certificate params")?;
    let loopbacks: [std::net::IpAddr; 2] = [
        std::net::Ipv4Addr::LOCALHOST.into(),
        std::net::Ipv6Addr::LOCALHOST.into(),
    ];
    params
        .subject_alt_names
        .extend(loopbacks.into_iter().map(SanType::IpAddress));

    let signer = KeyPair::generate().context("Key generation failed")?;
    let cert = params
        .self_signed(&signer)
        .context("Failed to self-sign certificate")?;
    let chain = vec![CertificateDer::from(cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signer.serialize_der()));

    let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert.der().to_vec()));
    std::fs::write(&cert_path, cert_pem.as_bytes())
        .with_context(|| format!("Failed to write {cert_path}"))?;
    let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", signer.serialize_der()));
    write_private(&key_path, key_pem.as_bytes())
        .with_context(|| format!("Failed to write {key_path}"))?;

    tracing::info!(%cert_path, %key_path, "Generated self-signed TLS certificate");
    Ok((chain, key))
}

/// Write a secret file with mode 0600.
fn write_private(path: &str, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?
        .write_all(data)
}
