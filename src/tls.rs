//! Certificate/key loading and `rustls` config construction for both legs.
//!
//! The client leg uses a [`rustls::ServerConfig`] to terminate the in-band
//! `AUTH TLS` upgrade from the FTP client. The origin leg uses a
//! [`rustls::ClientConfig`] when replaying `AUTH TLS` (or re-establishing TLS
//! after [`crate::proxy_leg::ProxyLeg::switch_origin`]) against the origin.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use anyhow::Result;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::config::TlsConfig;

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let parsed = certs(&mut reader);

    let certs: std::result::Result<Vec<CertificateDer>, _> =
        parsed.map(|res| res.map(CertificateDer::from)).collect();
    Ok(certs?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())?;
    let mut reader = BufReader::new(key_file);

    let key = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 key found in {}", key_path.as_ref().display()))?;

    Ok(PrivateKeyDer::Pkcs8(key))
}

pub fn load_root_store<P: AsRef<Path>>(ca_path: P) -> Result<RootCertStore> {
    let ca_certs = cert_reader(ca_path.as_ref())?;

    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        anyhow::bail!("CA file did not contain any valid certs");
    }
    Ok(root_store)
}

/// Build the config used to terminate the client leg's `AUTH TLS` upgrade.
///
/// Client certificates are accepted but not required: unlike the mutual-TLS
/// sidecar this crate grew out of, FTPS clients commonly don't present one.
pub fn build_server_config(tls: &TlsConfig) -> Result<ServerConfig> {
    let server_cert = cert_reader(&tls.server_cert)?;
    let privkey_server = privkey_reader(&tls.server_key)?;
    let root_store = load_root_store(&tls.ca_file)?;

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
        .allow_unauthenticated()
        .build()?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_cert, privkey_server)?;

    Ok(config)
}

/// Build the config used when the proxy dials an origin over TLS.
///
/// A client certificate/key pair is only presented if configured.
pub fn build_client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let root_store = load_root_store(&tls.ca_file)?;

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let client_cert = cert_reader(cert_path)?;
            let privkey_client = privkey_reader(key_path)?;
            builder.with_client_auth_cert(client_cert, privkey_client)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(config)
}

/// Turn `host:port` into the [`ServerName`] rustls needs for SNI/verification.
pub fn server_name_from_addr(addr: &str) -> Result<ServerName<'static>> {
    let host = addr
        .split(':')
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid address {addr:?}"))?
        .to_owned();
    ServerName::try_from(host).map_err(|_| anyhow::anyhow!("invalid ServerName for {addr:?}"))
}
