//! TLS transport using rustls

use super::socket_tuning::configure_socket_silent;
use super::BoxedStream;
use lanbridge_common::{Result, TlsConfig, TunnelError};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| TunnelError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path)
        .map_err(|e| TunnelError::Tls(format!("{}: {e}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TunnelError::Tls(format!("invalid CA cert: {e}")))?;
    }
    Ok(roots)
}

fn required<'a>(path: Option<&'a Path>, what: &str) -> Result<&'a Path> {
    path.ok_or_else(|| TunnelError::Config(format!("TLS {what} path required")))
}

pub fn create_client_config(config: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let roots = load_roots(required(config.ca_cert_path.as_deref(), "CA certificate")?)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let client_config = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| TunnelError::Tls(format!("client certificate: {e}")))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(client_config))
}

pub fn create_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(required(config.cert_path.as_deref(), "certificate")?)?;
    let key = load_private_key(required(config.key_path.as_deref(), "private key")?)?;

    let builder = if config.client_auth {
        let roots = load_roots(required(config.ca_cert_path.as_deref(), "CA certificate")?)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TunnelError::Tls(format!("client verifier: {e}")))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("TLS config error: {e}")))?;

    Ok(Arc::new(server_config))
}

pub fn create_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(create_server_config(config)?))
}

/// Client-side TLS settings, built once and shared by every dial.
#[derive(Clone)]
pub struct TlsClientTransport {
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsClientTransport {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        Ok(Self {
            connector: TlsConnector::from(create_client_config(config)?),
            server_name: config.server_name.clone(),
        })
    }

    fn server_name(&self, addr: &str) -> io::Result<ServerName<'static>> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => addr
                .rsplit_once(':')
                .map_or(addr, |(host, _)| host)
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
        };
        ServerName::try_from(name)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, format!("invalid server name: {e}")))
    }
}

pub async fn connect(addr: &str, transport: &TlsClientTransport) -> io::Result<BoxedStream> {
    let server_name = transport.server_name(addr)?;

    let tcp_stream = TcpStream::connect(addr).await?;
    configure_socket_silent(&tcp_stream);

    let tls_stream = transport.connector.connect(server_name, tcp_stream).await?;
    Ok(Box::pin(tls_stream))
}
