//! TLS integration tests

use super::{
    client_config, get_free_port, http_get, single_mapping, start_client, start_http_backend,
    TestRelay, HTTP_RESPONSE,
};
use lanbridge_common::TlsConfig;
use std::net::SocketAddr;

/// Generate a self-signed certificate for testing
fn generate_self_signed_cert(subject_alt_names: Vec<String>) -> (String, String) {
    let mut params =
        rcgen::CertificateParams::new(subject_alt_names).expect("Failed to create params");
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "localhost");

    let key_pair = rcgen::KeyPair::generate().expect("Failed to generate key pair");
    let cert = params
        .self_signed(&key_pair)
        .expect("Failed to generate cert");
    (cert.pem(), key_pair.serialize_pem())
}

/// Client and relay talk over TLS only; user traffic is unchanged.
#[tokio::test]
async fn test_session_over_tls() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let dir = tempfile::tempdir().unwrap();
    let (cert_pem, key_pem) =
        generate_self_signed_cert(vec!["localhost".to_string(), "127.0.0.1".to_string()]);
    let cert_path = dir.path().join("relay.crt");
    let key_path = dir.path().join("relay.key");
    std::fs::write(&cert_path, cert_pem).unwrap();
    std::fs::write(&key_path, key_pem).unwrap();

    let backend = start_http_backend().await;
    let port = get_free_port();
    let tls_addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();

    let server_tls = TlsConfig {
        enabled: true,
        cert_path: Some(cert_path.clone()),
        key_path: Some(key_path),
        ..Default::default()
    };
    let relay = TestRelay::start_with(single_mapping("k1", port, &backend.to_string()), |c| {
        c.tls = server_tls;
        c.tls_bind_addr = Some(tls_addr);
    })
    .await;
    assert!(super::wait_for_server(tls_addr, std::time::Duration::from_secs(5)).await);

    let mut config = client_config(tls_addr, "k1");
    config.tls = TlsConfig {
        enabled: true,
        ca_cert_path: Some(cert_path),
        server_name: Some("localhost".to_string()),
        ..Default::default()
    };
    let client = start_client(config);
    relay.wait_online("k1").await;

    assert_eq!(http_get(port).await, HTTP_RESPONSE);
    client.cancel();
}
