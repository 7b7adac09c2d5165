//! src/transport/tls.rs
//!
//! TLS material for the QUIC endpoint. Each process self-signs a throwaway
//! certificate and clients skip verifier checks: peers authenticate each
//! other with the cluster MAC, not with a PKI.

use crate::error::{Error, Result};
use quinn::{ClientConfig, ServerConfig};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const ALPN: &[u8] = b"repram/1";

/// Builds the server and client halves of the endpoint's TLS configuration.
pub fn configure() -> Result<(ServerConfig, ClientConfig)> {
    let cert = rcgen::generate_simple_self_signed(vec!["repram".to_string()])
        .map_err(|e| Error::TlsConfig(format!("Failed to generate certificate: {}", e)))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| Error::TlsConfig(format!("Failed to serialize certificate: {}", e)))?;
    let key_der = cert.serialize_private_key_der();

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![rustls::Certificate(cert_der)], rustls::PrivateKey(key_der))
        .map_err(|e| Error::TlsConfig(format!("Failed to create server config: {}", e)))?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(server_crypto));
    let transport_config = Arc::get_mut(&mut server_config.transport)
        .expect("transport config is not shared yet");
    transport_config.keep_alive_interval(Some(Duration::from_secs(10)));

    let mut client_crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];
    let client_config = ClientConfig::new(Arc::new(client_crypto));

    Ok((server_config, client_config))
}

/// Certificate verifier that accepts any server certificate. Transport-level
/// identity is meaningless here: every inbound message is authenticated by
/// the cluster MAC before it is dispatched.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
