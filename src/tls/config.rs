use crate::base::neterror::NetError;
use boring::pkey::PKey;
use boring::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode, SslVersion};
use boring::x509::X509;
use std::fmt;

/// TLS settings for the DoH client's HTTPS connections.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    pub cipher_list: String,
    pub alpn_protos: Vec<String>,
    pub curves: Vec<String>,
    /// Verify the server certificate chain and host name.
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            cipher_list: "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
                ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
                ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305"
                .to_string(),
            // Prefer h2 so concurrent queries multiplex over one connection.
            alpn_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            curves: vec!["X25519".to_string(), "P-256".to_string(), "P-384".to_string()],
            verify_peer: true,
        }
    }
}

impl TlsConfig {
    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min)).map_err(|_| NetError::SslProtocolError)?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max)).map_err(|_| NetError::SslProtocolError)?;
        }

        // TLS 1.3 suites are fixed by BoringSSL; this only affects 1.2.
        builder.set_cipher_list(&self.cipher_list).map_err(|_| NetError::SslProtocolError)?;

        if !self.alpn_protos.is_empty() {
            builder
                .set_alpn_protos(&encode_alpn(&self.alpn_protos)?)
                .map_err(|_| NetError::SslProtocolError)?;
        }

        if !self.curves.is_empty() {
            builder
                .set_curves_list(&self.curves.join(":"))
                .map_err(|_| NetError::SslProtocolError)?;
        }

        builder.set_verify(if self.verify_peer {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });

        Ok(())
    }

    /// Builds a connector from this configuration, presenting `client_auth`
    /// if the server asks for a client certificate.
    pub fn build_connector(&self, client_auth: Option<&ClientAuth>) -> Result<SslConnector, NetError> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
        self.apply_to_builder(&mut builder)?;
        if let Some(auth) = client_auth {
            auth.apply_to_builder(&mut builder)?;
        }
        Ok(builder.build())
    }

    /// Check if SNI (Server Name Indication) should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        host.parse::<std::net::IpAddr>().is_err()
    }
}

fn encode_alpn(protos: &[String]) -> Result<Vec<u8>, NetError> {
    let mut wire = Vec::new();
    for proto in protos {
        if proto.is_empty() || proto.len() > 255 {
            return Err(NetError::SslProtocolError);
        }
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Client certificate material for mutual-TLS DoH servers.
///
/// All fields are DER encoded. The intermediate, if any, is sent after the
/// leaf certificate.
#[derive(Clone)]
pub struct ClientAuth {
    certificate: Vec<u8>,
    intermediate: Option<Vec<u8>>,
    private_key: Vec<u8>,
}

impl ClientAuth {
    pub fn new(certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        Self {
            certificate,
            intermediate: None,
            private_key,
        }
    }

    pub fn with_intermediate(mut self, intermediate: Vec<u8>) -> Self {
        self.intermediate = Some(intermediate);
        self
    }

    fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        let leaf = X509::from_der(&self.certificate).map_err(|e| {
            tracing::warn!(error = %e, "client certificate is not valid DER");
            NetError::BadSslClientAuthCert
        })?;
        builder
            .set_certificate(&leaf)
            .map_err(|_| NetError::BadSslClientAuthCert)?;

        if let Some(der) = &self.intermediate {
            let intermediate = X509::from_der(der).map_err(|_| NetError::BadSslClientAuthCert)?;
            builder
                .add_extra_chain_cert(intermediate)
                .map_err(|_| NetError::BadSslClientAuthCert)?;
        }

        let key = PKey::private_key_from_der(&self.private_key)
            .map_err(|_| NetError::BadSslClientAuthCert)?;
        builder
            .set_private_key(&key)
            .map_err(|_| NetError::BadSslClientAuthCert)?;
        builder
            .check_private_key()
            .map_err(|_| NetError::BadSslClientAuthCert)?;
        Ok(())
    }
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAuth")
            .field("certificate_len", &self.certificate.len())
            .field("has_intermediate", &self.intermediate.is_some())
            .finish_non_exhaustive()
    }
}
