//! Caller-supplied TLS context for X.509 client-certificate auth.
//!
//! Builds a `native_tls::TlsConnector` with a PKCS#8 client identity, handed
//! to `rumqttc` as `Transport::Tls(TlsConfiguration::NativeConnector(_))`.

use crate::error::TlsContextError;

/// Wraps a pre-built `native_tls::TlsConnector`. Constructed either from a
/// PEM client certificate/key pair (X.509 device auth) or supplied by the
/// caller directly for full control over trust roots and protocol version.
#[derive(Clone)]
pub struct TlsContext {
    pub(crate) connector: native_tls::TlsConnector,
}

impl TlsContext {
    /// Build a connector presenting `cert_pem`+`key_pem` as the client
    /// identity, trusting the platform's native root store plus `ca_pem`
    /// if supplied.
    pub fn with_client_certificate(
        cert_pem: &[u8],
        key_pem: &[u8],
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, TlsContextError> {
        let identity = native_tls::Identity::from_pkcs8(cert_pem, key_pem)
            .map_err(|e| TlsContextError::InvalidIdentity(e.into()))?;

        let mut builder = native_tls::TlsConnector::builder();
        builder.identity(identity);
        if let Some(ca) = ca_pem {
            let ca_cert = native_tls::Certificate::from_pem(ca)
                .map_err(|e| TlsContextError::InvalidCertificate(e.into()))?;
            builder.add_root_certificate(ca_cert);
        }

        let connector = builder
            .build()
            .map_err(|e| TlsContextError::Build(e.into()))?;
        Ok(Self { connector })
    }

    /// Wrap an already-configured connector, for callers who need trust
    /// roots or protocol pinning this module doesn't expose.
    pub fn from_connector(connector: native_tls::TlsConnector) -> Self {
        Self { connector }
    }
}
