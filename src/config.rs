//! Session configuration: the recognized option set for
//! `IoTHubSession`/`ProvisioningSession`, plus IoT Edge environment
//! loading.
//!
//! The fluent `with_*` setters build a flat, directly-constructible struct
//! rather than a builder with a terminal `build()` — the session guards
//! take the config value itself rather than a builder product.

use std::time::Duration;

use crate::connection_string::ConnectionString;
use crate::edge_hsm::EdgeHsmSigningMechanism;
use crate::error::{ConnectionStringParseError, SessionError};
use crate::tls_context::TlsContext;

/// A signing mechanism a caller built out-of-band (currently only the Edge
/// HSM workload API), consumed by `IoTHubSession::new` alongside
/// `shared_access_key`/`sastoken_fn`/`ssl_context`.
pub enum ExternalSigningMechanism {
    EdgeHsm(EdgeHsmSigningMechanism),
}

const DEFAULT_KEEPALIVE_SECS: u64 = 60;
/// IoT Hub's MQTT username `api-version`, pinned in configuration so a
/// newer service version can be adopted without a code change.
pub const DEFAULT_API_VERSION: &str = "2021-04-12";

/// A user-supplied async callback returning a ready-to-use SAS token
/// string; disables internal signing.
pub type SasTokenFn = crate::sastoken::ExternalSasTokenFn;

/// Proxy configuration for the MQTT transport. Carried as an opaque URL;
/// `rumqttc`'s WebSocket transport consumes this via its HTTP client when
/// `websockets` is set.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub url: String,
}

/// Configuration for `IoTHubSession::new`.
pub struct IoTHubSessionConfig {
    pub hostname: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub ssl_context: Option<TlsContext>,
    pub shared_access_key: Option<String>,
    pub shared_access_key_name: Option<String>,
    pub sastoken_fn: Option<SasTokenFn>,
    pub external_signing: Option<ExternalSigningMechanism>,
    pub websockets: bool,
    pub keepalive: Duration,
    pub product_info: Option<String>,
    pub proxy_options: Option<ProxyOptions>,
    pub api_version: String,
}

impl IoTHubSessionConfig {
    pub fn new(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            module_id: None,
            ssl_context: None,
            shared_access_key: None,
            shared_access_key_name: None,
            sastoken_fn: None,
            external_signing: None,
            websockets: false,
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            product_info: None,
            proxy_options: None,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    /// Build a config wired to sign via the Edge HSM workload API, read from
    /// the `IOTEDGE_*` environment variables a module sees when running
    /// inside IoT Edge.
    pub fn from_iot_edge_environment() -> Result<Self, SessionError> {
        use std::env::var;

        let hostname = var("IOTEDGE_GATEWAYHOSTNAME")
            .or_else(|_| var("IOTEDGE_IOTHUBHOSTNAME"))
            .map_err(|e| SessionError::EdgeEnvironment(e.into()))?;
        let device_id =
            var("IOTEDGE_DEVICEID").map_err(|e| SessionError::EdgeEnvironment(e.into()))?;
        let module_id =
            var("IOTEDGE_MODULEID").map_err(|e| SessionError::EdgeEnvironment(e.into()))?;

        let signing = EdgeHsmSigningMechanism::from_environment()
            .map_err(SessionError::EdgeEnvironment)?;

        Ok(Self::new(hostname, device_id)
            .with_module_id(module_id)
            .with_external_signing(ExternalSigningMechanism::EdgeHsm(signing)))
    }

    /// Parse a device (or module) connection string into a config. The
    /// `GatewayHostName` key, when present, overrides `HostName` as the
    /// broker to connect to (IoT Edge downstream device pattern).
    pub fn from_connection_string(s: &str) -> Result<Self, ConnectionStringParseError> {
        let cs = ConnectionString::parse(s)?;

        let hostname = cs
            .get("GatewayHostName")
            .or_else(|| cs.get("HostName"))
            .expect("parse() guarantees HostName is present")
            .to_string();
        let device_id = cs.get_or_error("DeviceId")?.to_string();

        let mut config = Self::new(hostname, device_id);
        config.module_id = cs.get("ModuleId").map(str::to_string);
        config.shared_access_key = cs.get("SharedAccessKey").map(str::to_string);
        config.shared_access_key_name = cs.get("SharedAccessKeyName").map(str::to_string);
        Ok(config)
    }

    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_ssl_context(mut self, ssl_context: TlsContext) -> Self {
        self.ssl_context = Some(ssl_context);
        self
    }

    pub fn with_shared_access_key(mut self, key: impl Into<String>) -> Self {
        self.shared_access_key = Some(key.into());
        self
    }

    pub fn with_sastoken_fn(mut self, f: SasTokenFn) -> Self {
        self.sastoken_fn = Some(f);
        self
    }

    pub fn with_external_signing(mut self, signing: ExternalSigningMechanism) -> Self {
        self.external_signing = Some(signing);
        self
    }

    pub fn with_websockets(mut self, websockets: bool) -> Self {
        self.websockets = websockets;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_product_info(mut self, product_info: impl Into<String>) -> Self {
        self.product_info = Some(product_info.into());
        self
    }

    pub fn with_proxy_options(mut self, proxy_options: ProxyOptions) -> Self {
        self.proxy_options = Some(proxy_options);
        self
    }
}

/// Configuration for `ProvisioningSession::new`: substitutes
/// `provisioning_host`/`registration_id`/`id_scope` for the IoT Hub
/// variant's `hostname`/`device_id`.
pub struct ProvisioningSessionConfig {
    pub provisioning_host: String,
    pub registration_id: String,
    pub id_scope: String,
    pub ssl_context: Option<TlsContext>,
    pub shared_access_key: Option<String>,
    pub sastoken_fn: Option<SasTokenFn>,
    pub websockets: bool,
    pub keepalive: Duration,
    pub product_info: Option<String>,
    pub proxy_options: Option<ProxyOptions>,
}

impl ProvisioningSessionConfig {
    pub fn new(
        provisioning_host: impl Into<String>,
        registration_id: impl Into<String>,
        id_scope: impl Into<String>,
    ) -> Self {
        Self {
            provisioning_host: provisioning_host.into(),
            registration_id: registration_id.into(),
            id_scope: id_scope.into(),
            ssl_context: None,
            shared_access_key: None,
            sastoken_fn: None,
            websockets: false,
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            product_info: None,
            proxy_options: None,
        }
    }

    pub fn with_ssl_context(mut self, ssl_context: TlsContext) -> Self {
        self.ssl_context = Some(ssl_context);
        self
    }

    pub fn with_shared_access_key(mut self, key: impl Into<String>) -> Self {
        self.shared_access_key = Some(key.into());
        self
    }

    pub fn with_sastoken_fn(mut self, f: SasTokenFn) -> Self {
        self.sastoken_fn = Some(f);
        self
    }

    pub fn with_websockets(mut self, websockets: bool) -> Self {
        self.websockets = websockets;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_product_info(mut self, product_info: impl Into<String>) -> Self {
        self.product_info = Some(product_info.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_config_from_connection_string() {
        let cs = "HostName=my.host.name;DeviceId=dev1;SharedAccessKey=Zm9vYmFy";
        let config = IoTHubSessionConfig::from_connection_string(cs).unwrap();
        assert_eq!(config.hostname, "my.host.name");
        assert_eq!(config.device_id, "dev1");
        assert_eq!(config.shared_access_key.as_deref(), Some("Zm9vYmFy"));
        assert_eq!(config.api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn gateway_hostname_overrides_hostname() {
        let cs = "HostName=hub.example;DeviceId=dev1;GatewayHostName=edge.local;SharedAccessKey=Zm9vYmFy";
        let config = IoTHubSessionConfig::from_connection_string(cs).unwrap();
        assert_eq!(config.hostname, "edge.local");
    }

    #[test]
    fn fluent_setters_compose() {
        let config = IoTHubSessionConfig::new("h", "d")
            .with_module_id("m")
            .with_websockets(true)
            .with_keepalive(Duration::from_secs(30));
        assert_eq!(config.module_id.as_deref(), Some("m"));
        assert!(config.websockets);
        assert_eq!(config.keepalive, Duration::from_secs(30));
    }
}
