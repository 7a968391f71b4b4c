//! Public error taxonomy.
//!
//! Each concern gets its own enum so callers can match on the kind of
//! failure relevant to the call they made, rather than on one giant enum
//! shared across every operation.

use thiserror::Error;

/// Failure parsing or validating a `HostName=...;...` connection string.
#[derive(Debug, Error)]
pub enum ConnectionStringParseError {
    #[error("connection string is empty")]
    Empty,
    #[error("malformed key-value pair `{0}`: missing `=`")]
    MissingEquals(String),
    #[error("duplicate key `{0}`")]
    DuplicateKey(String),
    #[error("unrecognized key `{0}`")]
    UnknownKey(String),
    #[error("connection string is missing required key `HostName`")]
    MissingHostName,
    #[error("connection string is missing required key `{0}`")]
    MissingRequiredKey(String),
    #[error("`x509=true` cannot be combined with `SharedAccessKey` or `SharedAccessSignature`")]
    MixedAuthenticationScheme,
}

/// Signing a payload failed (either locally or via the Edge HSM).
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("unable to base64-decode the shared access key")]
    InvalidKey(#[source] base64::DecodeError),
    #[error(transparent)]
    Edge(#[from] IoTEdgeError),
}

/// The IoT Edge HSM workload API returned something unusable.
#[derive(Debug, Error)]
pub enum IoTEdgeError {
    #[error("request to the IoT Edge workload API failed")]
    Transport(#[source] anyhow::Error),
    #[error("IoT Edge workload API returned status {0}")]
    Status(u16),
    #[error("unable to parse the IoT Edge workload API response")]
    InvalidResponse(#[source] anyhow::Error),
    #[error("IoT Edge workload API response is missing field `{0}`")]
    MissingField(&'static str),
}

/// A SAS token or other credential could not be built.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("the external `sastoken_fn` callback failed")]
    ExternalGenerator(#[source] anyhow::Error),
}

/// Building a caller-supplied TLS context from a certificate/key pair
/// failed.
#[derive(Debug, Error)]
pub enum TlsContextError {
    #[error("client certificate/key could not be loaded as a TLS identity")]
    InvalidIdentity(#[source] anyhow::Error),
    #[error("CA certificate could not be parsed")]
    InvalidCertificate(#[source] anyhow::Error),
    #[error("unable to build the TLS connector")]
    Build(#[source] anyhow::Error),
}

/// The MQTT CONNECT handshake failed.
#[derive(Debug, Error)]
pub enum MqttConnectionFailedError {
    #[error("TCP/TLS handshake failed")]
    Transport(#[source] anyhow::Error),
    #[error("broker rejected CONNECT with reason code {0:?}")]
    ConnackRejected(rumqttc::ConnectReturnCode),
}

/// An MQTT operation failed while the client believed it was connected.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("publish failed")]
    Publish(#[source] anyhow::Error),
    #[error("subscribe failed")]
    Subscribe(#[source] anyhow::Error),
    #[error("unsubscribe failed")]
    Unsubscribe(#[source] anyhow::Error),
    #[error(transparent)]
    ConnectionDropped(#[from] ConnectionDroppedError),
}

/// The socket was lost mid-operation; every outstanding awaiter completes
/// with this error rather than hanging or silently closing.
#[derive(Debug, Clone, Error)]
#[error("the MQTT connection was lost unexpectedly")]
pub struct ConnectionDroppedError {
    pub reason: std::sync::Arc<anyhow::Error>,
}

impl ConnectionDroppedError {
    pub fn new(reason: anyhow::Error) -> Self {
        Self {
            reason: std::sync::Arc::new(reason),
        }
    }
}

/// IoT Hub returned a non-2xx status for a method/twin request.
#[derive(Debug, Error)]
#[error("IoT Hub returned status {status}: {body}")]
pub struct IoTHubError {
    pub status: u32,
    pub body: serde_json::Value,
}

/// Failure of a twin GET/PATCH round trip.
#[derive(Debug, Error)]
pub enum TwinError {
    #[error(transparent)]
    IoTHub(#[from] IoTHubError),
    #[error(transparent)]
    Mqtt(MqttError),
    #[error(transparent)]
    ConnectionDropped(#[from] ConnectionDroppedError),
}

// Written by hand rather than `#[from]`: `MqttError` itself carries a
// `ConnectionDropped` variant, and a dropped connection should surface the
// same way here regardless of whether it happened on the initial publish or
// while awaiting the response — callers matching `TwinError::ConnectionDropped`
// shouldn't have to also match `TwinError::Mqtt` to catch the same event.
impl From<MqttError> for TwinError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::ConnectionDropped(reason) => TwinError::ConnectionDropped(reason),
            other => TwinError::Mqtt(other),
        }
    }
}

/// DPS returned a terminal `failed` status, or the registration otherwise
/// could not be completed.
#[derive(Debug, Error)]
pub enum ProvisioningServiceError {
    #[error("registration failed with status {status}: {body}")]
    Failed {
        status: String,
        body: serde_json::Value,
    },
    #[error(transparent)]
    ConnectionDropped(#[from] ConnectionDroppedError),
    #[error(transparent)]
    Mqtt(MqttError),
}

// Hand-written for the same reason as `TwinError`'s: `MqttError` already has
// a `ConnectionDropped` variant, so a derived `#[from]` would let a dropped
// connection surface as `Mqtt(MqttError::ConnectionDropped(_))` from
// `register`'s `subscribe`/`publish` calls while the identical event from
// `await_matching_response` produces `ConnectionDropped(_)` directly.
impl From<MqttError> for ProvisioningServiceError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::ConnectionDropped(reason) => ProvisioningServiceError::ConnectionDropped(reason),
            other => ProvisioningServiceError::Mqtt(other),
        }
    }
}

/// A local, non-service failure in the `IoTHubSession`/`ProvisioningSession`
/// lifecycle (e.g. the background credential refresh gave up).
#[derive(Debug, Error)]
pub enum IoTHubClientError {
    #[error("credential refresh failed and exhausted its retry budget")]
    RefreshExhausted(#[source] anyhow::Error),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    ConnectionFailed(#[from] MqttConnectionFailedError),
    #[error(transparent)]
    Mqtt(MqttError),
    #[error(transparent)]
    ConnectionDropped(#[from] ConnectionDroppedError),
    #[error(transparent)]
    IoTHub(#[from] IoTHubError),
}

// Written by hand for the same reason as `TwinError`'s and
// `ProvisioningServiceError`'s: `MqttError` carries its own
// `ConnectionDropped` variant, so a derived `#[from]` here would let a
// dropped connection surface as `Mqtt(MqttError::ConnectionDropped(_))`
// instead of this enum's own `ConnectionDropped` variant, depending on
// which call site converted it.
impl From<MqttError> for IoTHubClientError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::ConnectionDropped(reason) => IoTHubClientError::ConnectionDropped(reason),
            other => IoTHubClientError::Mqtt(other),
        }
    }
}

/// Failure entering or running an `IoTHubSession`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    ConnectionString(#[from] ConnectionStringParseError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Tls(#[from] TlsContextError),
    #[error(transparent)]
    ConnectionFailed(#[from] MqttConnectionFailedError),
    #[error(transparent)]
    Client(#[from] IoTHubClientError),
    #[error("IoT Edge environment variable lookup failed")]
    EdgeEnvironment(#[source] anyhow::Error),
}
