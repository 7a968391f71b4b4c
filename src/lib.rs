//! Device-side client core for Azure IoT Hub and the Device Provisioning
//! Service.
//!
//! [`IoTHubSession`] and [`ProvisioningSession`] are the two entry points:
//! construct a [`config::IoTHubSessionConfig`] or
//! [`config::ProvisioningSessionConfig`], enter a session, and use the
//! methods on it for the lifetime of the connection.

mod config;
mod connection_string;
mod edge_hsm;
mod error;
mod iothub_client;
mod iothub_session;
mod models;
mod mqtt_client;
mod pending_requests;
mod provisioning_client;
mod provisioning_session;
mod query;
mod sastoken;
mod signing;
mod tls_context;
mod topics;
mod user_agent;

pub use config::{
    ExternalSigningMechanism, IoTHubSessionConfig, ProvisioningSessionConfig, ProxyOptions,
    SasTokenFn, DEFAULT_API_VERSION,
};
pub use connection_string::ConnectionString;
pub use edge_hsm::EdgeHsmSigningMechanism;
pub use error::{
    ConnectionDroppedError, ConnectionStringParseError, CredentialError, IoTEdgeError,
    IoTHubClientError, IoTHubError, MqttConnectionFailedError, MqttError, ProvisioningServiceError,
    SessionError, SigningError, TlsContextError, TwinError,
};
pub use iothub_session::IoTHubSession;
pub use models::{DirectMethodRequest, DirectMethodResponse, Message};
pub use provisioning_client::RegistrationResult;
pub use provisioning_session::ProvisioningSession;
pub use sastoken::SasToken;
pub use tls_context::TlsContext;
