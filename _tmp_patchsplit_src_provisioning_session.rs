//! `ProvisioningSession`: the scoped async RAII guard for a single DPS
//! registration (spec §4.5/§4.6/§9).
//!
//! Same Enter/Body/Exit shape as `IoTHubSession`, grounded on the same
//! `spotflow::ingress::base::BaseConnection` pattern, but simpler: DPS is a
//! single-shot register/poll exchange rather than a long-lived multiplexed
//! session, so there is no twin-response loop. A registration that takes
//! long enough to need a mid-flight credential refresh still gets one: the
//! same background refresh task `IoTHubSession` runs is started here too,
//! torn down once `register` returns either way.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProvisioningSessionConfig;
use crate::error::{CredentialError, ProvisioningServiceError, SessionError};
use crate::mqtt_client::{MqttClient, MqttClientOptions};
use crate::provisioning_client::{ProvisioningClient, RegistrationResult};
use crate::query::encode_pairs;
use crate::sastoken::{run_refresh_loop, InternalSasTokenGenerator, SasTokenGenerator, SasTokenProvider};
use crate::signing::{AnySigningMechanism, SymmetricKeySigningMechanism};

const MQTT_PORT: u16 = 8883;
const WEBSOCKETS_PORT: u16 = 443;
/// DPS registrations are short-lived; a 1 hour TTL comfortably outlives any
/// realistic assigning/unassigned poll sequence while still exercising the
/// same refresh machinery `IoTHubSession` uses.
const SAS_TOKEN_TTL: Duration = Duration::from_secs(3600);

fn build_username(id_scope: &str, registration_id: &str, product_info: Option<&str>) -> String {
    let path = format!("{id_scope}/registrations/{registration_id}");
    match product_info {
        Some(info) => format!("{path}/?{}", encode_pairs(&[("DeviceClientType", info)])),
        None => format!("{path}/?"),
    }
}

/// An open DPS connection, scoped to a single registration.
pub struct ProvisioningSession {
    client: ProvisioningClient,
    registration_id: String,
    cancellation: CancellationToken,
    refresh_task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl ProvisioningSession {
    /// **Enter**: build the signing chain, open the MQTT client, start the
    /// background refresh task if SAS auth is used (spec §4.6).
    pub async fn new(config: ProvisioningSessionConfig) -> Result<Self, SessionError> {
        let cancellation = CancellationToken::new();

        let resource_uri = format!("{}/registrations/{}", config.id_scope, config.registration_id);

        let (password, refresh_provider) = if let Some(key) = &config.shared_access_key {
            let signing = Arc::new(AnySigningMechanism::SymmetricKey(
                SymmetricKeySigningMechanism::new(key).map_err(CredentialError::Signing)?,
            ));
            let provider = Arc::new(SasTokenProvider::new(SasTokenGenerator::Internal(
                InternalSasTokenGenerator {
                    signing,
                    resource_uri,
                    ttl: SAS_TOKEN_TTL,
                    key_name: None,
                },
            )));
            let password = provider.current().await?;
            (password, Some(provider))
        } else if let Some(f) = &config.sastoken_fn {
            let provider = Arc::new(SasTokenProvider::new(SasTokenGenerator::External(f.clone())));
            let password = provider.current().await?;
            (password, Some(provider))
        } else if config.ssl_context.is_some() {
            (String::new(), None)
        } else {
            return Err(SessionError::Credential(CredentialError::ExternalGenerator(
                anyhow::anyhow!(
                    "one of `shared_access_key`, `sastoken_fn`, or `ssl_context` must be set"
                ),
            )));
        };

        let username = build_username(
            &config.id_scope,
            &config.registration_id,
            config.product_info.as_deref(),
        );

        let mqtt_options = MqttClientOptions {
            host: config.provisioning_host.clone(),
            port: if config.websockets { WEBSOCKETS_PORT } else { MQTT_PORT },
            client_id: config.registration_id.clone(),
            username,
            password,
            use_websockets: config.websockets,
            keepalive: config.keepalive,
            tls: config.ssl_context.clone(),
        };

        let mqtt = MqttClient::connect(mqtt_options.clone()).await?;
        let client = ProvisioningClient::new(mqtt.clone());

        let refresh_task = refresh_provider.map(|provider| {
            let reauthorize_mqtt = mqtt.clone();
            let reauthorize_options = mqtt_options.clone();
            let reauthorize: crate::sastoken::ReauthorizeFn = Arc::new(move |new_password: String| {
                let mqtt = reauthorize_mqtt.clone();
                let options = reauthorize_options.clone();
                Box::pin(async move { mqtt.reauthorize(&new_password, &options).await.map_err(Into::into) })
            });
            tokio::spawn(run_refresh_loop(provider, reauthorize, cancellation.clone()))
        });

        Ok(Self {
            client,
            registration_id: config.registration_id,
            cancellation,
            refresh_task,
        })
    }

    /// **Body**: register with DPS and poll until `assigned` or `failed`
    /// (spec §4.5). Consumes `self`: a session is scoped to one
    /// registration attempt.
    pub async fn register(self, payload: Option<Value>) -> Result<RegistrationResult, ProvisioningServiceError> {
        let result = self.client.register(&self.registration_id, payload).await;
        self.shutdown().await;
        result
    }

    /// **Exit**: stop the background refresh task and disconnect.
    async fn shutdown(mut self) {
        self.cancellation.cancel();
        if let Some(task) = self.refresh_task.take() {
            let _ = task.await;
        }
        self.client.mqtt().disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_without_product_info() {
        assert_eq!(
            build_username("0ne00000000", "reg-1", None),
            "0ne00000000/registrations/reg-1/?"
        );
    }

    #[test]
    fn username_with_product_info() {
        assert_eq!(
            build_username("0ne00000000", "reg-1", Some("my-sdk 1.0")),
            "0ne00000000/registrations/reg-1/?DeviceClientType=my-sdk%201.0"
        );
    }
}


