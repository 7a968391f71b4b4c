//! `IoTHubSession`: the scoped async guard over one IoT Hub MQTT
//! connection.
//!
//! Owns a `CancellationToken` and two background tasks (credential refresh,
//! twin-response dispatch), spawned on entry and torn down on exit. Prefer
//! calling `shutdown` explicitly: it disconnects cleanly and waits for both
//! tasks to finish, surfacing anything that went wrong along the way. The
//! `Drop` impl is a synchronous backstop for callers that forget to call it:
//! it aborts the background tasks and cancels the MQTT poll loop, but
//! doesn't wait for any of it to finish or send an MQTT DISCONNECT.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::{ExternalSigningMechanism, IoTHubSessionConfig};
use crate::error::{CredentialError, IoTHubClientError, MqttError, SessionError, TwinError};
use crate::iothub_client::IoTHubClient;
use crate::mqtt_client::{IncomingStream, MqttClient, MqttClientOptions};
use crate::models::{DirectMethodRequest, DirectMethodResponse, Message};
use crate::sastoken::{run_refresh_loop, InternalSasTokenGenerator, SasTokenGenerator, SasTokenProvider};
use crate::signing::{AnySigningMechanism, SymmetricKeySigningMechanism};

const MQTT_PORT: u16 = 8883;
const WEBSOCKETS_PORT: u16 = 443;
const SAS_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// An open IoT Hub connection.
pub struct IoTHubSession {
    client: IoTHubClient,
    cancellation: CancellationToken,
    refresh_task: Option<JoinHandle<anyhow::Result<()>>>,
    twin_task: Option<JoinHandle<Result<(), MqttError>>>,
}

impl IoTHubSession {
    /// Build the signing chain, open the MQTT client, and start the
    /// background refresh task if SAS auth is used.
    pub async fn new(mut config: IoTHubSessionConfig) -> Result<Self, SessionError> {
        let cancellation = CancellationToken::new();

        let resource_uri = match &config.module_id {
            Some(m) => format!("{}/devices/{}/modules/{}", config.hostname, config.device_id, m),
            None => format!("{}/devices/{}", config.hostname, config.device_id),
        };

        let (password, refresh_provider) = if let Some(key) = &config.shared_access_key {
            let signing = Arc::new(AnySigningMechanism::SymmetricKey(
                SymmetricKeySigningMechanism::new(key).map_err(CredentialError::Signing)?,
            ));
            let provider = Arc::new(SasTokenProvider::new(SasTokenGenerator::Internal(
                InternalSasTokenGenerator {
                    signing,
                    resource_uri,
                    ttl: SAS_TOKEN_TTL,
                    key_name: config.shared_access_key_name.clone(),
                },
            )));
            let password = provider.current().await?;
            (password, Some(provider))
        } else if let Some(ExternalSigningMechanism::EdgeHsm(edge)) = config.external_signing.take() {
            let signing = Arc::new(AnySigningMechanism::EdgeHsm(edge));
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
                    "one of `shared_access_key`, `external_signing`, `sastoken_fn`, or `ssl_context` must be set"
                ),
            )));
        };

        let username = crate::user_agent::build_username(
            &config.hostname,
            &config.device_id,
            config.module_id.as_deref(),
            &config.api_version,
            config.product_info.as_deref(),
        );

        let client_id = match &config.module_id {
            Some(m) => format!("{}/{}", config.device_id, m),
            None => config.device_id.clone(),
        };

        let mqtt_options = MqttClientOptions {
            host: config.hostname.clone(),
            port: if config.websockets { WEBSOCKETS_PORT } else { MQTT_PORT },
            client_id,
            username,
            password,
            use_websockets: config.websockets,
            keepalive: config.keepalive,
            tls: config.ssl_context.clone(),
        };

        let mqtt = MqttClient::connect(mqtt_options.clone()).await?;
        let client = IoTHubClient::new(mqtt.clone(), config.device_id.clone(), config.module_id.clone());

        let twin_task = tokio::spawn(IoTHubClient::run_twin_response_loop(
            mqtt.clone(),
            client.twin_requests(),
        ));

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
            cancellation,
            refresh_task,
            twin_task: Some(twin_task),
        })
    }

    /// Publish telemetry.
    pub async fn send_message(&self, payload: Vec<u8>, properties: &[(&str, &str)]) -> Result<(), MqttError> {
        self.client.send_message(payload, properties).await
    }

    /// Subscribe to cloud-to-device messages.
    pub async fn messages(
        &self,
    ) -> Result<impl tokio_stream::Stream<Item = Result<Message, crate::error::ConnectionDroppedError>>, MqttError> {
        self.client.messages().await
    }

    /// Subscribe to Direct Method invocations.
    pub async fn direct_method_requests(
        &self,
    ) -> Result<
        impl tokio_stream::Stream<Item = Result<DirectMethodRequest, crate::error::ConnectionDroppedError>>,
        MqttError,
    > {
        self.client.direct_method_requests().await
    }

    pub async fn respond_to_direct_method(&self, response: &DirectMethodResponse) -> Result<(), MqttError> {
        self.client.respond_to_direct_method(response).await
    }

    pub async fn get_twin(&self) -> Result<Value, TwinError> {
        self.client.get_twin().await
    }

    pub async fn update_reported_properties(&self, patch: &Value) -> Result<Value, TwinError> {
        self.client.update_reported_properties(patch).await
    }

    /// Subscribe to desired-property updates, delivered as raw JSON
    /// patches in receive order.
    pub async fn desired_property_updates(
        &self,
    ) -> Result<impl tokio_stream::Stream<Item = Result<Value, crate::error::ConnectionDroppedError>>, MqttError> {
        let stream: IncomingStream = self
            .client
            .mqtt()
            .subscribe(crate::topics::TWIN_DESIRED_FILTER, QoS::AtLeastOnce)
            .await?;
        Ok(stream.map(|item| item.map(|m| serde_json::from_slice(&m.payload).unwrap_or(Value::Null))))
    }

    /// Signal the refresh task to stop, disconnect the MQTT client, wait
    /// for both background tasks to finish, and propagate a credential
    /// refresh failure if that's what caused the session to end.
    pub async fn shutdown(mut self) -> Result<(), IoTHubClientError> {
        self.cancellation.cancel();

        let refresh_result = match self.refresh_task.take() {
            Some(task) => task.await.ok(),
            None => None,
        };

        self.client.mqtt().disconnect().await;

        if let Some(task) = self.twin_task.take() {
            let _ = task.await;
        }

        if let Some(Err(e)) = refresh_result {
            return Err(IoTHubClientError::RefreshExhausted(e));
        }
        Ok(())
    }
}

impl Drop for IoTHubSession {
    /// Best-effort cleanup for callers that drop a session without calling
    /// `shutdown`: stop the background tasks and the MQTT poll loop so
    /// nothing keeps running against a connection nobody holds a handle to
    /// anymore. This does not wait for any of it to finish or send an MQTT
    /// DISCONNECT; call `shutdown` for that.
    fn drop(&mut self) {
        self.cancellation.cancel();
        self.client.mqtt().cancel();
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        if let Some(task) = self.twin_task.take() {
            task.abort();
        }
    }
}
