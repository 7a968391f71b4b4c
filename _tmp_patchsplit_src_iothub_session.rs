//! `IoTHubSession`: the scoped async RAII guard described in spec §4.6/§9.
//!
//! Grounded on `spotflow::ingress::base::BaseConnection`'s shape — own a
//! `CancellationToken`, spawn background tasks, join/cancel them on
//! teardown — adapted from that file's sync-runtime-owning facade (needed
//! there for C/Python FFI) to a plain `async fn` enter/exit pair, since
//! this crate has no FFI boundary to bridge.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::{ExternalSigningMechanism, IoTHubSessionConfig};
use crate::error::{CredentialError, IoTHubClientError, IoTHubError, MqttError, SessionError};
use crate::iothub_client::IoTHubClient;
use crate::mqtt_client::{IncomingStream, MqttClient, MqttClientOptions};
use crate::models::{DirectMethodRequest, DirectMethodResponse, Message};
use crate::sastoken::{run_refresh_loop, InternalSasTokenGenerator, SasTokenGenerator, SasTokenProvider};
use crate::signing::{AnySigningMechanism, SymmetricKeySigningMechanism};

const MQTT_PORT: u16 = 8883;
const WEBSOCKETS_PORT: u16 = 443;
const SAS_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// An open IoT Hub connection. Always tear it down with `shutdown` rather
/// than dropping it: dropping leaves the background refresh and
/// twin-response tasks running until the process exits (spec §4.6 "Exit").
pub struct IoTHubSession {
    client: IoTHubClient,
    cancellation: CancellationToken,
    refresh_task: Option<JoinHandle<anyhow::Result<()>>>,
    twin_task: Option<JoinHandle<Result<(), MqttError>>>,
}

impl IoTHubSession {
    /// **Enter**: build the signing chain, open the MQTT client, start the
    /// background refresh task if SAS auth is used (spec §4.6).
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

    /// `send_message`: publish telemetry (spec §4.4).
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

    pub async fn get_twin(&self) -> Result<Value, IoTHubError> {
        self.client.get_twin().await
    }

    pub async fn update_reported_properties(&self, patch: &Value) -> Result<Value, IoTHubError> {
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

    /// **Exit**: signal the refresh task to stop, disconnect the MQTT
    /// client, wait for both to finish, propagate any exception that
    /// caused the exit after cleanup completes (spec §4.6).
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


