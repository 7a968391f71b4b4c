//! DPS register + poll-until-terminal (spec §4.5).
//!
//! The try/wait/retry loop shape (try, get told to wait N seconds, retry,
//! stop on terminal outcome) is grounded on
//! `spotflow::iothub::token_handler::TokenHandler`'s registration retry
//! loop; the explicit status-to-outcome mapping follows
//! `spotflow::cloud::dps::{InitProvisioningError, CompletionError}`, adapted
//! from Spotflow's own DRS vocabulary to DPS's
//! `assigning`/`unassigned`/`assigned`/`failed` status vocabulary.

use std::time::Duration;

use rumqttc::QoS;
use serde_json::Value;
use tokio_stream::StreamExt;

use crate::error::{MqttError, ProvisioningServiceError};
use crate::mqtt_client::{IncomingStream, MqttClient};
use crate::query;
use crate::topics;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The device's assignment once DPS reaches a terminal `assigned` status.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    pub status: String,
    pub registration_state: Value,
}

struct DpsResponse {
    status: String,
    body: Value,
    retry_after: Option<Duration>,
}

/// Single-shot register/poll client over an already-connected
/// `MqttClient` (spec §4.5).
pub struct ProvisioningClient {
    mqtt: MqttClient,
}

impl ProvisioningClient {
    pub fn new(mqtt: MqttClient) -> Self {
        Self { mqtt }
    }

    pub fn mqtt(&self) -> &MqttClient {
        &self.mqtt
    }

    /// `register(payload?)`: connect, subscribe, send registration, then
    /// poll while `status` is `assigning`/`unassigned`, honoring
    /// `retry-after`. Returns on `assigned`; raises `ProvisioningServiceError`
    /// on `failed`.
    pub async fn register(
        &self,
        registration_id: &str,
        payload: Option<Value>,
    ) -> Result<RegistrationResult, ProvisioningServiceError> {
        let mut stream = self
            .mqtt
            .subscribe(topics::DPS_RESPONSE_FILTER, QoS::AtLeastOnce)
            .await?;

        let rid = uuid::Uuid::new_v4().to_string();
        let body = serde_json::json!({
            "registrationId": registration_id,
            "payload": payload,
        });
        let register_topic = topics::dps_register_topic(&rid);
        self.mqtt
            .publish(&register_topic, serde_json::to_vec(&body).unwrap(), QoS::AtMostOnce)
            .await?;

        let response = self.await_matching_response(&mut stream, &rid).await?;
        self.drive_to_terminal(&mut stream, registration_id, response).await
    }

    async fn drive_to_terminal(
        &self,
        stream: &mut IncomingStream,
        registration_id: &str,
        mut response: DpsResponse,
    ) -> Result<RegistrationResult, ProvisioningServiceError> {
        loop {
            match response.status.as_str() {
                "assigned" => {
                    return Ok(RegistrationResult {
                        status: response.status,
                        registration_state: response.body,
                    });
                }
                "failed" => {
                    return Err(ProvisioningServiceError::Failed {
                        status: response.status,
                        body: response.body,
                    });
                }
                "assigning" | "unassigned" => {
                    let interval = response.retry_after.unwrap_or(DEFAULT_POLL_INTERVAL);
                    tokio::time::sleep(interval).await;

                    let operation_id = response
                        .body
                        .get("operationId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();

                    let rid = uuid::Uuid::new_v4().to_string();
                    let poll_topic = topics::dps_poll_topic(&rid, &operation_id);
                    self.mqtt.publish(&poll_topic, Vec::new(), QoS::AtMostOnce).await?;

                    response = self.await_matching_response(stream, &rid).await?;
                }
                other => {
                    log::warn!("unrecognized DPS status `{other}` for registration `{registration_id}`");
                    return Err(ProvisioningServiceError::Failed {
                        status: other.to_string(),
                        body: response.body,
                    });
                }
            }
        }
    }

    async fn await_matching_response(
        &self,
        stream: &mut IncomingStream,
        rid: &str,
    ) -> Result<DpsResponse, ProvisioningServiceError> {
        while let Some(item) = stream.next().await {
            match item {
                Ok(message) => {
                    let Some((status, query_str)) = topics::parse_dps_response(&message.topic) else {
                        continue;
                    };
                    let query = query::parse(query_str).unwrap_or_default();
                    let Some(response_rid) = query.get("$rid").cloned().flatten() else {
                        continue;
                    };
                    if response_rid != rid {
                        continue;
                    }
                    let body: Value = serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
                    let retry_after = query
                        .get("retry-after")
                        .cloned()
                        .flatten()
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    return Ok(DpsResponse {
                        status: status.to_string(),
                        body,
                        retry_after,
                    });
                }
                Err(reason) => return Err(ProvisioningServiceError::ConnectionDropped(reason)),
            }
        }
        Err(ProvisioningServiceError::Mqtt(MqttError::Publish(anyhow::anyhow!(
            "response stream ended before a matching response arrived"
        ))))
    }
}


