//! DPS register + poll-until-terminal.
//!
//! Try, get told to wait N seconds, retry, stop on a terminal outcome. The
//! topic's `<status>` segment is just the HTTP status of the response
//! (`202` while the operation is still running, `200` once IoT Hub hands
//! back a final answer); the registration lifecycle itself
//! (`assigning`/`unassigned`/`assigned`/`failed`) lives in the JSON body
//! alongside `operationId`/`registrationState`, so that's what drives the
//! poll loop.

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
    /// The topic's `<status>` segment: an HTTP status code, e.g. `202`/`200`.
    http_status: String,
    body: Value,
    retry_after: Option<Duration>,
}

impl DpsResponse {
    /// The registration lifecycle status from the JSON body, e.g.
    /// `assigning`/`unassigned`/`assigned`/`failed`.
    fn lifecycle_status(&self) -> &str {
        self.body.get("status").and_then(|v| v.as_str()).unwrap_or("")
    }
}

/// Single-shot register/poll client over an already-connected `MqttClient`.
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

    /// Subscribe, send the registration request, then poll while the body's
    /// `status` is `assigning`/`unassigned`, honoring `retry-after`. Returns
    /// on `assigned`; fails with `ProvisioningServiceError::Failed` on
    /// `failed` or an unrecognized status.
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
            match response.lifecycle_status() {
                "assigned" => {
                    let status = response.lifecycle_status().to_string();
                    let registration_state = response
                        .body
                        .get("registrationState")
                        .cloned()
                        .unwrap_or(Value::Null);
                    return Ok(RegistrationResult {
                        status,
                        registration_state,
                    });
                }
                "failed" => {
                    return Err(ProvisioningServiceError::Failed {
                        status: response.lifecycle_status().to_string(),
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
                    log::warn!(
                        "unrecognized DPS status `{other}` (http {}) for registration `{registration_id}`",
                        response.http_status
                    );
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
                    let Some((http_status, query_str)) = topics::parse_dps_response(&message.topic) else {
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
                        http_status: http_status.to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_status_reads_the_body_not_the_topic_code() {
        let response = DpsResponse {
            http_status: "202".to_string(),
            body: serde_json::json!({"operationId": "op1", "status": "assigning"}),
            retry_after: None,
        };
        assert_eq!(response.lifecycle_status(), "assigning");
    }

    #[test]
    fn lifecycle_status_is_empty_when_the_body_has_none() {
        let response = DpsResponse {
            http_status: "200".to_string(),
            body: Value::Null,
            retry_after: None,
        };
        assert_eq!(response.lifecycle_status(), "");
    }
}
