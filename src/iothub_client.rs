//! Topic layout, request/response correlation, method/twin encoding.
//!
//! Direct-method topic parsing splits on the rightmost `/` before the query
//! string, since method names may themselves contain `/`. Twin requests are
//! correlated by `rid` through the shared `PendingRequests` table, the same
//! table DPS registration correlation uses.

use rumqttc::QoS;
use serde_json::Value;
use tokio_stream::StreamExt;

use crate::error::{ConnectionDroppedError, IoTHubError, MqttError, TwinError};
use crate::mqtt_client::MqttClient;
use crate::models::{DirectMethodRequest, DirectMethodResponse, Message};
use crate::pending_requests::{PendingRequests, PendingResponse, RequestOutcome};
use crate::query;
use crate::topics;

type TwinOutcome = Result<Value, TwinError>;

/// IoT Hub's device-facing protocol surface over an already-connected
/// `MqttClient`.
pub struct IoTHubClient {
    mqtt: MqttClient,
    device_id: String,
    module_id: Option<String>,
    twin_requests: PendingRequests<TwinOutcome>,
}

impl IoTHubClient {
    pub fn new(mqtt: MqttClient, device_id: String, module_id: Option<String>) -> Self {
        Self {
            mqtt,
            device_id,
            module_id,
            twin_requests: PendingRequests::new(),
        }
    }

    /// `send_message`: publish to `devices/<device_id>/messages/events/`
    /// (or the module variant) with properties URL-encoded into the topic
    /// suffix; QoS 1; returns on PUBACK.
    pub async fn send_message(
        &self,
        payload: Vec<u8>,
        properties: &[(&str, &str)],
    ) -> Result<(), MqttError> {
        let suffix = query::encode_pairs(properties);
        let topic = topics::telemetry_topic(&self.device_id, self.module_id.as_deref(), &suffix);
        self.mqtt.publish(&topic, payload, QoS::AtLeastOnce).await
    }

    /// Subscribe to C2D messages; the returned stream yields decoded
    /// `Message`s in receive order and closes with a connection-dropped
    /// error, never silently.
    pub async fn messages(
        &self,
    ) -> Result<
        impl tokio_stream::Stream<Item = Result<Message, crate::error::ConnectionDroppedError>>,
        MqttError,
    > {
        let device_id = self.device_id.clone();
        let module_id = self.module_id.clone();
        let filter = topics::c2d_filter(&device_id, module_id.as_deref());
        let stream = self.mqtt.subscribe(&filter, QoS::AtLeastOnce).await?;
        Ok(stream.map(move |item| {
            item.map(|m| match topics::parse_c2d_message(&m.topic, &device_id, module_id.as_deref()) {
                Some(suffix) => decode_c2d_message(suffix, m.payload),
                None => {
                    log::warn!("ignoring C2D message on unexpected topic {:?}", m.topic);
                    Message::new(m.payload)
                }
            })
        }))
    }

    /// Subscribe to Direct Method invocations.
    pub async fn direct_method_requests(
        &self,
    ) -> Result<
        impl tokio_stream::Stream<Item = Result<DirectMethodRequest, crate::error::ConnectionDroppedError>>,
        MqttError,
    > {
        let stream = self
            .mqtt
            .subscribe(topics::METHODS_FILTER, QoS::AtLeastOnce)
            .await?;
        Ok(stream.filter_map(|item| match item {
            Ok(message) => match topics::parse_method_request(&message.topic) {
                Some((name, query_str)) => {
                    let rid = match query::parse(query_str).ok().and_then(|q| q.get("$rid").cloned().flatten()) {
                        Some(rid) => rid,
                        None => {
                            log::warn!("direct method request on `{}` is missing `$rid`", message.topic);
                            return None;
                        }
                    };
                    let payload: Value = serde_json::from_slice(&message.payload).unwrap_or(Value::Null);
                    Some(Ok(DirectMethodRequest {
                        request_id: rid,
                        name: name.to_string(),
                        payload,
                    }))
                }
                None => {
                    log::warn!("ignoring message on unexpected topic {:?}", message.topic);
                    None
                }
            },
            Err(e) => Some(Err(e)),
        }))
    }

    /// Publish the reply to an incoming `DirectMethodRequest`. `rid` must
    /// echo the incoming value.
    pub async fn respond_to_direct_method(
        &self,
        response: &DirectMethodResponse,
    ) -> Result<(), MqttError> {
        let topic = topics::method_response_topic(response.status, &response.request_id);
        self.mqtt
            .publish(&topic, response.payload_bytes(), QoS::AtMostOnce)
            .await
    }

    /// `$iothub/twin/GET/?$rid=<rid>`, awaiting the correlated response.
    /// `run_twin_response_loop` must already be running against the same
    /// `MqttClient` for responses to have somewhere to land.
    pub async fn get_twin(&self) -> Result<Value, TwinError> {
        let (rid, rx) = self.twin_requests.register();
        let topic = topics::twin_get_topic(&rid);

        // `rx`'s Drop removes the `rid` entry if we return here without
        // awaiting it, so there's nothing to clean up by hand on this path.
        self.mqtt.publish(&topic, Vec::new(), QoS::AtMostOnce).await?;

        await_twin_response(rx).await
    }

    /// `$iothub/twin/PATCH/properties/reported/?$rid=<rid>`, awaiting the
    /// correlated response.
    pub async fn update_reported_properties(&self, patch: &Value) -> Result<Value, TwinError> {
        let (rid, rx) = self.twin_requests.register();
        let topic = topics::twin_patch_reported_topic(&rid, None);
        let payload = serde_json::to_vec(patch).expect("JSON value always serializes");

        self.mqtt.publish(&topic, payload, QoS::AtMostOnce).await?;

        await_twin_response(rx).await
    }

    /// Drive the twin-response dispatch loop: reads from the filter stream
    /// opened by `subscribe_twin_responses` and completes pending
    /// correlation entries. Intended to be `tokio::spawn`ed by the owning
    /// session for the lifetime of the connection.
    pub async fn run_twin_response_loop(
        mqtt: MqttClient,
        requests: PendingRequests<TwinOutcome>,
    ) -> Result<(), MqttError> {
        let mut stream = mqtt.subscribe(topics::TWIN_RESPONSE_FILTER, QoS::AtLeastOnce).await?;
        while let Some(item) = stream.next().await {
            match item {
                Ok(message) => {
                    let Some((status, query_str)) = topics::parse_twin_response(&message.topic) else {
                        log::warn!("ignoring message on unexpected topic {:?}", message.topic);
                        continue;
                    };
                    let Some(rid) = query::parse(query_str).ok().and_then(|q| q.get("$rid").cloned().flatten()) else {
                        log::warn!("twin response on `{}` is missing `$rid`", message.topic);
                        continue;
                    };
                    let status_code: u32 = status.parse().unwrap_or(0);
                    let outcome: TwinOutcome =
                        decode_twin_status(status_code, &message.payload).map_err(TwinError::from);
                    requests.complete(&rid, RequestOutcome::Response(outcome));
                }
                Err(reason) => {
                    requests.fail_all(reason);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Expose the pending-request table so the session can spawn
    /// `run_twin_response_loop` and the fail-on-drop path against the same
    /// table the synchronous calls above register into.
    pub fn twin_requests(&self) -> PendingRequests<TwinOutcome> {
        self.twin_requests.clone()
    }

    pub fn mqtt(&self) -> &MqttClient {
        &self.mqtt
    }
}

/// Await a twin request's correlated response, surfacing a dropped
/// connection as `TwinError::ConnectionDropped` rather than folding it into
/// an `IoTHubError` with a made-up status.
async fn await_twin_response(rx: PendingResponse<TwinOutcome>) -> Result<Value, TwinError> {
    match rx.await {
        Ok(RequestOutcome::Response(result)) => result,
        Ok(RequestOutcome::ConnectionDropped(reason)) => Err(TwinError::ConnectionDropped(reason)),
        Err(_) => Err(TwinError::ConnectionDropped(ConnectionDroppedError::new(
            anyhow::anyhow!("twin response channel closed before a response arrived"),
        ))),
    }
}

/// Split a C2D topic's URL-encoded property suffix into a `Message`: the
/// `$.mid`/`$.cid`/`$.ct`/`$.ce` system properties IoT Hub reserves land in
/// their named fields, everything else is an application property.
fn decode_c2d_message(suffix: &str, payload: Vec<u8>) -> Message {
    let mut message = Message::new(payload);
    let Ok(props) = query::parse(suffix) else {
        return message;
    };
    for (key, value) in props {
        let Some(value) = value else { continue };
        match key.as_str() {
            "$.mid" => message.message_id = Some(value),
            "$.cid" => message.correlation_id = Some(value),
            "$.ct" => message.content_type = Some(value),
            "$.ce" => message.content_encoding = Some(value),
            _ => {
                message.custom_properties.insert(key, value);
            }
        }
    }
    message
}

fn decode_twin_status(status: u32, body: &[u8]) -> Result<Value, IoTHubError> {
    if (200..300).contains(&status) {
        if body.is_empty() {
            Ok(Value::Object(Default::default()))
        } else {
            Ok(serde_json::from_slice(body).unwrap_or(Value::Null))
        }
    } else {
        Err(IoTHubError {
            status,
            body: serde_json::from_slice(body).unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_success_status_with_empty_body() {
        let result = decode_twin_status(204, b"");
        assert_eq!(result.unwrap(), Value::Object(Default::default()));
    }

    #[test]
    fn decodes_error_status_with_body() {
        let result = decode_twin_status(400, br#"{"Message":"bad"}"#);
        let err = result.unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.body["Message"], "bad");
    }

    #[test]
    fn decodes_c2d_system_and_custom_properties() {
        let message = decode_c2d_message("%24.mid=m1&%24.ct=application%2Fjson&foo=bar", b"hi".to_vec());
        assert_eq!(message.payload, b"hi");
        assert_eq!(message.message_id.as_deref(), Some("m1"));
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(message.custom_properties.get("foo").map(String::as_str), Some("bar"));
    }

    #[test]
    fn decodes_c2d_message_with_no_properties() {
        let message = decode_c2d_message("", b"hi".to_vec());
        assert_eq!(message.payload, b"hi");
        assert!(message.message_id.is_none());
        assert!(message.custom_properties.is_empty());
    }

    #[tokio::test]
    async fn await_twin_response_surfaces_connection_dropped_typed() {
        let table: PendingRequests<TwinOutcome> = PendingRequests::new();
        let (rid, rx) = table.register();
        let reason = ConnectionDroppedError::new(anyhow::anyhow!("socket closed"));
        table.complete(&rid, RequestOutcome::ConnectionDropped(reason));

        let result = await_twin_response(rx).await;
        assert!(matches!(result, Err(TwinError::ConnectionDropped(_))));
    }

    #[tokio::test]
    async fn await_twin_response_surfaces_connection_dropped_on_closed_channel() {
        let table: PendingRequests<TwinOutcome> = PendingRequests::new();
        let (_rid, rx) = table.register();
        drop(table);

        let result = await_twin_response(rx).await;
        assert!(matches!(result, Err(TwinError::ConnectionDropped(_))));
    }

    #[tokio::test]
    async fn dropping_pending_response_before_completion_removes_table_entry() {
        let table: PendingRequests<TwinOutcome> = PendingRequests::new();
        let (rid, rx) = table.register();
        drop(rx);
        // The entry is gone; completing it now is a silent no-op, not a panic.
        table.complete(&rid, RequestOutcome::Response(Ok(Value::Null)));
    }
}
