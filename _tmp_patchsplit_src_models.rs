//! Boundary payload types (spec §1: "model dataclasses... specified only
//! as boundary payloads").

use std::collections::HashMap;

use serde_json::Value;

/// A cloud-to-device or device-to-cloud message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub custom_properties: HashMap<String, String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            custom_properties: HashMap::new(),
            message_id: None,
            correlation_id: None,
            content_type: None,
            content_encoding: None,
        }
    }
}

/// An incoming Direct Method invocation from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectMethodRequest {
    pub request_id: String,
    pub name: String,
    pub payload: Value,
}

/// The device's reply to a `DirectMethodRequest`.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectMethodResponse {
    pub request_id: String,
    pub status: u32,
    /// `None` is serialized as JSON `null`, not an empty body (spec §8).
    pub payload: Option<Value>,
}

impl DirectMethodResponse {
    pub fn new(request_id: impl Into<String>, status: u32, payload: Option<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            payload,
        }
    }

    pub(crate) fn payload_bytes(&self) -> Vec<u8> {
        match &self.payload {
            Some(v) => serde_json::to_vec(v).expect("JSON value always serializes"),
            None => b"null".to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_payload_serializes_to_json_null() {
        let response = DirectMethodResponse::new("1", 200, None);
        assert_eq!(response.payload_bytes(), b"null");
    }
}


