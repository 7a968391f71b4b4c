//! Signing/certificate retrieval via the IoT Edge daemon's workload HTTP
//! API, reached over a Unix domain socket.
//!
//! The URL shape is `unix:///path` → `http+unix://%2Fpath/`, via
//! `hyperlocal`'s Unix-socket connector for `hyper::Client`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{Request, StatusCode};
use hyper::{body, Body, Client};
use hyperlocal::UnixClientExt;
use serde::Deserialize;
use serde_json::json;

use crate::error::{IoTEdgeError, SigningError};
use crate::signing::SigningMechanism;

#[derive(Debug, Clone)]
enum Transport {
    Unix(std::path::PathBuf),
    Http(String),
}

/// Signs data and fetches the trust bundle by delegating to the IoT Edge
/// daemon's local workload API.
pub struct EdgeHsmSigningMechanism {
    module_id: String,
    generation_id: String,
    transport: Transport,
    api_version: String,
}

#[derive(Deserialize)]
struct TrustBundle {
    certificate: Option<String>,
}

#[derive(Deserialize)]
struct SignResponse {
    digest: Option<String>,
}

impl EdgeHsmSigningMechanism {
    /// `workload_uri` is either `unix://<path>` or an `http(s)://` base URL.
    pub fn new(
        module_id: &str,
        generation_id: &str,
        workload_uri: &str,
        api_version: &str,
    ) -> Self {
        let transport = if let Some(path) = workload_uri.strip_prefix("unix://") {
            Transport::Unix(std::path::PathBuf::from(path))
        } else {
            Transport::Http(workload_uri.trim_end_matches('/').to_string())
        };

        Self {
            module_id: urlencoding::encode(module_id).into_owned(),
            generation_id: generation_id.to_string(),
            transport,
            api_version: api_version.to_string(),
        }
    }

    /// Construct from the `IOTEDGE_*` environment variables.
    pub fn from_environment() -> anyhow::Result<Self> {
        use std::env::var;

        let workload_uri = var("IOTEDGE_WORKLOADURI")?;
        let module_id = var("IOTEDGE_MODULEID")?;
        let generation_id = var("IOTEDGE_MODULEGENERATIONID")?;
        let api_version = var("IOTEDGE_APIVERSION")?;

        Ok(Self::new(&module_id, &generation_id, &workload_uri, &api_version))
    }

    async fn request(&self, method: http::Method, path: &str, body: Option<Vec<u8>>) -> Result<Vec<u8>, IoTEdgeError> {
        let path_and_query = format!("{path}?api-version={}", self.api_version);

        let (uri, body) = match &self.transport {
            Transport::Unix(socket_path) => {
                let uri = hyperlocal::Uri::new(socket_path, &path_and_query).into();
                (uri, body)
            }
            Transport::Http(base) => {
                let uri = format!("{base}/{path_and_query}")
                    .parse::<http::Uri>()
                    .map_err(|e| IoTEdgeError::Transport(e.into()))?;
                (uri, body)
            }
        };

        let request_body = match body {
            Some(bytes) => Body::from(bytes),
            None => Body::empty(),
        };

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(request_body)
            .map_err(|e| IoTEdgeError::Transport(e.into()))?;

        let response = match &self.transport {
            Transport::Unix(_) => {
                let client = Client::unix();
                client
                    .request(request)
                    .await
                    .map_err(|e| IoTEdgeError::Transport(e.into()))?
            }
            Transport::Http(_) => {
                let client = Client::new();
                client
                    .request(request)
                    .await
                    .map_err(|e| IoTEdgeError::Transport(e.into()))?
            }
        };

        if response.status() != StatusCode::OK {
            return Err(IoTEdgeError::Status(response.status().as_u16()));
        }

        let bytes = body::to_bytes(response.into_body())
            .await
            .map_err(|e| IoTEdgeError::Transport(e.into()))?;
        Ok(bytes.to_vec())
    }

    /// `GET trust-bundle?api-version=...` → the `certificate` field.
    pub async fn get_certificate(&self) -> Result<String, IoTEdgeError> {
        let bytes = self
            .request(http::Method::GET, "trust-bundle", None)
            .await?;
        let bundle: TrustBundle = serde_json::from_slice(&bytes)
            .map_err(|e| IoTEdgeError::InvalidResponse(e.into()))?;
        bundle.certificate.ok_or(IoTEdgeError::MissingField("certificate"))
    }
}

#[async_trait::async_trait]
impl SigningMechanism for EdgeHsmSigningMechanism {
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SigningError> {
        let data_b64 = STANDARD.encode(data);
        let body = json!({
            "keyId": "primary",
            "algo": "HMACSHA256",
            "data": data_b64,
        });
        let path = format!(
            "modules/{}/genid/{}/sign",
            self.module_id, self.generation_id
        );
        let bytes = self
            .request(
                http::Method::POST,
                &path,
                Some(serde_json::to_vec(&body).expect("json body is always serializable")),
            )
            .await
            .map_err(SigningError::Edge)?;

        let response: SignResponse = serde_json::from_slice(&bytes)
            .map_err(|e| IoTEdgeError::InvalidResponse(e.into()))
            .map_err(SigningError::Edge)?;

        response
            .digest
            .map(|d| d.into_bytes())
            .ok_or(IoTEdgeError::MissingField("digest"))
            .map_err(SigningError::Edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_module_id() {
        let hsm = EdgeHsmSigningMechanism::new(
            "my module/id",
            "gen1",
            "unix:///var/run/iotedge/workload.sock",
            "2019-01-30",
        );
        assert_eq!(hsm.module_id, "my%20module%2Fid");
    }

    #[test]
    fn recognizes_unix_transport() {
        let hsm = EdgeHsmSigningMechanism::new(
            "m",
            "g",
            "unix:///var/run/iotedge/workload.sock",
            "2019-01-30",
        );
        assert!(matches!(hsm.transport, Transport::Unix(_)));
    }

    #[test]
    fn recognizes_http_transport() {
        let hsm = EdgeHsmSigningMechanism::new("m", "g", "http://127.0.0.1:15580", "2019-01-30");
        assert!(matches!(hsm.transport, Transport::Http(_)));
    }
}
