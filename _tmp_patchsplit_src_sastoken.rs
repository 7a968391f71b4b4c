//! SAS token value type, generators, and the proactive refresh loop
//! (spec §3, §4.2, §5).
//!
//! The refresh loop's shape — compute a wakeup instant from the current
//! expiry, sleep-or-react-to-commands, retry with backoff on failure, tear
//! down on exhaustion — is grounded on
//! `spotflow::iothub::token_handler::TokenHandler::refresh_tokens`/
//! `process_command`/`expect_clockskew`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::CredentialError;
use crate::signing::SigningMechanism;

/// An immutable, already-signed SAS credential (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    pub resource_uri: String,
    /// Base64-encoded HMAC, not yet URL-encoded.
    pub signature: String,
    pub expiry_unix_seconds: i64,
    pub key_name: Option<String>,
}

impl std::fmt::Display for SasToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SharedAccessSignature sr={}&sig={}&se={}",
            urlencoding::encode(&self.resource_uri),
            urlencoding::encode(&self.signature),
            self.expiry_unix_seconds
        )?;
        if let Some(key_name) = &self.key_name {
            write!(f, "&skn={}", urlencoding::encode(key_name))?;
        }
        Ok(())
    }
}

impl SasToken {
    /// Parse a token previously produced by `Display`. Used by tests and by
    /// callers that accept a caller-supplied token string.
    pub fn parse(s: &str) -> Result<Self, CredentialError> {
        let query = s
            .strip_prefix("SharedAccessSignature ")
            .ok_or_else(|| anyhow::anyhow!("missing `SharedAccessSignature` prefix"))
            .map_err(CredentialError::ExternalGenerator)?;

        let pairs = crate::query::parse(query).map_err(CredentialError::ExternalGenerator)?;

        let resource_uri = pairs
            .get("sr")
            .and_then(|v| v.clone())
            .ok_or_else(|| anyhow::anyhow!("SAS token is missing `sr`"))
            .map_err(CredentialError::ExternalGenerator)?;
        let signature = pairs
            .get("sig")
            .and_then(|v| v.clone())
            .ok_or_else(|| anyhow::anyhow!("SAS token is missing `sig`"))
            .map_err(CredentialError::ExternalGenerator)?;
        let expiry_unix_seconds = pairs
            .get("se")
            .and_then(|v| v.clone())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| anyhow::anyhow!("SAS token is missing or has invalid `se`"))
            .map_err(CredentialError::ExternalGenerator)?;
        let key_name = pairs.get("skn").and_then(|v| v.clone());

        Ok(SasToken {
            resource_uri,
            signature,
            expiry_unix_seconds,
            key_name,
        })
    }
}

/// Owns a signing mechanism, resource URI, and TTL; mints fresh tokens on
/// demand.
pub struct InternalSasTokenGenerator {
    pub signing: Arc<dyn SigningMechanism>,
    pub resource_uri: String,
    pub ttl: Duration,
    pub key_name: Option<String>,
}

impl InternalSasTokenGenerator {
    pub async fn generate(&self) -> Result<SasToken, CredentialError> {
        let expiry = Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_default();
        let expiry_unix_seconds = expiry.timestamp();

        let encoded_uri = urlencoding::encode(&self.resource_uri);
        let string_to_sign = format!("{encoded_uri}\n{expiry_unix_seconds}");

        let signature_bytes = self.signing.sign(string_to_sign.as_bytes()).await?;
        let signature = String::from_utf8(signature_bytes)
            .map_err(|e| CredentialError::ExternalGenerator(e.into()))?;

        Ok(SasToken {
            resource_uri: self.resource_uri.clone(),
            signature,
            expiry_unix_seconds,
            key_name: self.key_name.clone(),
        })
    }
}

/// A user-supplied async callback returning a ready-to-use SAS token
/// string; disables internal signing (spec §4.6).
pub type ExternalSasTokenFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync>;

pub enum SasTokenGenerator {
    Internal(InternalSasTokenGenerator),
    External(ExternalSasTokenFn),
}

impl SasTokenGenerator {
    /// Produce the next token, and its expiry if known (external generators
    /// carry no expiry the provider can reason about).
    async fn generate(&self) -> Result<(String, Option<DateTime<Utc>>), CredentialError> {
        match self {
            SasTokenGenerator::Internal(gen) => {
                let token = gen.generate().await?;
                let expiry = DateTime::from_timestamp(token.expiry_unix_seconds, 0);
                Ok((token.to_string(), expiry))
            }
            SasTokenGenerator::External(f) => {
                let token = f().await.map_err(CredentialError::ExternalGenerator)?;
                Ok((token, None))
            }
        }
    }
}

struct CachedToken {
    value: String,
    expiry: Option<DateTime<Utc>>,
}

/// Caches the current token and knows when it is due for a refresh.
pub struct SasTokenProvider {
    generator: SasTokenGenerator,
    cached: Mutex<Option<CachedToken>>,
}

impl SasTokenProvider {
    pub fn new(generator: SasTokenGenerator) -> Self {
        Self {
            generator,
            cached: Mutex::new(None),
        }
    }

    /// The current token, minting one on first use.
    pub async fn current(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.value.clone());
        }
        let (value, expiry) = self.generator.generate().await?;
        *cached = Some(CachedToken {
            value: value.clone(),
            expiry,
        });
        Ok(value)
    }

    /// Force-regenerate and cache a new token, returning it.
    pub async fn refresh(&self) -> Result<String, CredentialError> {
        let (value, expiry) = self.generator.generate().await?;
        *self.cached.lock().await = Some(CachedToken {
            value: value.clone(),
            expiry,
        });
        Ok(value)
    }

    /// How long to sleep before the next proactive refresh, per spec §5:
    /// `expiry - max(ttl/2, 120s)`. `ttl` here is approximated as the time
    /// remaining until expiry at cache time, since the provider does not
    /// retain the generator's configured TTL separately. Returns `None` for
    /// externally-generated tokens, which carry no expiry to schedule from.
    async fn next_wakeup(&self) -> Option<Duration> {
        let cached = self.cached.lock().await;
        let expiry = cached.as_ref()?.expiry?;
        let remaining = expiry.signed_duration_since(Utc::now());
        let remaining = remaining.to_std().unwrap_or(Duration::ZERO);
        let lead_time = std::cmp::max(remaining / 2, Duration::from_secs(120));
        Some(remaining.saturating_sub(lead_time))
    }
}

/// Errors from a single reauthorize attempt driven by the refresh loop.
pub type ReauthorizeFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Runs the background credential-refresh loop described in spec §5 until
/// `cancellation` fires. On an unrecoverable failure the loop returns an
/// error describing why, which the owning session tears itself down with.
pub async fn run_refresh_loop(
    provider: Arc<SasTokenProvider>,
    reauthorize: ReauthorizeFn,
    cancellation: CancellationToken,
) -> anyhow::Result<()> {
    let max_backoff_divisor = 4;

    loop {
        let sleep_for = provider
            .next_wakeup()
            .await
            .unwrap_or(Duration::from_secs(60));

        tokio::select! {
            _ = cancellation.cancelled() => return Ok(()),
            _ = tokio::time::sleep(sleep_for) => {}
        }

        if cancellation.is_cancelled() {
            return Ok(());
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            match provider.refresh().await {
                Ok(new_token) => {
                    match reauthorize(new_token).await {
                        Ok(()) => {
                            log::debug!("credential refresh and reauthorize succeeded");
                            break;
                        }
                        Err(e) => {
                            log::warn!("reauthorize failed, retrying: {e:?}");
                        }
                    }
                }
                Err(e) => {
                    log::warn!("credential refresh failed, retrying: {e:?}");
                }
            }

            let cap = provider
                .next_wakeup()
                .await
                .map(|d| d / max_backoff_divisor)
                .unwrap_or(Duration::from_secs(300));
            if backoff >= cap && cap > Duration::ZERO {
                return Err(anyhow::anyhow!(
                    "credential refresh exhausted its retry budget"
                ));
            }

            tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, cap.max(Duration::from_secs(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::SymmetricKeySigningMechanism;

    #[test]
    fn displays_wire_format() {
        let token = SasToken {
            resource_uri: "h.example/devices/d".to_string(),
            signature: "abc==".to_string(),
            expiry_unix_seconds: 1_003_600,
            key_name: None,
        };
        assert_eq!(
            token.to_string(),
            "SharedAccessSignature sr=h.example%2Fdevices%2Fd&sig=abc%3D%3D&se=1003600"
        );
    }

    #[test]
    fn displays_with_key_name() {
        let token = SasToken {
            resource_uri: "h.example/devices/d".to_string(),
            signature: "abc".to_string(),
            expiry_unix_seconds: 100,
            key_name: Some("service".to_string()),
        };
        assert!(token.to_string().ends_with("&skn=service"));
    }

    #[test]
    fn round_trips_through_parse() {
        let token = SasToken {
            resource_uri: "h.example/devices/d".to_string(),
            signature: "abc==".to_string(),
            expiry_unix_seconds: 1_003_600,
            key_name: Some("svc".to_string()),
        };
        let parsed = SasToken::parse(&token.to_string()).unwrap();
        assert_eq!(parsed, token);
    }

    #[tokio::test]
    async fn internal_generator_produces_expected_prefix() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let key = STANDARD.encode(b"foobar");
        let signing = Arc::new(SymmetricKeySigningMechanism::new(&key).unwrap());
        let generator = InternalSasTokenGenerator {
            signing,
            resource_uri: "h.example/devices/d".to_string(),
            ttl: Duration::from_secs(3600),
            key_name: None,
        };
        let token = generator.generate().await.unwrap();
        assert_eq!(token.resource_uri, "h.example/devices/d");
        assert!(token.expiry_unix_seconds > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn provider_caches_until_refreshed() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let key = STANDARD.encode(b"foobar");
        let signing = Arc::new(SymmetricKeySigningMechanism::new(&key).unwrap());
        let generator = SasTokenGenerator::Internal(InternalSasTokenGenerator {
            signing,
            resource_uri: "h.example/devices/d".to_string(),
            ttl: Duration::from_secs(3600),
            key_name: None,
        });
        let provider = SasTokenProvider::new(generator);
        let first = provider.current().await.unwrap();
        let second = provider.current().await.unwrap();
        assert_eq!(first, second);
    }
}


