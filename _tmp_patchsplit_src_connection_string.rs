//! Parsing and validation of `HostName=...;DeviceId=...;...` connection
//! strings (spec §3, §4.1).
//!
//! Grounded on the validation rules exercised in
//! `examples/original_source/tests/unit/test_connection_string.py`. The
//! Python original raises `TypeError` for non-string input; in Rust that
//! case doesn't exist at the type level since `parse` only accepts `&str`.

use std::fmt;

use crate::error::ConnectionStringParseError;

const RECOGNIZED_KEYS: &[&str] = &[
    "HostName",
    "DeviceId",
    "ModuleId",
    "SharedAccessKey",
    "SharedAccessKeyName",
    "SharedAccessSignature",
    "GatewayHostName",
    "x509",
];

/// A parsed `key=value;key=value` connection string.
///
/// Preserves the order keys appeared in the input so that
/// `parse(s).to_string() == s` (spec §3 invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pairs: Vec<(String, String)>,
}

impl ConnectionString {
    /// Parse a connection string, enforcing the invariants in spec §3:
    /// no duplicate keys, no unknown keys, `HostName` required, and
    /// `x509=true` mutually exclusive with `SharedAccessKey`/`SharedAccessSignature`.
    pub fn parse(s: &str) -> Result<Self, ConnectionStringParseError> {
        if s.is_empty() {
            return Err(ConnectionStringParseError::Empty);
        }

        let mut pairs = Vec::new();
        for token in s.split(';') {
            if token.is_empty() {
                // Leading/trailing/doubled separators are tolerated; empty
                // values between two `=` signs are not (handled below).
                continue;
            }

            let eq = token
                .find('=')
                .ok_or_else(|| ConnectionStringParseError::MissingEquals(token.to_string()))?;
            let key = &token[..eq];
            let value = &token[eq + 1..];

            if !RECOGNIZED_KEYS.contains(&key) {
                return Err(ConnectionStringParseError::UnknownKey(key.to_string()));
            }
            if pairs.iter().any(|(k, _): &(String, String)| k == key) {
                return Err(ConnectionStringParseError::DuplicateKey(key.to_string()));
            }

            pairs.push((key.to_string(), value.to_string()));
        }

        let cs = ConnectionString { pairs };

        if cs.get("HostName").is_none() {
            return Err(ConnectionStringParseError::MissingHostName);
        }

        let is_x509 = cs.get("x509").map(|v| v.eq_ignore_ascii_case("true")) == Some(true);
        let has_key_auth =
            cs.get("SharedAccessKey").is_some() || cs.get("SharedAccessSignature").is_some();
        if is_x509 && has_key_auth {
            return Err(ConnectionStringParseError::MixedAuthenticationScheme);
        }

        Ok(cs)
    }

    /// Get the value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get the value for `key`, or an error naming the missing key.
    pub fn get_or_error(&self, key: &str) -> Result<&str, ConnectionStringParseError> {
        self.get(key)
            .ok_or_else(|| ConnectionStringParseError::UnknownKey(key.to_string()))
    }

    /// True if `key` was present in the original string.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        write!(f, "{}", parts.join(";"))
    }
}

impl std::str::FromStr for ConnectionString {
    type Err = ConnectionStringParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_device_connection_string() {
        let s = "HostName=my.host.name;DeviceId=my-device;SharedAccessKey=Zm9vYmFy";
        let cs = ConnectionString::parse(s).unwrap();
        assert_eq!(cs.get("HostName"), Some("my.host.name"));
        assert_eq!(cs.get("DeviceId"), Some("my-device"));
        assert_eq!(cs.get("SharedAccessKey"), Some("Zm9vYmFy"));
        assert_eq!(cs.to_string(), s);
    }

    #[test]
    fn accepts_x509_without_key() {
        let s = "HostName=my.host.name;DeviceId=my-device;x509=True";
        assert!(ConnectionString::parse(s).is_ok());
    }

    #[test]
    fn rejects_empty_string() {
        assert!(matches!(
            ConnectionString::parse(""),
            Err(ConnectionStringParseError::Empty)
        ));
    }

    #[test]
    fn rejects_missing_equals() {
        assert!(matches!(
            ConnectionString::parse("garbage"),
            Err(ConnectionStringParseError::MissingEquals(_))
        ));
    }

    #[test]
    fn rejects_missing_hostname() {
        assert!(matches!(
            ConnectionString::parse("DeviceId=my-device"),
            Err(ConnectionStringParseError::MissingHostName)
        ));
    }

    #[test]
    fn rejects_unknown_key() {
        let s = "InvalidKey=my.host.name;SharedAccessKeyName=mykeyname;SharedAccessKey=Zm9vYmFy";
        assert!(matches!(
            ConnectionString::parse(s),
            Err(ConnectionStringParseError::UnknownKey(_))
        ));
    }

    #[test]
    fn rejects_duplicate_key() {
        let s = "HostName=my.host.name;HostName=my.host.name;SharedAccessKey=mykeyname;SharedAccessKey=Zm9vYmFy";
        assert!(matches!(
            ConnectionString::parse(s),
            Err(ConnectionStringParseError::DuplicateKey(_))
        ));
    }

    #[test]
    fn rejects_mixed_authentication_scheme() {
        let s = "HostName=my.host.name;DeviceId=my-device;ModuleId=my-module;SharedAccessKey=x;x509=true";
        assert!(matches!(
            ConnectionString::parse(s),
            Err(ConnectionStringParseError::MixedAuthenticationScheme)
        ));
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let cs = ConnectionString::parse("HostName=my.host.name;DeviceId=d").unwrap();
        assert_eq!(cs.get("SharedAccessSignature"), None);
    }
}


