//! URL-encoded query-string parsing/building for MQTT topic suffixes
//! (`$rid=...&foo=bar`, spec §6).
//!
//! The parser is carried over nearly verbatim from
//! `spotflow::iothub::query::parse`; the encoder is new, needed here because
//! (unlike the teacher) this crate also builds topics rather than only
//! parsing them.

use std::collections::HashMap;

use anyhow::{Context, Result};
use urlencoding::{decode, encode};

/// Parse a `key=value&key&key=value` query string into a map.
///
/// A key with no `=` maps to `None`, matching the IoT Hub convention of bare
/// property names in twin PATCH topics.
pub(crate) fn parse(query: &str) -> Result<HashMap<String, Option<String>>> {
    let mut map = HashMap::new();

    for prop in query.split('&') {
        if prop.is_empty() {
            continue;
        }
        match prop.find('=') {
            None => {
                let key = decode(prop).context(format!("unable to URL-decode key {prop}"))?;
                map.insert(key.into_owned(), None);
            }
            Some(pos) => {
                let key =
                    decode(&prop[..pos]).context(format!("unable to URL-decode key {prop}"))?;
                let value = decode(&prop[pos + 1..])
                    .context(format!("unable to URL-decode value {prop}"))?;
                map.insert(key.into_owned(), Some(value.into_owned()));
            }
        }
    }

    Ok(map)
}

/// Build a `key=value&key=value` query string from ordered pairs, percent
/// encoding each key and value.
pub(crate) fn encode_pairs(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rid() {
        let dict = parse("$rid=0").unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("$rid").unwrap().as_ref().unwrap(), "0");
    }

    #[test]
    fn parse_multiple() {
        let dict = parse("$rid=1&foo=bar").unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get("$rid").unwrap().as_ref().unwrap(), "1");
        assert_eq!(dict.get("foo").unwrap().as_ref().unwrap(), "bar");
    }

    #[test]
    fn parse_bare_key() {
        let dict = parse("foo").unwrap();
        assert_eq!(dict.get("foo").unwrap(), &None);
    }

    #[test]
    fn encode_then_parse_round_trips() {
        let encoded = encode_pairs(&[("$rid", "42"), ("status", "ok")]);
        let parsed = parse(&encoded).unwrap();
        assert_eq!(parsed.get("$rid").unwrap().as_ref().unwrap(), "42");
        assert_eq!(parsed.get("status").unwrap().as_ref().unwrap(), "ok");
    }
}


