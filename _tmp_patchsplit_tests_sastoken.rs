//! Black-box round-trip coverage for the `SharedAccessSignature` wire
//! format, exercised through the public `SasToken` type rather than the
//! internal generator/provider machinery.

use iothub_device_core::SasToken;

#[test]
fn round_trips_through_display_and_parse() {
    let token = SasToken {
        resource_uri: "my.host.name/devices/my-device".to_string(),
        signature: "3CS5eG5/s7J23fqS+FpF31dBcm2n3e31LRh4FdTfmNU=".to_string(),
        expiry_unix_seconds: 1_735_689_600,
        key_name: None,
    };

    let wire = token.to_string();
    assert!(wire.starts_with("SharedAccessSignature "));
    assert!(wire.contains("sr=my.host.name%2Fdevices%2Fmy-device"));
    assert!(wire.contains("se=1735689600"));
    assert!(!wire.contains("skn="));

    let parsed = SasToken::parse(&wire).unwrap();
    assert_eq!(parsed, token);
}

#[test]
fn round_trips_with_a_key_name() {
    let token = SasToken {
        resource_uri: "my.host.name".to_string(),
        signature: "abc==".to_string(),
        expiry_unix_seconds: 100,
        key_name: Some("service".to_string()),
    };

    let wire = token.to_string();
    assert!(wire.ends_with("&skn=service"));

    let parsed = SasToken::parse(&wire).unwrap();
    assert_eq!(parsed, token);
}

#[test]
fn parse_rejects_a_string_missing_the_prefix() {
    assert!(SasToken::parse("sr=x&sig=y&se=1").is_err());
}

#[test]
fn parse_rejects_a_string_missing_the_signature() {
    assert!(SasToken::parse("SharedAccessSignature sr=x&se=1").is_err());
}

#[test]
fn parse_rejects_a_non_numeric_expiry() {
    assert!(SasToken::parse("SharedAccessSignature sr=x&sig=y&se=not-a-number").is_err());
}

