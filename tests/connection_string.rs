//! Black-box coverage of the public `ConnectionString` parser's validation
//! matrix, exercised against this crate's public API rather than internals.

use iothub_device_core::{ConnectionString, ConnectionStringParseError};

#[test]
fn instantiates_from_service_connection_string() {
    let cs = ConnectionString::parse(
        "HostName=my.host.name;SharedAccessKeyName=mykeyname;SharedAccessKey=Zm9vYmFy",
    )
    .unwrap();
    assert_eq!(cs.get("HostName"), Some("my.host.name"));
}

#[test]
fn instantiates_from_device_connection_string_with_gateway() {
    let cs = ConnectionString::parse(
        "HostName=my.host.name;DeviceId=my-device;SharedAccessKey=Zm9vYmFy;GatewayHostName=mygateway",
    )
    .unwrap();
    assert_eq!(cs.get("GatewayHostName"), Some("mygateway"));
}

#[test]
fn instantiates_from_module_connection_string_with_x509() {
    let cs = ConnectionString::parse(
        "HostName=my.host.name;DeviceId=my-device;ModuleId=my-module;x509=True",
    )
    .unwrap();
    assert_eq!(cs.get("ModuleId"), Some("my-module"));
}

#[test]
fn rejects_empty_string() {
    assert!(matches!(
        ConnectionString::parse(""),
        Err(ConnectionStringParseError::Empty)
    ));
}

#[test]
fn rejects_string_with_no_equals_sign() {
    assert!(matches!(
        ConnectionString::parse("garbage"),
        Err(ConnectionStringParseError::MissingEquals(_))
    ));
}

// `DeviceId` is required by `IoTHubSessionConfig::from_connection_string`
// one layer up, not by the parser itself: service connection strings are
// valid with only `HostName`.
#[test]
fn hostname_alone_is_a_valid_connection_string() {
    assert!(ConnectionString::parse("HostName=my.host.name").is_ok());
}

#[test]
fn rejects_unrecognized_key() {
    assert!(matches!(
        ConnectionString::parse(
            "InvalidKey=my.host.name;SharedAccessKeyName=mykeyname;SharedAccessKey=Zm9vYmFy"
        ),
        Err(ConnectionStringParseError::UnknownKey(_))
    ));
}

#[test]
fn rejects_duplicate_key() {
    assert!(matches!(
        ConnectionString::parse(
            "HostName=my.host.name;HostName=my.host.name;SharedAccessKey=mykeyname;SharedAccessKey=Zm9vYmFy"
        ),
        Err(ConnectionStringParseError::DuplicateKey(_))
    ));
}

#[test]
fn rejects_mixed_authentication_scheme() {
    assert!(matches!(
        ConnectionString::parse(
            "HostName=my.host.name;DeviceId=my-device;ModuleId=my-module;SharedAccessKey=mykeyname;x509=true"
        ),
        Err(ConnectionStringParseError::MixedAuthenticationScheme)
    ));
}

#[test]
fn displays_as_the_original_string() {
    let s = "HostName=my.host.name;SharedAccessKeyName=mykeyname;SharedAccessKey=Zm9vYmFy";
    let cs = ConnectionString::parse(s).unwrap();
    assert_eq!(cs.to_string(), s);
}

#[test]
fn get_returns_none_for_an_absent_key() {
    let cs = ConnectionString::parse(
        "HostName=my.host.name;SharedAccessKeyName=mykeyname;SharedAccessKey=Zm9vYmFy",
    )
    .unwrap();
    assert_eq!(cs.get("SharedAccessSignature"), None);
}
