//! MQTT username formatting (spec §6): the `<hostname>/<device_id>[/<module_id>]/?api-version=…&DeviceClientType=…`
//! template used as the MQTT CONNECT username.
//!
//! Grounded on the single-`format!`-call shape of
//! `spotflow::iothub::mod::connect_iothub`'s username construction.

use crate::query::encode_pairs;

/// Build the MQTT CONNECT username for a device (or module, if `module_id`
/// is set) connecting to `hostname`.
pub(crate) fn build_username(
    hostname: &str,
    device_id: &str,
    module_id: Option<&str>,
    api_version: &str,
    product_info: Option<&str>,
) -> String {
    let path = match module_id {
        Some(m) => format!("{hostname}/{device_id}/{m}"),
        None => format!("{hostname}/{device_id}"),
    };

    let mut pairs = vec![("api-version", api_version)];
    if let Some(info) = product_info {
        pairs.push(("DeviceClientType", info));
    }

    format!("{path}/?{}", encode_pairs(&pairs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_device_username() {
        let username = build_username("my.host.name", "my-device", None, "2021-04-12", None);
        assert_eq!(username, "my.host.name/my-device/?api-version=2021-04-12");
    }

    #[test]
    fn builds_module_username_with_product_info() {
        let username = build_username(
            "my.host.name",
            "my-device",
            Some("my-module"),
            "2021-04-12",
            Some("my-sdk 1.0"),
        );
        assert_eq!(
            username,
            "my.host.name/my-device/my-module/?api-version=2021-04-12&DeviceClientType=my-sdk%201.0"
        );
    }
}


