//! MQTT topic builders/parsers for IoT Hub and DPS (spec §6).
//!
//! Carried forward from `spotflow::iothub::topics`' `const … _PREFIX` +
//! `fn topic(...)` idiom, extended with the DPS topic family and the
//! device/module path variants the teacher's single-device-only protocol
//! didn't need.

pub(crate) const METHODS_REQUEST_PREFIX: &str = "$iothub/methods/POST/";
pub(crate) const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub(crate) const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
pub(crate) const DPS_RESPONSE_PREFIX: &str = "$dps/registrations/res/";

pub(crate) const METHODS_FILTER: &str = "$iothub/methods/POST/#";
pub(crate) const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
pub(crate) const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
pub(crate) const DPS_RESPONSE_FILTER: &str = "$dps/registrations/res/#";

/// Build `devices/<d>/messages/events/<props>`, or the module variant when
/// `module_id` is set.
pub(crate) fn telemetry_topic(device_id: &str, module_id: Option<&str>, props: &str) -> String {
    match module_id {
        Some(m) => format!("devices/{device_id}/modules/{m}/messages/events/{props}"),
        None => format!("devices/{device_id}/messages/events/{props}"),
    }
}

fn c2d_prefix(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(m) => format!("devices/{device_id}/modules/{m}/messages/devicebound/"),
        None => format!("devices/{device_id}/messages/devicebound/"),
    }
}

/// Build the C2D subscription filter, or the module variant.
pub(crate) fn c2d_filter(device_id: &str, module_id: Option<&str>) -> String {
    format!("{}#", c2d_prefix(device_id, module_id))
}

/// Split a C2D message topic into its URL-encoded property suffix, or
/// `None` if `topic` isn't a C2D message for `device_id`/`module_id`.
pub(crate) fn parse_c2d_message<'a>(
    topic: &'a str,
    device_id: &str,
    module_id: Option<&str>,
) -> Option<&'a str> {
    topic.strip_prefix(&c2d_prefix(device_id, module_id))
}

pub(crate) fn method_response_topic(status: u32, rid: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={rid}")
}

pub(crate) fn twin_get_topic(rid: &str) -> String {
    format!("$iothub/twin/GET/?$rid={rid}")
}

pub(crate) fn twin_patch_reported_topic(rid: &str, version: Option<u64>) -> String {
    match version {
        Some(v) => format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}&$version={v}"),
        None => format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}"),
    }
}

pub(crate) fn dps_register_topic(rid: &str) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={rid}")
}

pub(crate) fn dps_poll_topic(rid: &str, operation_id: &str) -> String {
    format!("$dps/registrations/GET/iotdps-get-operationstatus/?$rid={rid}&operationId={operation_id}")
}

/// Split `$iothub/methods/POST/<method_name>/?$rid=<rid>` into
/// `(method_name, query)`. The method name may itself contain `/`, so the
/// split is on the rightmost `/` before the query string, matching
/// `spotflow::iothub::handlers::direct_method`'s parsing.
pub(crate) fn parse_method_request(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix(METHODS_REQUEST_PREFIX)?;
    let (path, query) = match rest.find('?') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };
    let method_name = path.strip_suffix('/').unwrap_or(path);
    Some((method_name, query))
}

/// Split `$iothub/twin/res/<status>/?$rid=<rid>` into `(status, query)`.
pub(crate) fn parse_twin_response(topic: &str) -> Option<(&str, &str)> {
    parse_status_response(topic, TWIN_RESPONSE_PREFIX)
}

/// Split `$dps/registrations/res/<status>/?$rid=<rid>[&retry-after=<s>]`
/// into `(status, query)`.
pub(crate) fn parse_dps_response(topic: &str) -> Option<(&str, &str)> {
    parse_status_response(topic, DPS_RESPONSE_PREFIX)
}

fn parse_status_response<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?;
    let (status, query) = match rest.find('?') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };
    let status = status.strip_suffix('/').unwrap_or(status);
    Some((status, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_telemetry_topic_for_device() {
        assert_eq!(
            telemetry_topic("dev1", None, ""),
            "devices/dev1/messages/events/"
        );
    }

    #[test]
    fn parses_c2d_message_topic_suffix() {
        let suffix = parse_c2d_message(
            "devices/dev1/messages/devicebound/%24.mid=m1&foo=bar",
            "dev1",
            None,
        )
        .unwrap();
        assert_eq!(suffix, "%24.mid=m1&foo=bar");
    }

    #[test]
    fn parse_c2d_message_rejects_topic_for_a_different_device() {
        assert!(parse_c2d_message("devices/dev2/messages/devicebound/", "dev1", None).is_none());
    }

    #[test]
    fn builds_telemetry_topic_for_module() {
        assert_eq!(
            telemetry_topic("dev1", Some("mod1"), "foo=bar"),
            "devices/dev1/modules/mod1/messages/events/foo=bar"
        );
    }

    #[test]
    fn parses_method_request_with_slash_in_name() {
        let (name, query) = parse_method_request("$iothub/methods/POST/a/b/?$rid=7").unwrap();
        assert_eq!(name, "a/b");
        assert_eq!(query, "$rid=7");
    }

    #[test]
    fn parses_twin_response() {
        let (status, query) = parse_twin_response("$iothub/twin/res/204/?$rid=1").unwrap();
        assert_eq!(status, "204");
        assert_eq!(query, "$rid=1");
    }

    #[test]
    fn parses_dps_response_with_retry_after() {
        let (status, query) =
            parse_dps_response("$dps/registrations/res/202/?$rid=1&retry-after=3").unwrap();
        assert_eq!(status, "202");
        assert_eq!(query, "$rid=1&retry-after=3");
    }

    #[test]
    fn non_matching_topic_returns_none() {
        assert!(parse_twin_response("devices/d/messages/devicebound/").is_none());
    }
}


