//! Inbound topic classification.
//!
//! Separates platform-internal signaling from application payloads on the
//! single broker session. Routing is pure; acting on a routed event (cache
//! writes, notifications) is the session driver's job.

use bytes::Bytes;
use serde_json::Value;

/// Prefix a gear-relative topic with the application namespace.
pub fn namespaced(appid: &str, topic: &str) -> String {
    format!("/{appid}{topic}")
}

/// Control channel scoped to one session's client identifier.
pub fn control_channel(appid: &str, client_id: &str) -> String {
    format!("/{appid}/&id/{client_id}/#")
}

/// Presence announcement topic for the application.
pub fn presence_topic(appid: &str) -> String {
    format!("/{appid}/&present")
}

/// Absence announcement topic for the application.
pub fn absence_topic(appid: &str) -> String {
    format!("/{appid}/&absent")
}

/// Classified inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedEvent {
    /// A gear announced itself on `/&present`
    Present(Value),
    /// A gear went away on `/&absent`
    Absent(Value),
    /// The platform asked this gear to re-resolve its broker endpoint
    ResetEndpoint,
    /// Platform informational notice
    Info(String),
    /// Platform error notice
    Error(String),
    /// Ordinary application message, with the full original topic
    Message { topic: String, payload: Bytes },
    /// Control segment this client does not handle
    Ignored,
}

/// Presence payloads are JSON when well-formed, raw text otherwise.
fn parse_presence(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

/// Classify one inbound message.
pub fn route(appid: &str, topic: &str, payload: &Bytes) -> RoutedEvent {
    let namespace = format!("/{appid}");
    let local = topic.strip_prefix(namespace.as_str()).unwrap_or(topic);

    if let Some(rest) = local.strip_prefix("/&") {
        let segment = rest.split('/').next().unwrap_or("");
        return match segment {
            "present" => RoutedEvent::Present(parse_presence(payload)),
            "absent" => RoutedEvent::Absent(parse_presence(payload)),
            "resetendpoint" => RoutedEvent::ResetEndpoint,
            _ => RoutedEvent::Ignored,
        };
    }

    if local.starts_with('@') {
        return match local {
            "@info" => RoutedEvent::Info(String::from_utf8_lossy(payload).into_owned()),
            "@error" => RoutedEvent::Error(String::from_utf8_lossy(payload).into_owned()),
            _ => RoutedEvent::Ignored,
        };
    }

    RoutedEvent::Message {
        topic: topic.to_string(),
        payload: payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_topic_builders() {
        assert_eq!(namespaced("APP", "/sensors/1"), "/APP/sensors/1");
        assert_eq!(control_channel("APP", "TOKEN"), "/APP/&id/TOKEN/#");
        assert_eq!(presence_topic("APP"), "/APP/&present");
        assert_eq!(absence_topic("APP"), "/APP/&absent");
    }

    #[test]
    fn test_present_with_json_payload() {
        let event = route("APP", "/APP/&present", &bytes(r#"{"status":"here"}"#));
        assert_eq!(event, RoutedEvent::Present(json!({"status": "here"})));
    }

    #[test]
    fn test_present_with_raw_text_falls_back() {
        let event = route("APP", "/APP/&present", &bytes("gear-7 is up"));
        assert_eq!(
            event,
            RoutedEvent::Present(Value::String("gear-7 is up".to_string()))
        );
    }

    #[test]
    fn test_absent_classification() {
        let event = route("APP", "/APP/&absent", &bytes(r#"{"gone":true}"#));
        assert_eq!(event, RoutedEvent::Absent(json!({"gone": true})));
    }

    #[test]
    fn test_reset_endpoint_with_trailing_segments() {
        assert_eq!(
            route("APP", "/APP/&resetendpoint", &bytes("")),
            RoutedEvent::ResetEndpoint
        );
        assert_eq!(
            route("APP", "/APP/&resetendpoint/extra", &bytes("")),
            RoutedEvent::ResetEndpoint
        );
    }

    #[test]
    fn test_unknown_control_segment_is_ignored() {
        assert_eq!(route("APP", "/APP/&mystery", &bytes("x")), RoutedEvent::Ignored);
    }

    #[test]
    fn test_platform_notices() {
        assert_eq!(
            route("APP", "@info", &bytes("maintenance at noon")),
            RoutedEvent::Info("maintenance at noon".to_string())
        );
        assert_eq!(
            route("APP", "@error", &bytes("quota exceeded")),
            RoutedEvent::Error("quota exceeded".to_string())
        );
        assert_eq!(route("APP", "@other", &bytes("x")), RoutedEvent::Ignored);
    }

    #[test]
    fn test_application_message_keeps_full_topic() {
        let event = route("APP", "/APP/sensors/1", &bytes("21.5"));
        assert_eq!(
            event,
            RoutedEvent::Message {
                topic: "/APP/sensors/1".to_string(),
                payload: bytes("21.5"),
            }
        );
    }

    #[test]
    fn test_control_check_applies_after_namespace_strip() {
        // "&present" only counts as control directly under the namespace
        let event = route("APP", "/APP/data/&present", &bytes("x"));
        assert!(matches!(event, RoutedEvent::Message { .. }));
    }

    proptest! {
        #[test]
        fn route_never_panics(topic in ".*", payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let payload = Bytes::from(payload);
            let _ = route("APP", &topic, &payload);
        }

        #[test]
        fn presence_parse_never_errors(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            // any payload resolves to a value, JSON or raw text
            let _ = parse_presence(&payload);
        }

        #[test]
        fn ordinary_topics_route_as_messages(suffix in "[a-z0-9/]{1,20}") {
            let topic = format!("/APP/data/{suffix}");
            let event = route("APP", &topic, &Bytes::new());
            let is_message = matches!(event, RoutedEvent::Message { .. });
            prop_assert!(is_message);
        }
    }
}
