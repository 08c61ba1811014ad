use proptest::prelude::*;
use warden_types::{CorrelationId, PluginId, now_millis};

#[test]
fn plugin_id_accepts_dotted_names() {
    let id = PluginId::new("com.example.rss-reader_2").unwrap();
    assert_eq!(id.as_str(), "com.example.rss-reader_2");
    assert_eq!(id.to_string(), "com.example.rss-reader_2");
}

#[test]
fn plugin_id_rejects_empty() {
    assert!(PluginId::new("").is_err());
}

#[test]
fn plugin_id_rejects_path_separators() {
    assert!(PluginId::new("../escape").is_err());
    assert!(PluginId::new("a/b").is_err());
    assert!(PluginId::new("with space").is_err());
}

#[test]
fn plugin_id_rejects_overlong() {
    let long = "a".repeat(129);
    assert!(PluginId::new(long).is_err());
    assert!(PluginId::new("a".repeat(128)).is_ok());
}

#[test]
fn plugin_id_serde_is_a_plain_string() {
    let id = PluginId::new("notes").unwrap();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"notes\"");
    let back: PluginId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn plugin_id_deserialize_validates() {
    let result: Result<PluginId, _> = serde_json::from_str("\"bad id\"");
    assert!(result.is_err());
}

#[test]
fn correlation_ids_are_unique() {
    let a = CorrelationId::new();
    let b = CorrelationId::new();
    assert_ne!(a, b);
}

#[test]
fn correlation_id_parses_its_display_form() {
    let id = CorrelationId::new();
    let parsed: CorrelationId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
}

#[test]
fn now_millis_is_after_2020() {
    assert!(now_millis() > 1_577_836_800_000);
}

proptest! {
    #[test]
    fn valid_charset_always_accepted(id in "[a-zA-Z0-9._-]{1,128}") {
        prop_assert!(PluginId::new(id).is_ok());
    }
}
