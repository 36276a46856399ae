//! Event redaction.
//!
//! Redaction strips an event down to the fields that participate in
//! authorization, keyed by event type. Signatures and reference hashes are
//! computed over the redacted form, so a redacted copy remains verifiable
//! without the original content.

use serde_json::Value;

/// Top-level fields that survive redaction for every event type.
const KEEP: &[&str] = &[
    "event_id",
    "type",
    "room_id",
    "sender",
    "state_key",
    "content",
    "hashes",
    "signatures",
    "depth",
    "prev_events",
    "prev_state",
    "auth_events",
    "origin",
    "origin_server_ts",
    "membership",
    "redacts",
];

/// Content keys that survive redaction, per event type.
fn content_keep(event_type: &str) -> &'static [&'static str] {
    match event_type {
        "m.room.member" => &["membership"],
        "m.room.create" => &["creator"],
        "m.room.join_rules" => &["join_rule"],
        "m.room.power_levels" => &[
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.history_visibility" => &["history_visibility"],
        "m.room.aliases" => &["aliases"],
        _ => &[],
    }
}

/// Redact an event in object form. Idempotent.
pub fn redact(event: &Value) -> Value {
    let Value::Object(map) = event else {
        return event.clone();
    };

    let event_type = map.get("type").and_then(Value::as_str).unwrap_or("");
    let keep_content = content_keep(event_type);

    let mut out = serde_json::Map::new();
    for (key, value) in map {
        if !KEEP.contains(&key.as_str()) {
            continue;
        }
        if key == "content" {
            let mut content = serde_json::Map::new();
            if let Value::Object(fields) = value {
                for (ck, cv) in fields {
                    if keep_content.contains(&ck.as_str()) {
                        content.insert(ck.clone(), cv.clone());
                    }
                }
            }
            out.insert(key.clone(), Value::Object(content));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }

    Value::Object(out)
}
