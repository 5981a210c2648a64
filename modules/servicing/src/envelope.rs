//! Message envelope sanitisation
//!
//! The broker erases nested types: every entry field arrives as a string,
//! so sequence numbers come in as `"3"` or `""`, recipient lists as JSON
//! text, and payloads as JSON text. Sanitisation coerces these back to
//! canonical types once, before dispatch, so nothing downstream branches on
//! wire quirks.

use serde_json::{Map, Value};

/// An event envelope: the flat field map of a stream entry, values
/// progressively coerced from wire strings to canonical JSON types.
pub type Envelope = Map<String, Value>;

/// Normalise envelope fields to canonical types.
///
/// - `seq`, `c_seq`: empty string or null → 0; digit string → integer;
///   unparseable → 0
/// - `rec`: JSON string → decoded list; bare string → one-element list
///   (empty string → `[]`); null → `[]`
/// - `dat`: JSON string → decoded; kept as-is when not valid JSON
///
/// All other keys pass through unchanged. Sanitising an already-sanitised
/// envelope is a no-op.
pub fn sanitize_envelope(data: &Envelope) -> Envelope {
    let mut result = data.clone();

    for key in ["seq", "c_seq"] {
        if let Some(value) = result.get(key) {
            let coerced = coerce_sequence(value);
            result.insert(key.to_string(), coerced);
        }
    }

    if let Some(value) = result.get("rec") {
        let coerced = coerce_recipients(value);
        result.insert("rec".to_string(), coerced);
    }

    if let Some(Value::String(raw)) = result.get("dat") {
        if let Ok(decoded) = serde_json::from_str::<Value>(raw) {
            result.insert("dat".to_string(), decoded);
        }
    }

    result
}

fn coerce_sequence(value: &Value) -> Value {
    match value {
        Value::Null => Value::from(0),
        Value::String(s) => s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::from(0)),
        other => other.clone(),
    }
}

fn coerce_recipients(value: &Value) -> Value {
    match value {
        Value::Null => Value::Array(Vec::new()),
        Value::String(s) => serde_json::from_str::<Value>(s).unwrap_or_else(|_| {
            if s.is_empty() {
                Value::Array(Vec::new())
            } else {
                Value::Array(vec![Value::String(s.clone())])
            }
        }),
        other => other.clone(),
    }
}

/// Event type from `msg_type` / `typ` / `event_type`, first non-empty.
pub fn event_type_of(envelope: &Envelope) -> &str {
    ["msg_type", "typ", "event_type"]
        .iter()
        .filter_map(|key| envelope.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or("")
}

/// Event id for deduplication: `cause` / `id` / `event_id`, falling back
/// to the broker message id.
pub fn event_id_of(envelope: &Envelope, message_id: &str) -> String {
    ["cause", "id", "event_id"]
        .iter()
        .filter_map(|key| envelope.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or(message_id)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(pairs: &[(&str, Value)]) -> Envelope {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_seq_boundary_values() {
        for (input, expected) in [
            (json!(""), json!(0)),
            (json!("0"), json!(0)),
            (json!(0), json!(0)),
            (json!("42"), json!(42)),
            (json!(7), json!(7)),
            (json!(null), json!(0)),
            (json!("not-a-number"), json!(0)),
        ] {
            let out = sanitize_envelope(&envelope(&[("seq", input.clone()), ("c_seq", input)]));
            assert_eq!(out["seq"], expected);
            assert_eq!(out["c_seq"], expected);
        }
    }

    #[test]
    fn test_seq_absent_stays_absent() {
        let out = sanitize_envelope(&envelope(&[("typ", json!("x"))]));
        assert!(!out.contains_key("seq"));
    }

    #[test]
    fn test_rec_boundary_values() {
        for (input, expected) in [
            (json!(""), json!([])),
            (json!("[\"a\"]"), json!(["a"])),
            (json!(["a"]), json!(["a"])),
            (json!(null), json!([])),
            (json!("agent-1"), json!(["agent-1"])),
        ] {
            let out = sanitize_envelope(&envelope(&[("rec", input)]));
            assert_eq!(out["rec"], expected);
        }
    }

    #[test]
    fn test_dat_json_string_is_decoded() {
        let out = sanitize_envelope(&envelope(&[("dat", json!("{\"account_id\": \"ACC1\"}"))]));
        assert_eq!(out["dat"], json!({"account_id": "ACC1"}));
    }

    #[test]
    fn test_dat_non_json_string_kept() {
        let out = sanitize_envelope(&envelope(&[("dat", json!("not json"))]));
        assert_eq!(out["dat"], json!("not json"));
    }

    #[test]
    fn test_other_keys_pass_through() {
        let input = envelope(&[
            ("typ", json!("conversation_started")),
            ("app_number", json!("APP-1")),
            ("payload", json!("{\"x\": 1}")),
        ]);
        let out = sanitize_envelope(&input);
        assert_eq!(out["typ"], json!("conversation_started"));
        assert_eq!(out["app_number"], json!("APP-1"));
        // payload is not the `dat` key and is left to handlers
        assert_eq!(out["payload"], json!("{\"x\": 1}"));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let input = envelope(&[
            ("seq", json!("")),
            ("c_seq", json!("3")),
            ("rec", json!("[\"a\", \"b\"]")),
            ("dat", json!("{\"k\": \"v\"}")),
            ("typ", json!("t")),
        ]);
        let once = sanitize_envelope(&input);
        let twice = sanitize_envelope(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_event_type_priority_and_fallback() {
        let out = envelope(&[("msg_type", json!("a")), ("typ", json!("b"))]);
        assert_eq!(event_type_of(&out), "a");

        let out = envelope(&[("msg_type", json!("")), ("typ", json!("b"))]);
        assert_eq!(event_type_of(&out), "b");

        let out = envelope(&[("event_type", json!("c"))]);
        assert_eq!(event_type_of(&out), "c");

        assert_eq!(event_type_of(&envelope(&[])), "");
    }

    #[test]
    fn test_event_id_priority_and_fallback() {
        let out = envelope(&[("cause", json!("E1")), ("id", json!("E2"))]);
        assert_eq!(event_id_of(&out, "1-0"), "E1");

        let out = envelope(&[("id", json!("E2"))]);
        assert_eq!(event_id_of(&out, "1-0"), "E2");

        let out = envelope(&[("event_id", json!("E3"))]);
        assert_eq!(event_id_of(&out, "1-0"), "E3");

        assert_eq!(event_id_of(&envelope(&[]), "1-0"), "1-0");
    }
}
