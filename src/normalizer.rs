// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pure, stateless transform from a raw robot frame into a canonical shape.
//!
//! The mapping is a straight lookup on the raw `type` field; it never fails
//! and never touches the network or the clock (the caller stamps
//! `robot_ip`/`robot_alias`/`timestamp` onto the result afterwards).

use serde_json::Value;

/// A normalized frame, prior to the session handler stamping identity and
/// timing fields onto it to produce a full [`crate::protocol::Envelope`].
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    pub kind: String,
    pub data: Value,
    pub message: Option<String>,
    pub level: Option<String>,
}

pub fn normalize(raw: &Value) -> NormalizedFrame {
    match raw.get("type").and_then(Value::as_str) {
        Some("bno055") => NormalizedFrame {
            kind: "imu_data".to_string(),
            data: raw.get("data").cloned().unwrap_or(Value::Null),
            message: None,
            level: None,
        },
        Some("encoder") => NormalizedFrame {
            kind: "encoder_data".to_string(),
            data: raw.get("data").cloned().unwrap_or(Value::Null),
            message: None,
            level: None,
        },
        Some("log") => NormalizedFrame {
            kind: "log".to_string(),
            data: Value::Null,
            message: Some(
                raw.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            level: Some(
                raw.get("level")
                    .and_then(Value::as_str)
                    .unwrap_or("debug")
                    .to_string(),
            ),
        },
        Some("registration") => {
            let mut data = serde_json::Map::new();
            data.insert(
                "capabilities".to_string(),
                raw.get("capabilities").cloned().unwrap_or(Value::Null),
            );
            data.insert(
                "robot_reported_id".to_string(),
                raw.get("robot_reported_id").cloned().unwrap_or(Value::Null),
            );
            NormalizedFrame {
                kind: "registration".to_string(),
                data: Value::Object(data),
                message: None,
                level: None,
            }
        }
        Some(other) => NormalizedFrame {
            kind: format!("generic_{other}"),
            data: raw.clone(),
            message: None,
            level: None,
        },
        None => NormalizedFrame {
            kind: "unknown_json_data".to_string(),
            data: raw.clone(),
            message: None,
            level: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bno055_becomes_imu_data() {
        let raw = json!({"type": "bno055", "data": {"time": 1.0, "euler": [1,2,3], "quaternion": [1,0,0,0]}});
        let n = normalize(&raw);
        assert_eq!(n.kind, "imu_data");
        assert_eq!(n.data["time"], 1.0);
    }

    #[test]
    fn encoder_becomes_encoder_data() {
        let raw = json!({"type": "encoder", "data": [10.0, 20.0, 30.0]});
        let n = normalize(&raw);
        assert_eq!(n.kind, "encoder_data");
        assert_eq!(n.data, json!([10.0, 20.0, 30.0]));
    }

    #[test]
    fn log_defaults_level_to_debug() {
        let raw = json!({"type": "log", "message": "hello"});
        let n = normalize(&raw);
        assert_eq!(n.kind, "log");
        assert_eq!(n.message.as_deref(), Some("hello"));
        assert_eq!(n.level.as_deref(), Some("debug"));
    }

    #[test]
    fn log_honors_explicit_level() {
        let raw = json!({"type": "log", "message": "uh oh", "level": "error"});
        let n = normalize(&raw);
        assert_eq!(n.level.as_deref(), Some("error"));
    }

    #[test]
    fn registration_pulls_top_level_fields() {
        let raw = json!({"type": "registration", "capabilities": ["camera"], "robot_reported_id": "rb-9"});
        let n = normalize(&raw);
        assert_eq!(n.kind, "registration");
        assert_eq!(n.data["capabilities"], json!(["camera"]));
        assert_eq!(n.data["robot_reported_id"], "rb-9");
    }

    #[test]
    fn unrecognized_type_becomes_generic() {
        let raw = json!({"type": "battery", "data": {"volts": 7.4}});
        let n = normalize(&raw);
        assert_eq!(n.kind, "generic_battery");
        assert_eq!(n.data, raw);
    }

    #[test]
    fn missing_type_becomes_unknown() {
        let raw = json!({"foo": "bar"});
        let n = normalize(&raw);
        assert_eq!(n.kind, "unknown_json_data");
        assert_eq!(n.data, raw);
    }
}
