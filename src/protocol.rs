// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire types for both sides of the bridge: the robot-facing [`Envelope`]
//! broadcast over the WebSocket to subscribed UI clients, and the
//! UI-facing command/event shapes exchanged over the same socket.

use serde::Serialize;
use serde_json::Value;

use crate::pose::PathPoint;
use crate::registry::RobotSnapshot;

/// A normalized robot frame, stamped with identity and timing, as
/// broadcast to subscribed UI clients. `data`/`message`/`level` are
/// populated according to the frame's `kind` (see [`crate::normalizer`]).
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub robot_ip: String,
    pub robot_alias: String,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeTrajectoryEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub robot_alias: String,
    pub robot_ip: String,
    pub position: PathPoint,
    pub path: Vec<PathPoint>,
}

impl RealtimeTrajectoryEvent {
    pub fn new(robot_alias: String, robot_ip: String, position: PathPoint, path: Vec<PathPoint>) -> Self {
        Self {
            kind: "realtime_trajectory",
            robot_alias,
            robot_ip,
            position,
            path,
        }
    }
}

/// Proactive and reply events sent from the bridge to a UI client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AvailableRobotUpdate {
        action: RobotAction,
        robot: RobotSnapshot,
    },
    InitialRobotList {
        robots: Vec<RobotSnapshot>,
    },
    ConnectedRobotsList {
        original_command: String,
        robots: Vec<RobotSnapshot>,
    },
    TrajectoryData {
        original_command: String,
        robot_alias: String,
        position: PathPoint,
        path: Vec<PathPoint>,
    },
    FirmwareChunkAck {
        original_command: String,
        received: u64,
    },
    FirmwarePreparedForOta {
        original_command: String,
        firmware_size: u64,
        status: String,
    },
    CommandResponse {
        original_command: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Ack {
        original_command: String,
        status: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        original_command: Option<String>,
        message: String,
    },
}

impl ServerEvent {
    pub fn ack(original_command: impl Into<String>) -> Self {
        ServerEvent::Ack {
            original_command: original_command.into(),
            status: "success".to_string(),
        }
    }

    pub fn error(original_command: Option<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            original_command,
            message: message.into(),
        }
    }

    pub fn command_response_error(original_command: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::CommandResponse {
            original_command: original_command.into(),
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn command_response_ok(original_command: impl Into<String>) -> Self {
        ServerEvent::CommandResponse {
            original_command: original_command.into(),
            status: "success".to_string(),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_omits_null_data_and_absent_message_level() {
        let e = Envelope {
            kind: "registration".to_string(),
            robot_ip: "10.0.0.5".to_string(),
            robot_alias: "robot1".to_string(),
            timestamp: 1.0,
            data: json!({"capabilities": []}),
            message: None,
            level: None,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "registration");
        assert!(v.get("message").is_none());
    }

    #[test]
    fn ack_has_success_status() {
        let v = serde_json::to_value(ServerEvent::ack("subscribe")).unwrap();
        assert_eq!(v["type"], "ack");
        assert_eq!(v["status"], "success");
        assert_eq!(v["original_command"], "subscribe");
    }

    #[test]
    fn error_without_original_command_omits_field() {
        let v = serde_json::to_value(ServerEvent::error(None, "boom")).unwrap();
        assert_eq!(v["type"], "error");
        assert!(v.get("original_command").is_none());
    }
}
