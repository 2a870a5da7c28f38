// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One task per connected browser: dispatches the 13 control-channel
//! command verbs and forwards broadcast telemetry/events back out over
//! the same socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::ServerEvent;
use crate::registry::RobotHandle;
use crate::router::EntityKey;
use crate::state::{unix_timestamp, AppState};

const PID_PUSH_SPACING: Duration = Duration::from_millis(50);

/// A command handler failure, tagged with the UI reply shape it owes the
/// client (spec.md §7): an unknown or disconnected target robot always
/// gets `command_response{status:"error"}`; everything else gets the
/// generic `error` envelope.
enum HandlerError {
    UnknownTarget(String),
    Other(String),
}

impl HandlerError {
    fn into_event(self, command: &str) -> ServerEvent {
        match self {
            HandlerError::UnknownTarget(message) => ServerEvent::command_response_error(command, message),
            HandlerError::Other(message) => ServerEvent::error(Some(command.to_string()), message),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Other(message)
    }
}

pub struct ClientSession {
    state: Arc<AppState>,
    client_id: SocketAddr,
}

impl ClientSession {
    pub fn new(state: Arc<AppState>, client_id: SocketAddr) -> Self {
        Self { state, client_id }
    }

    pub async fn run(self, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Value>(256);

        self.state.router.add_client(self.client_id, tx.clone());

        let robots = self.state.registry.snapshot();
        let _ = tx
            .send(serde_json::to_value(ServerEvent::InitialRobotList { robots }).unwrap())
            .await;

        let forward = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                if ws_tx.send(Message::Text(value.to_string())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    self.handle_message(&text, &tx).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
                Err(e) => {
                    warn!("client {} websocket error: {e}", self.client_id);
                    break;
                }
            }
        }

        forward.abort();
        self.state.router.remove_client(&self.client_id);
        info!("UI client {} disconnected", self.client_id);
    }

    async fn handle_message(&self, text: &str, tx: &mpsc::Sender<Value>) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                let _ = send(tx, ServerEvent::error(None, format!("Invalid JSON: {e}"))).await;
                return;
            }
        };

        let command = value.get("command").and_then(Value::as_str).unwrap_or("").to_string();

        let result: Result<ServerEvent, HandlerError> = match command.as_str() {
            "get_available_robots" => self.handle_get_available_robots(&command).await,
            "subscribe" => self.handle_subscribe(&value, &command, true),
            "unsubscribe" => self.handle_subscribe(&value, &command, false),
            "direct_subscribe" => self.handle_direct_subscribe(&value, &command, true),
            "direct_unsubscribe" => self.handle_direct_subscribe(&value, &command, false),
            "send_to_robot" => self.handle_send_to_robot(&value, &command).await,
            "upgrade_signal" => self.handle_upgrade_signal(&value, &command).await,
            "trigger_robot_pid_task" => self.handle_trigger_pid_task(&value, &command).await,
            "load_pid_config" => self.handle_load_pid_config(&value, &command).await,
            "request_trajectory" => self.handle_request_trajectory(&value, &command),
            "upload_firmware_start" => self.handle_upload_firmware_start(&value, &command),
            "firmware_data_chunk" => self.handle_firmware_chunk(&value, &command),
            "upload_firmware_end" => self.handle_upload_firmware_end(&value, &command),
            other => Err(HandlerError::Other(format!("Unknown command: {other}"))),
        };

        match result {
            Ok(event) => {
                let _ = send(tx, event).await;
            }
            Err(err) => {
                let _ = send(tx, err.into_event(&command)).await;
            }
        }
    }

    async fn handle_get_available_robots(&self, command: &str) -> Result<ServerEvent, HandlerError> {
        Ok(ServerEvent::ConnectedRobotsList {
            original_command: command.to_string(),
            robots: self.state.registry.snapshot(),
        })
    }

    fn handle_subscribe(&self, value: &Value, command: &str, subscribe: bool) -> Result<ServerEvent, HandlerError> {
        let data_type = required_str(value, "type")?;
        let robot_alias = required_str(value, "robot_alias")?;
        if self.state.registry.lookup_by_alias(&robot_alias).is_none() {
            return Err(HandlerError::UnknownTarget(format!("Unknown robot alias: {robot_alias}")));
        }
        let entity = EntityKey::Robot(robot_alias);
        if subscribe {
            self.state.router.subscribe(&self.client_id, entity, &data_type);
        } else {
            self.state.router.unsubscribe(&self.client_id, &entity, &data_type);
        }
        Ok(ServerEvent::ack(command))
    }

    /// Like `subscribe`/`unsubscribe`, but resolves the target from
    /// `robot_ip`/`robot_alias` (alias preferred when both are present)
    /// and falls back to the `GLOBAL` sentinel when neither is given.
    fn handle_direct_subscribe(&self, value: &Value, command: &str, subscribe: bool) -> Result<ServerEvent, HandlerError> {
        let data_type = required_str(value, "type")?;
        let entity = self.resolve_entity_or_global(value)?;
        if subscribe {
            self.state.router.subscribe(&self.client_id, entity, &data_type);
        } else {
            self.state.router.unsubscribe(&self.client_id, &entity, &data_type);
        }
        Ok(ServerEvent::ack(command))
    }

    async fn handle_send_to_robot(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let handle = self.resolve_robot(value)?;
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);

        if payload.get("type").and_then(Value::as_str) == Some("pid_values") {
            let line = format!(
                "MOTOR:{} Kp:{} Ki:{} Kd:{}",
                payload.get("motor_id").and_then(Value::as_u64).unwrap_or(0),
                payload.get("kp").and_then(Value::as_f64).unwrap_or(0.0),
                payload.get("ki").and_then(Value::as_f64).unwrap_or(0.0),
                payload.get("kd").and_then(Value::as_f64).unwrap_or(0.0),
            );
            if handle
                .sender
                .send(crate::registry::OutboundFrame::Text(line))
                .await
                .is_err()
            {
                return Err(HandlerError::UnknownTarget(format!("robot {} is no longer connected", handle.alias)));
            }
            return Ok(ServerEvent::command_response_ok(command));
        }

        if handle
            .sender
            .send(crate::registry::OutboundFrame::Json(payload))
            .await
            .is_err()
        {
            return Err(HandlerError::UnknownTarget(format!("robot {} is no longer connected", handle.alias)));
        }
        Ok(ServerEvent::command_response_ok(command))
    }

    async fn handle_upgrade_signal(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let handle = self.resolve_robot(value)?;
        if handle
            .sender
            .send(crate::registry::OutboundFrame::Text("Upgrade".to_string()))
            .await
            .is_err()
        {
            return Err(HandlerError::UnknownTarget(format!("robot {} is no longer connected", handle.alias)));
        }
        Ok(ServerEvent::command_response_ok(command))
    }

    async fn handle_trigger_pid_task(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let handle = self.resolve_robot(value)?;
        if handle
            .sender
            .send(crate::registry::OutboundFrame::Text("Set PID".to_string()))
            .await
            .is_err()
        {
            return Err(HandlerError::UnknownTarget(format!("robot {} is no longer connected", handle.alias)));
        }
        Ok(ServerEvent::command_response_ok(command))
    }

    /// Reloads the on-disk PID config and pushes every entry to the
    /// requested robot's TCP connection (mirrors `push_pid_cache` in
    /// `robot_session.rs`, run again on demand instead of just at connect).
    async fn handle_load_pid_config(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let handle = self.resolve_robot(value)?;

        let path = std::path::Path::new(&self.state.config.pid_config_file);
        let fresh = crate::config::PidCache::load(path).map_err(|e| e.to_string())?;
        let entries: Vec<crate::config::PidEntry> = fresh.iter().copied().collect();
        *self.state.pid_cache.lock().unwrap() = fresh;

        for entry in entries {
            if handle
                .sender
                .send(crate::registry::OutboundFrame::Text(entry.wire_line()))
                .await
                .is_err()
            {
                return Err(HandlerError::UnknownTarget(format!("robot {} is no longer connected", handle.alias)));
            }
            tokio::time::sleep(PID_PUSH_SPACING).await;
        }

        Ok(ServerEvent::command_response_ok(command))
    }

    fn handle_request_trajectory(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let handle = self.resolve_robot(value)?;
        let limit = value.get("limit").and_then(Value::as_u64).map(|n| n as usize);

        let cache = self.state.trajectory_cache.lock().unwrap();
        let snapshot = cache.get(&handle.alias).cloned().unwrap_or_default();
        drop(cache);

        let path = match limit {
            Some(n) if n < snapshot.path.len() => snapshot.path[snapshot.path.len() - n..].to_vec(),
            _ => snapshot.path,
        };

        Ok(ServerEvent::TrajectoryData {
            original_command: command.to_string(),
            robot_alias: handle.alias,
            position: snapshot.position,
            path,
        })
    }

    fn handle_upload_firmware_start(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let ip = required_ip(value)?;
        let filename = required_str(value, "filename")?;
        let filesize = value
            .get("filesize")
            .and_then(Value::as_u64)
            .ok_or_else(|| "upload_firmware_start requires filesize".to_string())?;

        self.state
            .firmware
            .start(ip, &filename, filesize, unix_timestamp())
            .map_err(|e| e.to_string())?;
        Ok(ServerEvent::ack(command))
    }

    fn handle_firmware_chunk(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let ip = required_ip(value)?;
        let data = required_str(value, "data")?;
        let received = self.state.firmware.chunk(ip, &data).map_err(|e| e.to_string())?;
        Ok(ServerEvent::FirmwareChunkAck {
            original_command: command.to_string(),
            received,
        })
    }

    fn handle_upload_firmware_end(&self, value: &Value, command: &str) -> Result<ServerEvent, HandlerError> {
        let ip = required_ip(value)?;
        let path = self.state.firmware.finish(ip).map_err(|e| e.to_string())?;
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        self.state.ota_arm.arm(path, ip);
        Ok(ServerEvent::FirmwarePreparedForOta {
            original_command: command.to_string(),
            firmware_size: size,
            status: "success".to_string(),
        })
    }

    fn resolve_robot(&self, value: &Value) -> Result<RobotHandle, HandlerError> {
        if let Some(alias) = value.get("robot_alias").and_then(Value::as_str) {
            return self
                .state
                .registry
                .lookup_by_alias(alias)
                .ok_or_else(|| HandlerError::UnknownTarget(format!("Unknown robot alias: {alias}")));
        }
        if let Some(ip_str) = value.get("robot_ip").and_then(Value::as_str) {
            let ip: std::net::IpAddr = ip_str
                .parse()
                .map_err(|_| HandlerError::Other(format!("Invalid robot_ip: {ip_str}")))?;
            return self
                .state
                .registry
                .lookup_by_ip(ip)
                .ok_or_else(|| HandlerError::UnknownTarget(format!("Unknown robot ip: {ip_str}")));
        }
        Err(HandlerError::Other("command requires robot_alias or robot_ip".to_string()))
    }

    /// Resolves `robot_alias`/`robot_ip` to a concrete robot entity, or the
    /// `GLOBAL` sentinel when neither is present — unlike `resolve_robot`,
    /// the absence of both fields is not an error here (spec §4.6:
    /// `direct_subscribe`/`direct_unsubscribe` with no target means
    /// GLOBAL).
    fn resolve_entity_or_global(&self, value: &Value) -> Result<EntityKey, HandlerError> {
        if value.get("robot_alias").is_none() && value.get("robot_ip").is_none() {
            return Ok(EntityKey::Global);
        }
        let handle = self.resolve_robot(value)?;
        Ok(EntityKey::Robot(handle.alias))
    }
}

async fn send(tx: &mpsc::Sender<Value>, event: ServerEvent) {
    let _ = tx.send(serde_json::to_value(event).expect("ServerEvent always serializes")).await;
}

fn required_str(value: &Value, field: &str) -> Result<String, String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing required field: {field}"))
}

fn required_ip(value: &Value) -> Result<std::net::IpAddr, String> {
    let raw = required_str(value, "robot_ip")?;
    raw.parse().map_err(|_| format!("invalid robot_ip: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::pose::{PathPoint, PoseSnapshot};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn test_state() -> (Arc<AppState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let args = Args {
            bind: "127.0.0.1".to_string(),
            tcp_port: 0,
            ws_port: 0,
            ota_port: 0,
            log_level: "info".to_string(),
            log_directory: dir.path().join("logs").to_string_lossy().into_owned(),
            pid_config_file: dir.path().join("missing_pid.txt").to_string_lossy().into_owned(),
            temp_firmware_dir: dir.path().join("firmware").to_string_lossy().into_owned(),
            frontend_origin: "http://localhost:5173".to_string(),
        };
        (Arc::new(AppState::new(args).unwrap()), dir)
    }

    fn client_id() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000)
    }

    fn message_of(err: HandlerError) -> String {
        match err {
            HandlerError::UnknownTarget(m) | HandlerError::Other(m) => m,
        }
    }

    #[test]
    fn subscribe_rejects_unknown_alias() {
        let (state, _dir) = test_state();
        let session = ClientSession::new(state, client_id());
        let value = json!({"type": "encoder_data", "robot_alias": "robot1"});
        let err = session.handle_subscribe(&value, "subscribe", true).unwrap_err();
        assert!(matches!(err, HandlerError::UnknownTarget(_)));
        assert!(message_of(err).contains("Unknown robot alias"));
    }

    #[test]
    fn direct_subscribe_with_no_target_resolves_to_global() {
        let (state, _dir) = test_state();
        let session = ClientSession::new(state, client_id());
        let entity = session.resolve_entity_or_global(&json!({})).unwrap();
        assert_eq!(entity, EntityKey::Global);
    }

    #[tokio::test]
    async fn send_to_robot_pid_values_writes_motor_line() {
        let (state, _dir) = test_state();
        let (tx, mut rx) = mpsc::channel(8);
        let (alias, _token) = state.registry.register(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            55000,
            tx,
        );
        let session = ClientSession::new(state, client_id());

        let value = json!({
            "robot_alias": alias,
            "payload": {"type": "pid_values", "motor_id": 2, "kp": 1.5, "ki": 0.2, "kd": 0.01},
        });
        session.handle_send_to_robot(&value, "send_to_robot").await.unwrap();

        match rx.recv().await.unwrap() {
            crate::registry::OutboundFrame::Text(line) => {
                assert_eq!(line, "MOTOR:2 Kp:1.5 Ki:0.2 Kd:0.01");
            }
            other => panic!("expected a Text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_robot_unknown_target_is_an_error() {
        let (state, _dir) = test_state();
        let session = ClientSession::new(state, client_id());
        let value = json!({"robot_alias": "robot99", "payload": {"type": "generic"}});
        let err = session.handle_send_to_robot(&value, "send_to_robot").await.unwrap_err();
        assert!(matches!(err, HandlerError::UnknownTarget(_)));
        assert!(message_of(err).contains("Unknown robot alias"));
    }

    #[test]
    fn request_trajectory_applies_limit_to_path_tail() {
        let (state, _dir) = test_state();
        let (tx, _rx) = mpsc::channel(8);
        let (alias, _token) = state.registry.register(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)),
            55001,
            tx,
        );
        let path: Vec<PathPoint> = (0..5)
            .map(|i| PathPoint { x: i as f64, y: 0.0, theta: 0.0 })
            .collect();
        state.trajectory_cache.lock().unwrap().insert(
            alias.clone(),
            PoseSnapshot { position: *path.last().unwrap(), path: path.clone() },
        );
        let session = ClientSession::new(state, client_id());

        let value = json!({"robot_alias": alias, "limit": 2});
        let event = session.handle_request_trajectory(&value, "request_trajectory").unwrap();
        match event {
            ServerEvent::TrajectoryData { path, .. } => {
                assert_eq!(path, vec![PathPoint { x: 3.0, y: 0.0, theta: 0.0 }, PathPoint { x: 4.0, y: 0.0, theta: 0.0 }]);
            }
            other => panic!("expected TrajectoryData, got {other:?}"),
        }
    }

    #[test]
    fn request_trajectory_with_no_cached_pose_returns_default_snapshot() {
        let (state, _dir) = test_state();
        let (tx, _rx) = mpsc::channel(8);
        let (alias, _token) = state.registry.register(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
            55002,
            tx,
        );
        let session = ClientSession::new(state, client_id());
        let value = json!({"robot_alias": alias});
        let event = session.handle_request_trajectory(&value, "request_trajectory").unwrap();
        match event {
            ServerEvent::TrajectoryData { position, path, .. } => {
                assert_eq!(position, PathPoint { x: 0.0, y: 0.0, theta: 0.0 });
                assert!(path.is_empty());
            }
            other => panic!("expected TrajectoryData, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_pid_config_pushes_reloaded_entries_to_target_robot() {
        let dir = TempDir::new().unwrap();
        let pid_path = dir.path().join("pid.txt");
        std::fs::write(&pid_path, "Motor1:1.0,0.1,0.01\nMotor2:2.0,0.2,0.02\n").unwrap();

        let args = Args {
            bind: "127.0.0.1".to_string(),
            tcp_port: 0,
            ws_port: 0,
            ota_port: 0,
            log_level: "info".to_string(),
            log_directory: dir.path().join("logs").to_string_lossy().into_owned(),
            pid_config_file: pid_path.to_string_lossy().into_owned(),
            temp_firmware_dir: dir.path().join("firmware").to_string_lossy().into_owned(),
            frontend_origin: "http://localhost:5173".to_string(),
        };
        let state = Arc::new(AppState::new(args).unwrap());

        let (tx, mut rx) = mpsc::channel(8);
        let (alias, _token) = state.registry.register(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)),
            55003,
            tx,
        );
        let session = ClientSession::new(state, client_id());

        let value = json!({"robot_alias": alias});
        session.handle_load_pid_config(&value, "load_pid_config").await.unwrap();

        let mut lines = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                crate::registry::OutboundFrame::Text(line) => lines.push(line),
                other => panic!("expected a Text frame, got {other:?}"),
            }
        }
        assert_eq!(lines, vec!["MOTOR:1 Kp:1 Ki:0.1 Kd:0.01", "MOTOR:2 Kp:2 Ki:0.2 Kd:0.02"]);
    }

    #[tokio::test]
    async fn load_pid_config_requires_a_target_robot() {
        let (state, _dir) = test_state();
        let session = ClientSession::new(state, client_id());
        let err = session
            .handle_load_pid_config(&json!({}), "load_pid_config")
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Other(_)));
    }
}
