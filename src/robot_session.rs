// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One task per connected robot: registers it, pushes cached PID gains,
//! then reads NDJSON frames until EOF, an I/O error, or a 60s idle
//! timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::normalizer;
use crate::pose::PoseEstimator;
use crate::protocol::{Envelope, RealtimeTrajectoryEvent, RobotAction};
use crate::registry::{OutboundFrame, RobotSnapshot};
use crate::state::{now_secs, AppState};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const PID_PUSH_SPACING: Duration = Duration::from_millis(50);

pub async fn run(stream: TcpStream, addr: SocketAddr, state: Arc<AppState>) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<OutboundFrame>(256);

    let writer_task = tokio::spawn(writer_loop(write_half, rx));

    let (alias, token) = state.registry.register(addr.ip(), addr.port(), tx.clone());
    info!("robot {addr} connected as {alias}");

    let _ = tx
        .send(OutboundFrame::Json(json!({"status": "success"})))
        .await;
    let _ = tx
        .send(OutboundFrame::Json(json!({
            "type": "connection_ack",
            "robot_alias": alias,
            "status": "success",
        })))
        .await;

    state
        .router
        .broadcast_all(
            serde_json::to_value(&crate::protocol::ServerEvent::AvailableRobotUpdate {
                action: RobotAction::Add,
                robot: RobotSnapshot {
                    alias: alias.clone(),
                    ip: addr.ip().to_string(),
                    port: addr.port(),
                },
            })
            .expect("ServerEvent always serializes"),
        )
        .await;

    push_pid_cache(&state, &tx).await;

    let unique_key = crate::logsink::LogSink::unique_key(&addr.ip().to_string(), addr.port());
    let mut pose = PoseEstimator::new();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match timeout(IDLE_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(l))) => l,
            Ok(Ok(None)) => {
                info!("robot {alias} disconnected (EOF)");
                break;
            }
            Ok(Err(e)) => {
                warn!("robot {alias} read error: {e}");
                break;
            }
            Err(_elapsed) => {
                info!("robot {alias} idle for {IDLE_TIMEOUT:?}, closing");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let raw: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("robot {alias} sent malformed JSON: {e}");
                continue;
            }
        };

        handle_frame(&state, &alias, &addr, &unique_key, &raw, &mut pose).await;
    }

    writer_task.abort();
    state.registry.unregister(addr.ip(), addr.port(), token);
    state.log_sink.close(&unique_key);
    state.trajectory_cache.lock().unwrap().remove(&alias);

    state
        .router
        .broadcast_all(
            serde_json::to_value(&crate::protocol::ServerEvent::AvailableRobotUpdate {
                action: RobotAction::Remove,
                robot: RobotSnapshot {
                    alias: alias.clone(),
                    ip: addr.ip().to_string(),
                    port: addr.port(),
                },
            })
            .expect("ServerEvent always serializes"),
        )
        .await;
}

async fn handle_frame(
    state: &Arc<AppState>,
    alias: &str,
    addr: &SocketAddr,
    unique_key: &str,
    raw: &Value,
    pose: &mut PoseEstimator,
) {
    let ts = raw
        .get("timestamp")
        .and_then(Value::as_f64)
        .unwrap_or_else(now_secs);

    let normalized = normalizer::normalize(raw);

    let log_result = if normalized.kind == "log" {
        state.log_sink.record_log(unique_key, ts, normalized.message.as_deref().unwrap_or(""))
    } else {
        state.log_sink.record(unique_key, &normalized.kind, ts, &normalized.data)
    };
    if let Err(e) = log_result {
        warn!("failed to log {} frame for {alias}: {e}", normalized.kind);
    }

    let mut trajectory_event = None;

    match normalized.kind.as_str() {
        "imu_data" => {
            if let Some(yaw) = extract_yaw(&normalized.data) {
                if let Some(snapshot) = pose.on_imu(yaw, now_secs()) {
                    state
                        .trajectory_cache
                        .lock()
                        .unwrap()
                        .insert(alias.to_string(), snapshot);
                }
            } else {
                debug!("imu_data frame from {alias} missing yaw/euler[2]");
            }
        }
        "encoder_data" => {
            if let Some(rpms) = extract_rpms(&normalized.data) {
                if let Some(snapshot) = pose.on_encoder(rpms, ts, now_secs()) {
                    state
                        .trajectory_cache
                        .lock()
                        .unwrap()
                        .insert(alias.to_string(), snapshot.clone());

                    if let Err(e) =
                        state
                            .log_sink
                            .record_position(unique_key, ts, snapshot.position)
                    {
                        warn!("failed to log position_update for {alias}: {e}");
                    }
                    trajectory_event = Some(RealtimeTrajectoryEvent::new(
                        alias.to_string(),
                        addr.ip().to_string(),
                        snapshot.position,
                        snapshot.path,
                    ));
                }
            } else {
                warn!("encoder_data frame from {alias} is not a 3-element RPM array");
            }
        }
        _ => {}
    }

    let envelope = Envelope {
        kind: normalized.kind.clone(),
        robot_ip: addr.ip().to_string(),
        robot_alias: alias.to_string(),
        timestamp: ts,
        data: normalized.data,
        message: normalized.message,
        level: normalized.level,
    };
    let kind = envelope.kind.clone();
    state
        .router
        .broadcast(
            alias,
            &kind,
            serde_json::to_value(&envelope).expect("envelope always serializes"),
        )
        .await;

    // Sent after the envelope broadcast above, never before.
    if let Some(event) = trajectory_event {
        state
            .router
            .broadcast(
                alias,
                "realtime_trajectory",
                serde_json::to_value(&event).expect("event always serializes"),
            )
            .await;
    }
}

async fn push_pid_cache(state: &Arc<AppState>, tx: &mpsc::Sender<OutboundFrame>) {
    let entries: Vec<_> = {
        let cache = state.pid_cache.lock().unwrap();
        cache.iter().copied().collect()
    };
    for entry in entries {
        if tx.send(OutboundFrame::Text(entry.wire_line())).await.is_err() {
            break;
        }
        tokio::time::sleep(PID_PUSH_SPACING).await;
    }
}

fn extract_yaw(data: &Value) -> Option<f64> {
    data.get("yaw")
        .and_then(Value::as_f64)
        .or_else(|| data.get("euler").and_then(Value::as_array)?.get(2)?.as_f64())
}

fn extract_rpms(data: &Value) -> Option<[f64; 3]> {
    let arr = data.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    Some([arr[0].as_f64()?, arr[1].as_f64()?, arr[2].as_f64()?])
}

async fn writer_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let result = match frame {
            OutboundFrame::Text(s) => write_half.write_all(s.as_bytes()).await,
            OutboundFrame::Json(v) => {
                let mut line = v.to_string();
                line.push('\n');
                write_half.write_all(line.as_bytes()).await
            }
        };
        if let Err(e) = result {
            warn!("robot write error: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_yaw_prefers_explicit_yaw_field() {
        let data = json!({"yaw": 1.5, "euler": [0.0, 0.0, 9.0]});
        assert_eq!(extract_yaw(&data), Some(1.5));
    }

    #[test]
    fn extract_yaw_falls_back_to_euler_index_2() {
        let data = json!({"euler": [0.0, 0.0, 9.0]});
        assert_eq!(extract_yaw(&data), Some(9.0));
    }

    #[test]
    fn extract_rpms_requires_exactly_three_elements() {
        assert_eq!(extract_rpms(&json!([1.0, 2.0, 3.0])), Some([1.0, 2.0, 3.0]));
        assert_eq!(extract_rpms(&json!([1.0, 2.0])), None);
        assert_eq!(extract_rpms(&json!("not an array")), None);
    }
}
