// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-`(robot, data_type)` telemetry log files.
//!
//! File handles are opened lazily and kept for the life of the session,
//! mirroring `hdds-logger`'s `FileOutput`: `OpenOptions::append`, a
//! `BufWriter`, and a header line written exactly once, only when the file
//! is newly created or was empty.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

pub struct LogSink {
    directory: PathBuf,
    session_stamp: u64,
    files: Mutex<HashMap<(String, String), BufWriter<File>>>,
}

impl LogSink {
    pub fn new(directory: impl Into<PathBuf>, session_stamp: u64) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            session_stamp,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Filesystem-safe form of a robot's `(ip, port)` address, used in log
    /// file names.
    pub fn unique_key(ip: &str, port: u16) -> String {
        format!("{ip}_{port}").replace('.', "_").replace(':', "_")
    }

    fn writer_for<'a>(
        &self,
        files: &'a mut HashMap<(String, String), BufWriter<File>>,
        unique_key: &str,
        data_type: &str,
    ) -> io::Result<&'a mut BufWriter<File>> {
        let key = (unique_key.to_string(), data_type.to_string());
        if !files.contains_key(&key) {
            let filename = format!("{}_{}_{}.txt", data_type, unique_key, self.session_stamp);
            let path = self.directory.join(&filename);
            let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            if is_new {
                if let Some(header) = header_for(data_type) {
                    writeln!(writer, "{header}")?;
                    writer.flush()?;
                }
            }
            files.insert(key.clone(), writer);
        }
        Ok(files.get_mut(&key).unwrap())
    }

    /// Logs a normalized encoder/imu/generic frame (by `data_type`),
    /// extracting the columns its header format needs from `data` — the
    /// normalizer's `data` field for `imu_data`/`encoder_data` is the
    /// robot's own `data` payload verbatim, so accelerometer/gravity
    /// fields the robot includes alongside `euler`/`quaternion` are still
    /// present even though the canonical envelope's shape doesn't name them.
    pub fn record(&self, unique_key: &str, data_type: &str, ts: f64, data: &Value) -> io::Result<()> {
        let line = match data_type {
            "encoder_data" => format_encoder(ts, data),
            "imu_data" => format_imu(ts, data),
            other => format_generic(ts, other, data),
        };
        let mut files = self.files.lock().unwrap();
        let writer = self.writer_for(&mut files, unique_key, data_type)?;
        writeln!(writer, "{line}")?;
        writer.flush()
    }

    /// Logs a `log`-kind frame. Separate from [`LogSink::record`] because
    /// the normalizer carries a log frame's text in `message`, not `data`.
    pub fn record_log(&self, unique_key: &str, ts: f64, message: &str) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let writer = self.writer_for(&mut files, unique_key, "log")?;
        writeln!(writer, "{ts:.3} {message}")?;
        writer.flush()
    }

    pub fn record_position(&self, unique_key: &str, ts: f64, point: crate::pose::PathPoint) -> io::Result<()> {
        let line = format!("{:.3} {:.3} {:.3} {:.3}", ts, point.x, point.y, point.theta);
        let mut files = self.files.lock().unwrap();
        let writer = self.writer_for(&mut files, unique_key, "position_update")?;
        writeln!(writer, "{line}")?;
        writer.flush()
    }

    /// Closes every file opened for `unique_key` (called on robot
    /// disconnect).
    pub fn close(&self, unique_key: &str) {
        let mut files = self.files.lock().unwrap();
        files.retain(|(k, _), _| k != unique_key);
    }
}

fn header_for(data_type: &str) -> Option<&'static str> {
    match data_type {
        "encoder_data" => Some("Time RPM1 RPM2 RPM3"),
        "imu_data" => Some(
            "Time Heading Pitch Roll W X Y Z AccelX AccelY AccelZ GravityX GravityY GravityZ",
        ),
        "log" => Some("Time Message"),
        "position_update" => Some("Time X Y Theta"),
        _ => None,
    }
}

fn num(raw: &Value, key: &str, default: f64) -> f64 {
    raw.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn format_encoder(ts: f64, raw: &Value) -> String {
    let arr = raw.as_array();
    let at = |i: usize| arr.and_then(|a| a.get(i)).and_then(Value::as_f64).unwrap_or(0.0);
    format!("{:.3} {:.3} {:.3} {:.3}", ts, at(0), at(1), at(2))
}

fn format_imu(ts: f64, raw: &Value) -> String {
    let euler = raw.get("euler").and_then(Value::as_array);
    let euler_at = |i: usize, default: f64| {
        euler
            .and_then(|a| a.get(i))
            .and_then(Value::as_f64)
            .unwrap_or(default)
    };
    let heading = raw
        .get("heading")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| euler_at(0, 0.0));
    let pitch = raw
        .get("pitch")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| euler_at(1, 0.0));
    let roll = raw
        .get("roll")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| euler_at(2, 0.0));

    let quat = raw.get("quaternion").and_then(Value::as_array);
    let quat_at = |i: usize, default: f64| {
        quat.and_then(|a| a.get(i))
            .and_then(Value::as_f64)
            .unwrap_or(default)
    };
    let qw = raw.get("quat_w").and_then(Value::as_f64).unwrap_or_else(|| quat_at(0, 1.0));
    let qx = raw.get("quat_x").and_then(Value::as_f64).unwrap_or_else(|| quat_at(1, 0.0));
    let qy = raw.get("quat_y").and_then(Value::as_f64).unwrap_or_else(|| quat_at(2, 0.0));
    let qz = raw.get("quat_z").and_then(Value::as_f64).unwrap_or_else(|| quat_at(3, 0.0));

    format!(
        "{:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3} {:.3}",
        ts,
        heading,
        pitch,
        roll,
        qw,
        qx,
        qy,
        qz,
        num(raw, "lin_accel_x", 0.0),
        num(raw, "lin_accel_y", 0.0),
        num(raw, "lin_accel_z", 0.0),
        num(raw, "gravity_x", 0.0),
        num(raw, "gravity_y", 0.0),
        num(raw, "gravity_z", 0.0),
    )
}

fn format_generic(ts: f64, _data_type: &str, raw: &Value) -> String {
    format!("{:.3} {}", ts, raw)
}
