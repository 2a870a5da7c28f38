// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CLI arguments and the plain-text PID configuration cache.

use std::fs;
use std::io;
use std::path::Path;

use clap::Parser;
use tracing::warn;

use crate::error::BridgeError;

/// Robot telemetry bridge: TCP robots + WebSocket UI + OTA firmware delivery.
#[derive(Parser, Debug, Clone)]
#[command(name = "robot-bridge")]
#[command(about = "Bridges a robot fleet (TCP/NDJSON) to a browser UI (WebSocket/JSON)")]
#[command(version)]
pub struct Args {
    /// Bind address for all three listeners
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// TCP port robots connect to
    #[arg(long, env = "TCP_PORT", default_value = "12346")]
    pub tcp_port: u16,

    /// WebSocket port the browser UI connects to
    #[arg(long, env = "WS_BRIDGE_PORT", default_value = "9003")]
    pub ws_port: u16,

    /// TCP port the always-on firmware (OTA) server listens on
    #[arg(long, env = "OTA_PORT", default_value = "12345")]
    pub ota_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Directory per-session telemetry log files are written to
    #[arg(long, env = "LOG_DIRECTORY", default_value = "logs/bridge_logs")]
    pub log_directory: String,

    /// Plain-text PID config file pushed to robots on connect
    #[arg(long, env = "PID_CONFIG_FILE", default_value = "pid_config.txt")]
    pub pid_config_file: String,

    /// Scratch directory firmware chunks are reassembled into
    #[arg(long, env = "TEMP_FIRMWARE_DIR", default_value = "temp_firmware")]
    pub temp_firmware_dir: String,

    /// Origin allowed to open the WebSocket control channel (CORS)
    #[arg(long, env = "FRONTEND_ORIGIN", default_value = "http://localhost:5173")]
    pub frontend_origin: String,
}

/// One `Motor<n>:kp,ki,kd` entry loaded from the PID config file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidEntry {
    pub motor_id: u32,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidEntry {
    /// The plain-text line pushed to a robot's TCP socket (distinct from
    /// the `Motor<n>:kp,ki,kd` on-disk config format).
    pub fn wire_line(&self) -> String {
        format!("MOTOR:{} Kp:{} Ki:{} Kd:{}", self.motor_id, self.kp, self.ki, self.kd)
    }
}

/// The full set of PID gains pushed to a robot right after it registers.
#[derive(Debug, Clone, Default)]
pub struct PidCache {
    entries: Vec<PidEntry>,
}

impl PidCache {
    /// Loads PID entries from `path`. A missing file yields an empty cache
    /// (robots simply run with whatever gains they booted with); malformed
    /// lines are skipped with a warning rather than aborting the load.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "PID config file {} not found, starting with an empty cache",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_pid_line(line) {
                Some(entry) => entries.push(entry),
                None => warn!(
                    "skipping malformed PID config line {}: {:?}",
                    lineno + 1,
                    raw_line
                ),
            }
        }
        entries.sort_by_key(|e| e.motor_id);
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &PidEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_pid_line(line: &str) -> Option<PidEntry> {
    if let Some(rest) = line.strip_prefix("Motor") {
        let (n_str, vals) = rest.split_once(':')?;
        parse_fields(n_str, vals)
    } else {
        let (n_str, vals) = line.split_once(',')?;
        parse_fields(n_str, vals)
    }
}

fn parse_fields(n_str: &str, vals: &str) -> Option<PidEntry> {
    let motor_id = n_str.trim().parse().ok()?;
    let mut parts = vals.split(',');
    let kp = parts.next()?.trim().parse().ok()?;
    let ki = parts.next()?.trim().parse().ok()?;
    let kd = parts.next()?.trim().parse().ok()?;
    Some(PidEntry {
        motor_id,
        kp,
        ki,
        kd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_colon_form() {
        assert_eq!(
            parse_pid_line("Motor1:1.5,0.2,0.01"),
            Some(PidEntry {
                motor_id: 1,
                kp: 1.5,
                ki: 0.2,
                kd: 0.01
            })
        );
    }

    #[test]
    fn parses_comma_form() {
        assert_eq!(
            parse_pid_line("2,3.0,0.4,0.05"),
            Some(PidEntry {
                motor_id: 2,
                kp: 3.0,
                ki: 0.4,
                kd: 0.05
            })
        );
    }

    #[test]
    fn rejects_malformed_line() {
        assert_eq!(parse_pid_line("not a pid line"), None);
    }

    #[test]
    fn load_skips_comments_and_blanks_and_sorts_by_motor_id() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# pid gains").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "Motor2:1,1,1").unwrap();
        writeln!(file, "Motor1:2,2,2").unwrap();
        writeln!(file, "garbage line").unwrap();

        let cache = PidCache::load(file.path()).unwrap();
        let ids: Vec<u32> = cache.iter().map(|e| e.motor_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn missing_file_yields_empty_cache() {
        let cache = PidCache::load(Path::new("/nonexistent/pid_config.txt")).unwrap();
        assert!(cache.is_empty());
    }
}
