// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared application state handed to every session task as `Arc<AppState>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{Args, PidCache};
use crate::firmware::{FirmwareRegistry, OtaArm};
use crate::logsink::LogSink;
use crate::pose::PoseSnapshot;
use crate::registry::Registry;
use crate::router::SubscriptionRouter;

pub struct AppState {
    pub registry: Registry,
    pub router: SubscriptionRouter,
    pub log_sink: LogSink,
    pub firmware: FirmwareRegistry,
    /// Shared separately (not just via `Arc<AppState>`) so the always-on
    /// OTA server task can hold just the arm state, not the registry,
    /// router, and log sink too.
    pub ota_arm: Arc<OtaArm>,
    pub pid_cache: Mutex<PidCache>,
    /// Most recent pose snapshot per robot alias, updated by each robot's
    /// own session task on every successful integration; read by
    /// `request_trajectory` so a UI client can fetch a one-shot snapshot
    /// without first subscribing to `realtime_trajectory`.
    pub trajectory_cache: Mutex<HashMap<String, PoseSnapshot>>,
    pub config: Args,
}

impl AppState {
    pub fn new(config: Args) -> std::io::Result<Self> {
        let pid_cache = PidCache::load(std::path::Path::new(&config.pid_config_file))
            .unwrap_or_else(|e| {
                tracing::warn!("failed to load PID config: {e}");
                PidCache::default()
            });

        Ok(Self {
            registry: Registry::new(),
            router: SubscriptionRouter::new(),
            log_sink: LogSink::new(&config.log_directory, session_stamp())?,
            firmware: FirmwareRegistry::new(&config.temp_firmware_dir)?,
            ota_arm: Arc::new(OtaArm::new()),
            pid_cache: Mutex::new(pid_cache),
            trajectory_cache: Mutex::new(HashMap::new()),
            config,
        })
    }
}

/// Seconds since the Unix epoch, fixed once at bridge startup and embedded
/// in every log filename for the life of the process (spec's "session
/// stamp"). Also reused as a plain wall-clock second count anywhere else a
/// fresh Unix timestamp is needed (e.g. temp firmware filenames), since
/// it's the same underlying computation.
pub fn session_stamp() -> u64 {
    unix_timestamp()
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
