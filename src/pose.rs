// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dead-reckoning pose fusion: encoder RPMs (for speed) + IMU yaw (for
//! heading), owned exclusively by the robot's own session task — no other
//! task ever touches a [`PoseEstimator`], so it needs no internal lock.

use std::collections::VecDeque;

use serde::Serialize;

const WHEEL_RADIUS: f64 = 0.0325;
const PATH_CAP: usize = 1000;
const MAX_DATA_AGE: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PathPoint {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoseSnapshot {
    pub position: PathPoint,
    pub path: Vec<PathPoint>,
}

impl Default for PoseSnapshot {
    fn default() -> Self {
        Self {
            position: PathPoint { x: 0.0, y: 0.0, theta: 0.0 },
            path: Vec::new(),
        }
    }
}

pub struct PoseEstimator {
    x: f64,
    y: f64,
    theta: f64,
    path: VecDeque<PathPoint>,

    latest_encoder: Option<[f64; 3]>,
    latest_encoder_payload_ts: Option<f64>,
    latest_encoder_arrival: Option<f64>,

    latest_imu_yaw: Option<f64>,
    latest_imu_arrival: Option<f64>,

    /// The encoder payload timestamp the last successful integration
    /// advanced from; used purely for the `dt` calculation (distinct from
    /// the wall-clock arrival timestamps used for freshness checks).
    last_encoder_ts: Option<f64>,
}

impl PoseEstimator {
    pub fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            path: VecDeque::new(),
            latest_encoder: None,
            latest_encoder_payload_ts: None,
            latest_encoder_arrival: None,
            latest_imu_yaw: None,
            latest_imu_arrival: None,
            last_encoder_ts: None,
        }
    }

    fn current_point(&self) -> PathPoint {
        PathPoint {
            x: self.x,
            y: self.y,
            theta: self.theta,
        }
    }

    fn push_path(&mut self) {
        self.path.push_back(self.current_point());
        if self.path.len() > PATH_CAP {
            self.path.pop_front();
        }
    }

    fn snapshot(&self) -> PoseSnapshot {
        PoseSnapshot {
            position: self.current_point(),
            path: self.path.iter().copied().collect(),
        }
    }

    /// Updates heading from a new IMU yaw sample and attempts integration.
    /// Returns `None` until an encoder sample has also been observed at
    /// least once.
    pub fn on_imu(&mut self, yaw: f64, now: f64) -> Option<PoseSnapshot> {
        self.theta = yaw;
        self.latest_imu_yaw = Some(yaw);
        self.latest_imu_arrival = Some(now);
        self.try_integrate()
    }

    /// Updates speed inputs from a new encoder sample and attempts
    /// integration. `payload_ts` is the encoder frame's own timestamp
    /// (robot-reported, falling back to wall clock), used for `dt`.
    /// Returns `None` until an IMU sample has also been observed at least
    /// once.
    pub fn on_encoder(&mut self, rpms: [f64; 3], payload_ts: f64, now: f64) -> Option<PoseSnapshot> {
        self.latest_encoder = Some(rpms);
        self.latest_encoder_payload_ts = Some(payload_ts);
        self.latest_encoder_arrival = Some(now);
        self.try_integrate()
    }

    fn try_integrate(&mut self) -> Option<PoseSnapshot> {
        let rpms = self.latest_encoder?;
        self.latest_imu_yaw?;

        let imu_arrival = self.latest_imu_arrival?;
        let encoder_arrival = self.latest_encoder_arrival?;
        let now = imu_arrival.max(encoder_arrival);

        let imu_fresh = now - imu_arrival <= MAX_DATA_AGE;
        let encoder_fresh = now - encoder_arrival <= MAX_DATA_AGE;
        if !imu_fresh || !encoder_fresh {
            // Stale: report the current pose but do not integrate or touch
            // last_encoder_ts.
            return Some(self.snapshot());
        }

        let te = self
            .latest_encoder_payload_ts
            .expect("payload ts set alongside latest_encoder");

        let last_ts = match self.last_encoder_ts {
            None => {
                // First encoder frame only seeds last_encoder_ts; it never
                // moves the pose.
                self.last_encoder_ts = Some(te);
                if self.path.is_empty() {
                    self.push_path();
                }
                return Some(self.snapshot());
            }
            Some(t) => t,
        };

        let dt = te - last_ts;
        if dt <= 0.0 {
            // Heading (theta) was already refreshed above; position does
            // not advance on a non-positive or repeated timestamp.
            return Some(self.snapshot());
        }

        let omega: Vec<f64> = rpms
            .iter()
            .map(|rpm| rpm * std::f64::consts::TAU / 60.0)
            .collect();
        let v_body = WHEEL_RADIUS * (omega[0] + omega[1] + omega[2]) / 3.0;

        let theta_prev = self.theta;
        self.x += v_body * theta_prev.cos() * dt;
        self.y += v_body * theta_prev.sin() * dt;
        self.last_encoder_ts = Some(te);

        self.push_path();
        Some(self.snapshot())
    }
}

impl Default for PoseEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_output_until_both_modalities_seen() {
        let mut pose = PoseEstimator::new();
        assert!(pose.on_imu(0.0, 1.0).is_none());
    }

    #[test]
    fn first_encoder_frame_only_seeds_timestamp() {
        let mut pose = PoseEstimator::new();
        pose.on_imu(0.0, 1.0);
        let snap = pose.on_encoder([0.0, 0.0, 0.0], 10.0, 1.0).unwrap();
        assert_eq!(snap.position, PathPoint { x: 0.0, y: 0.0, theta: 0.0 });
        assert_eq!(snap.path.len(), 1);
    }

    #[test]
    fn non_positive_dt_refreshes_heading_but_not_position() {
        let mut pose = PoseEstimator::new();
        pose.on_imu(0.0, 1.0);
        pose.on_encoder([100.0, 100.0, 100.0], 10.0, 1.0);

        let snap = pose.on_imu(1.5, 1.1).unwrap();
        assert_eq!(snap.position.theta, 1.5);

        // Same payload timestamp again: dt == 0, must not move.
        let before = (snap.position.x, snap.position.y);
        let snap2 = pose.on_encoder([100.0, 100.0, 100.0], 10.0, 1.2).unwrap();
        assert_eq!((snap2.position.x, snap2.position.y), before);
        assert_eq!(snap2.position.theta, 1.5);
    }

    #[test]
    fn integrates_forward_motion_along_heading() {
        let mut pose = PoseEstimator::new();
        pose.on_imu(0.0, 1.0);
        pose.on_encoder([0.0, 0.0, 0.0], 10.0, 1.0);

        // theta = 0 -> pure +x motion.
        let snap = pose.on_encoder([200.0, 200.0, 200.0], 11.0, 2.0).unwrap();
        assert!(snap.position.x > 0.0);
        assert!(snap.position.y.abs() < 1e-9);
        assert_eq!(snap.path.len(), 2);
    }

    #[test]
    fn stale_data_beyond_freshness_window_does_not_integrate() {
        let mut pose = PoseEstimator::new();
        pose.on_imu(0.0, 1.0);
        pose.on_encoder([0.0, 0.0, 0.0], 10.0, 1.0);

        // IMU sample now far too old relative to a fresh encoder arrival.
        let snap = pose.on_encoder([500.0, 500.0, 500.0], 20.0, 100.0).unwrap();
        assert_eq!(snap.position, PathPoint { x: 0.0, y: 0.0, theta: 0.0 });
    }

    #[test]
    fn path_is_capped_at_1000_points() {
        let mut pose = PoseEstimator::new();
        pose.on_imu(0.0, 0.0);
        let mut ts = 0.0;
        for _ in 0..1100 {
            ts += 1.0;
            pose.on_encoder([10.0, 10.0, 10.0], ts, ts);
        }
        let snap = pose.on_encoder([10.0, 10.0, 10.0], ts + 1.0, ts + 1.0).unwrap();
        assert_eq!(snap.path.len(), PATH_CAP);
    }
}
