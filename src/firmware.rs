// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Firmware staging: reassembles base64-encoded chunks pushed over the WS
//! control channel into a temp file, one upload in flight per robot IP.

use std::collections::HashMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;

use crate::error::BridgeError;

struct InProgressUpload {
    path: PathBuf,
    filesize: u64,
    received: u64,
    file: std::fs::File,
}

#[derive(Default)]
pub struct FirmwareRegistry {
    uploads: Mutex<HashMap<IpAddr, InProgressUpload>>,
    directory: PathBuf,
}

impl FirmwareRegistry {
    pub fn new(directory: impl Into<PathBuf>) -> std::io::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            uploads: Mutex::new(HashMap::new()),
            directory,
        })
    }

    /// Starts a new upload for `ip`, discarding any upload already in
    /// progress for that address (a second `upload_firmware_start`
    /// supersedes the first).
    pub fn start(&self, ip: IpAddr, filename: &str, filesize: u64, stamp: u64) -> Result<(), BridgeError> {
        let safe_name = sanitize_filename(filename);
        let path = self.directory.join(format!("{ip}_{stamp}_{safe_name}"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        self.uploads.lock().unwrap().insert(
            ip,
            InProgressUpload {
                path,
                filesize,
                received: 0,
                file,
            },
        );
        Ok(())
    }

    /// Decodes and appends one base64 chunk, returning the cumulative
    /// number of bytes received so far.
    pub fn chunk(&self, ip: IpAddr, base64_data: &str) -> Result<u64, BridgeError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(base64_data)?;
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(&ip)
            .ok_or_else(|| BridgeError::NoFirmwareUpload(ip.to_string()))?;
        upload.file.write_all(&bytes)?;
        upload.received += bytes.len() as u64;
        Ok(upload.received)
    }

    /// Finalizes the upload, validating that the full declared size was
    /// received. On success, returns the completed file's path, ready to
    /// be armed for OTA delivery.
    pub fn finish(&self, ip: IpAddr) -> Result<PathBuf, BridgeError> {
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .remove(&ip)
            .ok_or_else(|| BridgeError::NoFirmwareUpload(ip.to_string()))?;
        upload.file.sync_all()?;

        if upload.received != upload.filesize {
            return Err(BridgeError::FirmwareSizeMismatch {
                ip: ip.to_string(),
                expected: upload.filesize,
                received: upload.received,
            });
        }
        Ok(upload.path)
    }
}

fn sanitize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firmware.bin".to_string())
}

/// The single armed firmware image awaiting delivery over the OTA TCP
/// server, one at a time across the whole bridge.
#[derive(Default)]
pub struct OtaArm {
    armed: Mutex<Option<(PathBuf, IpAddr)>>,
}

impl OtaArm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `path` for `ip`, replacing any previous arm unconditionally.
    pub fn arm(&self, path: PathBuf, ip: IpAddr) {
        *self.armed.lock().unwrap() = Some((path, ip));
    }

    /// Consumes the arm iff it targets `peer_ip`; leaves it untouched
    /// otherwise (a connection from an unrelated IP must not steal or
    /// clear someone else's armed firmware).
    pub fn take_for(&self, peer_ip: IpAddr) -> Option<PathBuf> {
        let mut armed = self.armed.lock().unwrap();
        match armed.as_ref() {
            Some((_, ip)) if *ip == peer_ip => armed.take().map(|(path, _)| path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
    }

    #[test]
    fn reassembles_chunks_and_validates_size() {
        let dir = TempDir::new().unwrap();
        let registry = FirmwareRegistry::new(dir.path()).unwrap();
        let payload = b"firmware-bytes";
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);

        registry.start(ip(), "fw.bin", payload.len() as u64, 1).unwrap();
        let received = registry.chunk(ip(), &encoded).unwrap();
        assert_eq!(received, payload.len() as u64);

        let path = registry.finish(ip()).unwrap();
        let on_disk = std::fs::read(path).unwrap();
        assert_eq!(on_disk, payload);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let dir = TempDir::new().unwrap();
        let registry = FirmwareRegistry::new(dir.path()).unwrap();
        registry.start(ip(), "fw.bin", 100, 1).unwrap();
        registry
            .chunk(ip(), &base64::engine::general_purpose::STANDARD.encode(b"short"))
            .unwrap();

        let err = registry.finish(ip()).unwrap_err();
        assert!(matches!(err, BridgeError::FirmwareSizeMismatch { .. }));
    }

    #[test]
    fn second_start_supersedes_first_upload() {
        let dir = TempDir::new().unwrap();
        let registry = FirmwareRegistry::new(dir.path()).unwrap();
        registry.start(ip(), "a.bin", 10, 1).unwrap();
        registry.start(ip(), "b.bin", 5, 2).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello");
        registry.chunk(ip(), &encoded).unwrap();
        let path = registry.finish(ip()).unwrap();
        assert!(path.to_string_lossy().contains("b.bin"));
    }

    #[test]
    fn ota_arm_is_only_consumed_by_matching_ip() {
        let arm = OtaArm::new();
        let other_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        arm.arm(PathBuf::from("/tmp/fw.bin"), ip());

        assert!(arm.take_for(other_ip).is_none());
        assert!(arm.take_for(ip()).is_some());
        assert!(arm.take_for(ip()).is_none());
    }
}
