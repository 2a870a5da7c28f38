// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Always-on firmware delivery server. Structurally the bare-TCP analogue
//! of the WebSocket accept loop in `main.rs`: one listener, one task per
//! connection, no framing beyond a fixed 1024-byte chunk size.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::firmware::OtaArm;

const CHUNK_SIZE: usize = 1024;

pub async fn run_ota_server(listener: TcpListener, ota_arm: Arc<OtaArm>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("OTA accept error: {e}");
                continue;
            }
        };
        let ota_arm = ota_arm.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer.ip(), ota_arm).await {
                warn!("OTA session with {peer} failed: {e}");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer_ip: std::net::IpAddr,
    ota_arm: Arc<OtaArm>,
) -> std::io::Result<()> {
    let Some(path) = ota_arm.take_for(peer_ip) else {
        info!("OTA connection from {peer_ip} with no armed firmware, closing");
        return Ok(());
    };

    let mut file = tokio::fs::File::open(&path).await?;
    let mut buf = [0u8; CHUNK_SIZE];
    let mut sent = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tokio::io::AsyncWriteExt::write_all(&mut stream, &buf[..n]).await?;
        sent += n as u64;
    }

    info!("streamed {sent} bytes of firmware to {peer_ip}");
    let _ = tokio::fs::remove_file(&path).await;
    Ok(())
}
