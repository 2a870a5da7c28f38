// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Robot telemetry bridge: connects a fleet of embedded robots (plain TCP,
//! NDJSON) to a browser operations UI (WebSocket, JSON), and runs an
//! always-on TCP server that streams armed firmware images to a robot over
//! the same network once its upload has been staged through the UI
//! channel.
//!
//! # Protocol
//!
//! Robots speak newline-delimited JSON on `--tcp-port` (default 12346).
//! The browser UI speaks JSON control messages over a WebSocket at
//! `ws://<bind>:<ws-port>/ws` (default port 9003). Firmware images are
//! streamed in 1024-byte chunks to whichever robot connects to
//! `--ota-port` (default 12345) next, once armed via the UI's
//! `upload_firmware_end` command.

mod config;
mod error;
mod firmware;
mod logsink;
mod normalizer;
mod ota;
mod pose;
mod protocol;
mod registry;
mod robot_session;
mod router;
mod state;
mod ui_session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use config::Args;
use state::AppState;
use ui_session::ClientSession;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .init();

    info!("robot-bridge v{}", env!("CARGO_PKG_VERSION"));

    let bind = args.bind.clone();
    let tcp_port = args.tcp_port;
    let ws_port = args.ws_port;
    let ota_port = args.ota_port;
    let frontend_origin = args.frontend_origin.clone();

    let state = Arc::new(AppState::new(args)?);

    let robot_listener = tokio::net::TcpListener::bind((bind.as_str(), tcp_port)).await?;
    info!("robot TCP listener on {bind}:{tcp_port}");
    let robot_state = state.clone();
    tokio::spawn(async move {
        loop {
            match robot_listener.accept().await {
                Ok((stream, addr)) => {
                    let state = robot_state.clone();
                    tokio::spawn(robot_session::run(stream, addr, state));
                }
                Err(e) => error!("robot TCP accept error: {e}"),
            }
        }
    });

    let ota_listener = tokio::net::TcpListener::bind((bind.as_str(), ota_port)).await?;
    info!("OTA listener on {bind}:{ota_port}");
    let ota_arm = state.ota_arm.clone();
    tokio::spawn(async move {
        ota::run_ota_server(ota_listener, ota_arm).await;
    });

    let cors_origin: axum::http::HeaderValue = frontend_origin.parse()?;
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::exact(cors_origin))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let ws_addr = format!("{bind}:{ws_port}");
    info!("WebSocket UI endpoint: ws://{ws_addr}/ws");
    let listener = tokio::net::TcpListener::bind(&ws_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let session = ClientSession::new(state, addr);
        session.run(socket).await;
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "robots": state.registry.snapshot().len(),
    }))
}
