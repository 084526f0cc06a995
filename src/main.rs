//! hypcast-server - Main entry point
//!
//! Exposes a single ATSC tuner card to remote viewers:
//! - tunes and transcodes over-the-air broadcasts with GStreamer
//! - streams live audio/video to browsers over WebRTC
//! - keeps every client in sync through a status WebSocket

mod api;
mod args;
mod atsc;
mod hub;
mod tuner;

use args::Args;
use atsc::ChannelMap;
use clap::Parser;
use log::{error, info, warn};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task;
use tower_http::services::ServeDir;
use tuner::{Tuner, VideoPipelineVariant};

/// How long in-flight connections get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::init_from_env(env_logger::Env::default().filter_or("HYPCAST_LOG", "info"));

    let channels = match load_channels(&args.channels) {
        Ok(channels) => channels,
        Err(e) => {
            error!("Failed to load channels from {:?}: {}", args.channels, e);
            process::exit(1);
        }
    };

    let variant = VideoPipelineVariant::parse(&args.video_pipeline);
    let tuner = Arc::new(Tuner::new(channels, variant));

    let mut app = api::router(tuner.clone());
    if let Some(assets) = &args.assets {
        info!("Serving client assets from {:?}", assets);
        app = app.fallback_service(ServeDir::new(assets));
    }

    let addr = args.listen_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!(
        "Starting Hypcast server on {} ({} channels, {} video pipeline)",
        addr,
        tuner.channel_names().count(),
        variant.as_str()
    );

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = close_rx.await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutting down");

    let _ = close_tx.send(());
    if tokio::time::timeout(SHUTDOWN_GRACE, server).await.is_err() {
        warn!("HTTP server did not drain in time");
    }

    // Release the tuner hardware last, once no handler can touch it.
    let _ = task::spawn_blocking(move || tuner.stop()).await;
    info!("Hypcast server stopped");
}

fn load_channels(path: &Path) -> Result<ChannelMap, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let channels = atsc::parse_channels_conf(&contents)?;
    info!("Loaded {} channels from {:?}", channels.len(), path);
    Ok(channels)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
