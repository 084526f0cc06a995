//! Tuner status WebSocket.
//!
//! Every connected client receives the current tuner state immediately,
//! then a self-contained JSON snapshot for each subsequent transition.

use crate::tuner::{Tuner, TunerStatus};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::debug;
use std::sync::Arc;

/// Serve one status subscriber until it disconnects.
pub async fn handle_status_socket(socket: WebSocket, tuner: Arc<Tuner>) {
    let (mut sender, mut receiver) = socket.split();

    // Snapshot and subscription are obtained atomically, so the delta stream
    // continues exactly where the snapshot left off.
    let (snapshot, mut subscription) = tuner.subscribe_status();
    if send_status(&mut sender, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            status = subscription.next() => {
                let Some(status) = status else { break };
                if send_status(&mut sender, &status).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    // Clients have nothing to say on this socket.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    subscription.cancel();
    debug!("Status subscriber disconnected");
}

async fn send_status(
    sender: &mut SplitSink<WebSocket, Message>,
    status: &TunerStatus,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(status).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}
