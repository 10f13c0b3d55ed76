// Harvester WebSocket endpoint

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};

use super::AppState;
use crate::auth::harvester::{HarvesterId, HarvesterMessage};
use crate::auth::Credential;

pub async fn harvester_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut commands) = state.hub.register();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let text = match serde_json::to_string(&command) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!("Failed to encode harvester command: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_message(&state, id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Harvester #{} socket error: {}", id, e);
                    break;
                }
            }
        }
    }

    state.hub.unregister(id);
}

/// Apply one inbound message. Bad messages are logged and dropped; the socket stays up.
pub(crate) fn handle_message(state: &AppState, id: HarvesterId, text: &str) {
    let message = match serde_json::from_str::<HarvesterMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Ignoring unparseable message from harvester #{}: {}", id, e);
            return;
        }
    };

    match message {
        HarvesterMessage::CredentialsHarvested { data } => match Credential::from_harvest(data) {
            Ok(credential) => {
                tracing::info!("Received credentials from harvester #{}", id);
                state.store.set(credential);
            }
            Err(e) => tracing::warn!("Rejected harvest from #{}: {}", id, e),
        },
        HarvesterMessage::TokenRefreshed { token } => {
            state.store.update_auth_header(&token);
        }
        HarvesterMessage::RefreshComplete => {
            tracing::info!("Harvester #{} reports refresh complete", id);
            state.gateway.coordinator().mark_ui_settled();
        }
        HarvesterMessage::Identify { client } => state.hub.identify(id, client),
    }
}
