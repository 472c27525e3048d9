//! WebSocket push endpoint.
//!
//! Each connection owns one bus subscription that starts with no topics;
//! the client selects topics with `subscribe` / `unsubscribe` messages.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tracing::{debug, info, warn};

use super::bus::{EventBus, Subscription};
use super::model::ClientMessage;

/// Build the router serving `/ws`.
pub fn push_routes(bus: EventBus) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(bus)
}

async fn ws_handler(ws: WebSocketUpgrade, State(bus): State<EventBus>) -> impl IntoResponse {
    info!("Push client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, bus))
}

async fn handle_socket(mut socket: WebSocket, bus: EventBus) {
    let subscription = bus.subscribe([]);
    info!(subscriber = subscription.id(), "Push client connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!("Event bus closed");
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode push event"),
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &subscription);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Push client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if subscription.dropped() > 0 {
        warn!(
            subscriber = subscription.id(),
            dropped = subscription.dropped(),
            "Push client fell behind during its session"
        );
    }
    info!(subscriber = subscription.id(), "Push connection closed");
}

fn handle_client_message(text: &str, subscription: &Subscription) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { topics }) => {
            debug!(subscriber = subscription.id(), ?topics, "Client subscribed");
            subscription.add_topics(topics);
        }
        Ok(ClientMessage::Unsubscribe { topics }) => {
            debug!(subscriber = subscription.id(), ?topics, "Client unsubscribed");
            subscription.remove_topics(topics);
        }
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized WS message from client");
        }
    }
}
