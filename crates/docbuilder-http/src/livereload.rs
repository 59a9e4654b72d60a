//! Livereload listener (§4.9): a minimal WebSocket hub that broadcasts a
//! `"reload"` message after a build completes. `docs.rs`'s script
//! injection is the only client; the hub itself is forge/build agnostic.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct LivereloadHub {
    sender: broadcast::Sender<()>,
}

impl LivereloadHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    /// Notify every connected client to reload. Dropped if nobody is
    /// listening — there is no backlog to catch up on.
    pub fn notify_reload(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for LivereloadHub {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(hub: LivereloadHub) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<LivereloadHub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(mut socket: WebSocket, hub: LivereloadHub) {
    let mut rx = hub.sender.subscribe();
    while rx.recv().await.is_ok() {
        if socket.send(Message::Text("reload".into())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_reload_is_a_no_op_with_no_subscribers() {
        let hub = LivereloadHub::new();
        hub.notify_reload();
    }

    #[tokio::test]
    async fn subscriber_receives_reload_notification() {
        let hub = LivereloadHub::new();
        let mut rx = hub.sender.subscribe();
        hub.notify_reload();
        assert!(rx.recv().await.is_ok());
    }
}
