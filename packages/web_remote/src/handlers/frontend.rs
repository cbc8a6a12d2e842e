use std::sync::Arc;

use axum::{
    extract::{
        Query, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, info};

use crate::AppState;
use crate::hub::FrontendHub;
use crate::router::CommandRouter;

#[derive(Debug, Default, Deserialize)]
pub struct FrontendParams {
    /// Instance injected into commands that do not name one.
    pub instance: Option<String>,
}

impl FrontendParams {
    fn default_instance(self) -> Option<String> {
        self.instance.filter(|i| !i.trim().is_empty())
    }
}

/// `/` serves both the control panel and its WebSocket: upgrade requests
/// join the hub, everything else falls through to the static files.
pub async fn root_handler(
    State(state): State<AppState>,
    Query(params): Query<FrontendParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request,
) -> Response {
    match ws {
        Ok(ws) => upgrade(state, params, ws),
        Err(_) => {
            let files = ServeDir::new(&state.server_config.public_dir);
            match files.oneshot(request).await {
                Ok(response) => response.into_response(),
                Err(never) => match never {},
            }
        }
    }
}

/// `/ws` - WebSocket only
pub async fn frontend_ws_handler(
    State(state): State<AppState>,
    Query(params): Query<FrontendParams>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, params, ws)
}

fn upgrade(state: AppState, params: FrontendParams, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub.clone();
    let router = state.router.clone();
    let default_instance = params.default_instance();
    ws.on_upgrade(move |socket| handle_frontend(socket, hub, router, default_instance))
}

/// Pump one front-end connection: hub frames out, commands in.
pub async fn handle_frontend(
    socket: WebSocket,
    hub: Arc<FrontendHub>,
    router: Arc<CommandRouter>,
    default_instance: Option<String>,
) {
    let mut session = hub.connect().await;
    let id = session.id.clone();
    info!(session = %id, instance = ?default_instance, "Frontend connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = session.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                // Rejections are logged and counted by the router.
                let _ = router.route(text.as_str(), default_instance.as_deref()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %id, error = %e, "frontend read failed");
                break;
            }
        }
    }

    hub.disconnect(&id).await;
    send_task.abort();
    info!(session = %id, "Frontend disconnected");
}
