use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::auth::DuplexUser;
use crate::state::AppState;
use crate::streaming::serve_connection;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    DuplexUser(user_id): DuplexUser,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| {
        serve_connection(
            socket,
            user_id,
            state.chat,
            state.registry,
            state.activity,
            state.settings.streaming.clone(),
        )
    })
}
