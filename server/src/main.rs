use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use jigsaw_protocol::*;
use std::time::Duration;
use uuid::Uuid;

mod rooms;

use rooms::{AppState, Tx};

const INVALID_JSON: &str = "Invalid JSON";
const INVALID_FORMAT: &str = "Invalid message format";

#[derive(Parser, Debug)]
#[command(name = "jigsaw-server")]
#[command(about = "Relay server for the multiplayer jigsaw board")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3001")]
    listen: String,
    /// Seconds an empty room survives before deletion
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,
    /// Seconds between puzzle completion and the next layout
    #[arg(long, default_value_t = 5)]
    reset_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jigsaw_server=info".into()),
        )
        .init();

    let args = Args::parse();
    let state = AppState::new(
        Duration::from_secs(args.grace_secs),
        Duration::from_secs(args.reset_secs),
    );
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", get(rooms_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(addr = %args.listen, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Out-of-band status query: identifiers, user/score pairs and connection
/// counts of every live room. Read-only.
async fn rooms_handler(State(state): State<AppState>) -> Json<Vec<RoomStatus>> {
    Json(rooms::list_rooms(&state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (tx_out, mut rx_out) = tokio::sync::mpsc::unbounded_channel::<ServerToClient>();

    tokio::spawn(async move {
        while let Some(msg) = rx_out.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let my_id = Uuid::new_v4();
    rooms::on_connect(&state, my_id);

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(t) => route_text(&t, &state, my_id, &tx_out),
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Reached on Close and on abrupt drops alike.
    rooms::on_disconnect(&state, my_id);
}

/// Flat command dispatcher. Parsing happens in two stages so unparseable
/// payloads and well-formed JSON that matches no command shape are reported
/// distinctly; neither mutates anything.
fn route_text(text: &str, state: &AppState, my_id: Uuid, tx_out: &Tx) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            send_error(tx_out, INVALID_JSON);
            return;
        }
    };
    let cmd: ClientToServer = match serde_json::from_value(value) {
        Ok(c) => c,
        Err(_) => {
            send_error(tx_out, INVALID_FORMAT);
            return;
        }
    };
    route_cmd(cmd, state, my_id, tx_out);
}

fn route_cmd(cmd: ClientToServer, state: &AppState, my_id: Uuid, tx_out: &Tx) {
    match cmd {
        ClientToServer::CreateRoom {
            room_id,
            grid_size,
            username,
        } => {
            if grid_size == 0 || grid_size > MAX_GRID_SIZE {
                send_error(tx_out, INVALID_FORMAT);
                return;
            }
            if let Err(e) = rooms::create_room(state, my_id, &room_id, grid_size, &username, tx_out)
            {
                tracing::warn!(room = %room_id, error = %e, "create-room rejected");
                send_error(tx_out, &e.to_string());
            }
        }
        ClientToServer::JoinRoom { room_id, username } => {
            if let Err(e) = rooms::join_room(state, my_id, &room_id, &username, tx_out) {
                tracing::warn!(room = %room_id, error = %e, "join-room rejected");
                send_error(tx_out, &e.to_string());
            }
        }
        ClientToServer::PieceMove {
            room_id,
            piece_id,
            x,
            y,
            z,
            correct,
        } => {
            if let Err(e) =
                rooms::apply_move(state, my_id, &room_id, &piece_id, x, y, z, false, correct)
            {
                send_error(tx_out, &e.to_string());
            }
        }
        ClientToServer::PieceDrag {
            room_id,
            piece_id,
            x,
            y,
            z,
            correct,
        } => {
            if let Err(e) =
                rooms::apply_move(state, my_id, &room_id, &piece_id, x, y, z, true, correct)
            {
                send_error(tx_out, &e.to_string());
            }
        }
    }
}

fn send_error(tx_out: &Tx, error: &str) {
    let _ = tx_out.send(ServerToClient::Error {
        error: error.to_string(),
    });
}
