use jigsaw_protocol::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type Tx = UnboundedSender<ServerToClient>;
pub type Rooms = HashMap<String, Room>;

/// Wire error strings are the `Display` impls.
#[derive(Debug, Error, PartialEq)]
pub enum RoomError {
    #[error("Room already exists")]
    AlreadyExists,
    #[error("Room does not exist")]
    NotFound,
}

pub struct UserSeat {
    pub id: Uuid,
    pub name: String,
    pub score: u32,
    pub tx: Tx,
}

pub struct Room {
    pub grid_size: u32,
    pub pieces: HashMap<String, PiecePosition>,
    pub users: Vec<UserSeat>,
    pub correct: HashSet<String>,
    pub image_url: String,
    /// Puzzle-instance id, unique across the process lifetime. Delayed
    /// callbacks capture it and re-check on fire, so a timer armed for a
    /// room's previous life (or a re-created room with the same id) is inert.
    pub instance: u64,
    /// Armed only while the room has zero connections.
    pub cleanup: Option<JoinHandle<()>>,
}

impl Room {
    fn new(grid_size: u32, instance: u64) -> Self {
        Room {
            grid_size,
            pieces: scatter_layout(grid_size),
            users: Vec::new(),
            correct: HashSet::new(),
            image_url: pick_image().to_string(),
            instance,
            cleanup: None,
        }
    }
}

/// Side table entry for one live connection; nothing is ever stamped onto
/// the transport object itself.
#[derive(Debug, Default, Clone)]
pub struct Connection {
    pub room: Option<String>,
    pub username: Option<String>,
}

/// Explicitly-owned server state. Tests construct as many independent
/// instances as they like.
///
/// Lock order: `rooms` before `registry`, never the reverse.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<Mutex<Rooms>>,
    pub registry: Arc<Mutex<HashMap<Uuid, Connection>>>,
    instances: Arc<AtomicU64>,
    pub grace: Duration,
    pub reset_delay: Duration,
}

impl AppState {
    pub fn new(grace: Duration, reset_delay: Duration) -> Self {
        AppState {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            registry: Arc::new(Mutex::new(HashMap::new())),
            instances: Arc::new(AtomicU64::new(0)),
            grace,
            reset_delay,
        }
    }

    fn next_instance(&self) -> u64 {
        self.instances.fetch_add(1, Ordering::Relaxed)
    }
}

pub fn on_connect(state: &AppState, id: Uuid) {
    state.registry.lock().insert(id, Connection::default());
    tracing::debug!(conn = %id, "connection registered");
}

/// Transport-level close: drop the registry entry, pull the connection out
/// of its room (if any) and arm deferred deletion once the room is empty.
pub fn on_disconnect(state: &AppState, id: Uuid) {
    let mut rooms = state.rooms.lock();
    let Some(conn) = state.registry.lock().remove(&id) else {
        return;
    };
    let Some(room_id) = conn.room else {
        tracing::debug!(conn = %id, "connection closed outside any room");
        return;
    };
    if let Some(room) = rooms.get_mut(&room_id) {
        room.users.retain(|u| u.id != id);
        tracing::info!(
            room = %room_id,
            user = conn.username.as_deref().unwrap_or("<unnamed>"),
            remaining = room.users.len(),
            "user left"
        );
        broadcast(room, user_list(room), None);
        if room.users.is_empty() {
            arm_cleanup(state, &mut rooms, &room_id);
        }
    }
}

pub fn create_room(
    state: &AppState,
    id: Uuid,
    room_id: &str,
    grid_size: u32,
    username: &str,
    tx: &Tx,
) -> Result<(), RoomError> {
    let mut rooms = state.rooms.lock();
    if rooms.contains_key(room_id) {
        return Err(RoomError::AlreadyExists);
    }
    detach_locked(state, &mut rooms, id);

    let mut room = Room::new(grid_size, state.next_instance());
    room.users.push(UserSeat {
        id,
        name: username.to_string(),
        score: 0,
        tx: tx.clone(),
    });
    let _ = tx.send(full_state(room_id, &room));
    broadcast(&room, user_list(&room), None);
    rooms.insert(room_id.to_string(), room);

    {
        let mut registry = state.registry.lock();
        let conn = registry.entry(id).or_default();
        conn.room = Some(room_id.to_string());
        conn.username = Some(username.to_string());
    }
    tracing::info!(room = %room_id, grid = grid_size, user = username, "room created");
    Ok(())
}

pub fn join_room(
    state: &AppState,
    id: Uuid,
    room_id: &str,
    username: &str,
    tx: &Tx,
) -> Result<(), RoomError> {
    let mut rooms = state.rooms.lock();
    if !rooms.contains_key(room_id) {
        return Err(RoomError::NotFound);
    }
    detach_locked(state, &mut rooms, id);

    let room = rooms.get_mut(room_id).ok_or(RoomError::NotFound)?;
    cancel_cleanup(room_id, room);
    room.users.push(UserSeat {
        id,
        name: username.to_string(),
        score: 0,
        tx: tx.clone(),
    });
    let _ = tx.send(full_state(room_id, room));
    broadcast(room, user_list(room), None);

    {
        let mut registry = state.registry.lock();
        let conn = registry.entry(id).or_default();
        conn.room = Some(room_id.to_string());
        conn.username = Some(username.to_string());
    }
    tracing::info!(room = %room_id, user = username, "user joined");
    Ok(())
}

/// Applies one `piece-move`/`piece-drag`: unconditional position overwrite,
/// first-confirmation scoring, completion detection, then fire-and-forget
/// relay to everyone else in the room.
pub fn apply_move(
    state: &AppState,
    sender: Uuid,
    room_id: &str,
    piece_id: &str,
    x: f64,
    y: f64,
    z: f64,
    dragging: bool,
    correct: Option<bool>,
) -> Result<(), RoomError> {
    let mut rooms = state.rooms.lock();
    let room = rooms.get_mut(room_id).ok_or(RoomError::NotFound)?;

    room.pieces.insert(
        piece_id.to_string(),
        PiecePosition { x, y, z, dragging },
    );

    if correct == Some(true) && room.correct.insert(piece_id.to_string()) {
        if let Some(seat) = room.users.iter_mut().find(|u| u.id == sender) {
            seat.score += 1;
        }
        broadcast(room, user_list(room), None);
        if room.correct.len() == room.pieces.len() {
            tracing::info!(room = %room_id, "puzzle complete");
            broadcast(room, ServerToClient::AllCorrect, None);
            schedule_reset(state, room_id, room.instance);
        }
    }

    let relay = if dragging {
        ServerToClient::PieceDrag {
            room_id: room_id.to_string(),
            piece_id: piece_id.to_string(),
            x,
            y,
            z,
            correct,
        }
    } else {
        ServerToClient::PieceMove {
            room_id: room_id.to_string(),
            piece_id: piece_id.to_string(),
            x,
            y,
            z,
            correct,
        }
    };
    broadcast(room, relay, Some(sender));
    tracing::debug!(room = %room_id, piece = piece_id, dragging, "relayed move");
    Ok(())
}

/// Read-only snapshot for the out-of-band status query.
pub fn list_rooms(state: &AppState) -> Vec<RoomStatus> {
    let rooms = state.rooms.lock();
    let mut out: Vec<RoomStatus> = rooms
        .iter()
        .map(|(room_id, room)| RoomStatus {
            room_id: room_id.clone(),
            users: room
                .users
                .iter()
                .map(|u| UserEntry {
                    username: u.name.clone(),
                    score: u.score,
                })
                .collect(),
            connection_count: room.users.len(),
        })
        .collect();
    out.sort_by(|a, b| a.room_id.cmp(&b.room_id));
    out
}

/// Removes the connection from whatever room it currently occupies, used
/// when a connection creates or joins a room while still seated elsewhere.
fn detach_locked(state: &AppState, rooms: &mut Rooms, id: Uuid) {
    let prev = {
        let mut registry = state.registry.lock();
        registry.get_mut(&id).and_then(|c| c.room.take())
    };
    let Some(room_id) = prev else { return };
    if let Some(room) = rooms.get_mut(&room_id) {
        room.users.retain(|u| u.id != id);
        broadcast(room, user_list(room), None);
        if room.users.is_empty() {
            arm_cleanup(state, rooms, &room_id);
        }
    }
}

/// Arms the grace-period deletion timer on an empty room. The fired task
/// re-locks the store and re-checks both existence and emptiness: the room
/// may have been re-joined, or deleted and re-created, in between.
fn arm_cleanup(state: &AppState, rooms: &mut Rooms, room_id: &str) {
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };
    if let Some(old) = room.cleanup.take() {
        old.abort();
    }
    let instance = room.instance;
    let task_state = state.clone();
    let task_room = room_id.to_string();
    tracing::info!(room = %room_id, grace = ?state.grace, "room empty, deletion armed");
    room.cleanup = Some(tokio::spawn(async move {
        tokio::time::sleep(task_state.grace).await;
        let mut rooms = task_state.rooms.lock();
        let still_eligible = rooms
            .get(&task_room)
            .map(|r| r.instance == instance && r.users.is_empty())
            .unwrap_or(false);
        if still_eligible {
            rooms.remove(&task_room);
            tracing::info!(room = %task_room, "room deleted after grace period");
        }
    }));
}

fn cancel_cleanup(room_id: &str, room: &mut Room) {
    if let Some(handle) = room.cleanup.take() {
        handle.abort();
        tracing::info!(room = %room_id, "pending deletion cancelled");
    }
}

/// After the completion delay, swap in a fresh layout and image for the same
/// grid and announce it. The captured instance id guards against the room
/// having been deleted, re-created or already reset since scheduling.
fn schedule_reset(state: &AppState, room_id: &str, instance: u64) {
    let task_state = state.clone();
    let task_room = room_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(task_state.reset_delay).await;
        let mut rooms = task_state.rooms.lock();
        let Some(room) = rooms.get_mut(&task_room) else {
            return;
        };
        if room.instance != instance {
            return;
        }
        room.pieces = scatter_layout(room.grid_size);
        room.correct.clear();
        room.image_url = pick_image().to_string();
        room.instance = task_state.next_instance();
        tracing::info!(room = %task_room, "puzzle reset with new layout");
        broadcast(room, full_state(&task_room, room), None);
    });
}

pub fn full_state(room_id: &str, room: &Room) -> ServerToClient {
    ServerToClient::FullState {
        room_id: room_id.to_string(),
        pieces: room.pieces.clone(),
        image_url: room.image_url.clone(),
    }
}

pub fn user_list(room: &Room) -> ServerToClient {
    ServerToClient::UserList {
        users: room
            .users
            .iter()
            .map(|u| UserEntry {
                username: u.name.clone(),
                score: u.score,
            })
            .collect(),
    }
}

/// Fan-out to every seat in the room, optionally excluding the sender.
/// Sends are fire-and-forget; a dead peer's channel error is its own
/// disconnect handler's problem.
pub fn broadcast(room: &Room, msg: ServerToClient, except: Option<Uuid>) {
    for seat in room.users.iter() {
        if Some(seat.id) == except {
            continue;
        }
        if seat.tx.send(msg.clone()).is_err() {
            tracing::debug!(conn = %seat.id, "broadcast to closed connection dropped");
        }
    }
}
