use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// ---- Board constants ----
///
/// The scatter region is the square `[-SCATTER_BOUND, SCATTER_BOUND)` on both
/// axes; pieces are square with side `1 / grid_size`.
///
/// `MAX_GRID_SIZE` caps remote-supplied grids: 64 already means 4096 pieces,
/// and anything larger is either a typo or an attempt to exhaust memory.
pub const DEFAULT_GRID_SIZE: u32 = 4;
pub const MAX_GRID_SIZE: u32 = 64;
pub const MAX_PLACE_ATTEMPTS: u32 = 200;
pub const SCATTER_BOUND: f64 = 1.2;

/// ---- Piece state ----
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PiecePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub dragging: bool,
}

/// Canonical piece identifier for the cell at (col, row).
pub fn piece_id(col: u32, row: u32) -> String {
    format!("{}_{}", col, row)
}

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
}

impl Aabb {
    fn around(x: f64, y: f64, side: f64) -> Self {
        Aabb {
            min_x: x - side / 2.0,
            max_x: x + side / 2.0,
            min_y: y - side / 2.0,
            max_y: y + side / 2.0,
        }
    }

    fn overlaps(&self, other: &Aabb) -> bool {
        self.max_x > other.min_x
            && self.min_x < other.max_x
            && self.max_y > other.min_y
            && self.min_y < other.max_y
    }
}

/// Produces the initial scatter for a fresh puzzle instance: one placeholder
/// per grid cell, rejection-sampled so bounding boxes do not overlap. After
/// `MAX_PLACE_ATTEMPTS` failed samples the piece is placed at the last sample
/// anyway, so generation always terminates even at high density.
pub fn scatter_layout(grid_size: u32) -> HashMap<String, PiecePosition> {
    let mut rng = thread_rng();
    let mut pieces = HashMap::new();
    // usize arithmetic: the square of a large u32 grid must not wrap.
    let cell_count = (grid_size as usize).saturating_mul(grid_size as usize);
    let mut used: Vec<Aabb> = Vec::with_capacity(cell_count);
    let side = 1.0 / grid_size as f64;

    for col in 0..grid_size {
        for row in 0..grid_size {
            let mut x = 0.0;
            let mut y = 0.0;
            let mut placed = false;
            for _ in 0..MAX_PLACE_ATTEMPTS {
                x = rng.gen_range(-SCATTER_BOUND..SCATTER_BOUND);
                y = rng.gen_range(-SCATTER_BOUND..SCATTER_BOUND);
                let candidate = Aabb::around(x, y, side);
                if !used.iter().any(|b| candidate.overlaps(b)) {
                    used.push(candidate);
                    placed = true;
                    break;
                }
            }
            if !placed {
                // Density too high: accept the overlap rather than fail.
                used.push(Aabb::around(x, y, side));
            }
            pieces.insert(
                piece_id(col, row),
                PiecePosition {
                    x,
                    y,
                    z: 0.0,
                    dragging: false,
                },
            );
        }
    }
    pieces
}

/// ---- Puzzle images ----
///
/// Static assets the client resolves against its own origin. One is picked
/// at room creation and again after each completed puzzle.
pub const IMAGE_CATALOG: [&str; 6] = [
    "/puzzles/alpine-lake.jpg",
    "/puzzles/lighthouse.jpg",
    "/puzzles/market-street.jpg",
    "/puzzles/nebula.jpg",
    "/puzzles/red-panda.jpg",
    "/puzzles/tidepool.jpg",
];

pub fn pick_image() -> &'static str {
    IMAGE_CATALOG
        .choose(&mut thread_rng())
        .copied()
        .unwrap_or(IMAGE_CATALOG[0])
}

/// ---- Wire messages ----
///
/// JSON text frames, externally tagged with `"type"` (kebab-case), record
/// fields in camelCase. `correct` is relayed exactly as sent: absent stays
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientToServer {
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        room_id: String,
        grid_size: u32,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, username: String },
    #[serde(rename_all = "camelCase")]
    PieceMove {
        room_id: String,
        piece_id: String,
        x: f64,
        y: f64,
        z: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correct: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    PieceDrag {
        room_id: String,
        piece_id: String,
        x: f64,
        y: f64,
        z: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correct: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserEntry {
    pub username: String,
    pub score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerToClient {
    #[serde(rename_all = "camelCase")]
    FullState {
        room_id: String,
        pieces: HashMap<String, PiecePosition>,
        image_url: String,
    },
    UserList {
        users: Vec<UserEntry>,
    },
    AllCorrect,
    Error {
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    PieceMove {
        room_id: String,
        piece_id: String,
        x: f64,
        y: f64,
        z: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correct: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    PieceDrag {
        room_id: String,
        piece_id: String,
        x: f64,
        y: f64,
        z: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correct: Option<bool>,
    },
}

/// One row of the out-of-band `GET /rooms` status listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub room_id: String,
    pub users: Vec<UserEntry>,
    pub connection_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_room_parses_from_wire_shape() {
        let msg: ClientToServer = serde_json::from_value(json!({
            "type": "create-room",
            "roomId": "abc",
            "gridSize": 4,
            "username": "alice",
        }))
        .unwrap();
        match msg {
            ClientToServer::CreateRoom {
                room_id,
                grid_size,
                username,
            } => {
                assert_eq!(room_id, "abc");
                assert_eq!(grid_size, 4);
                assert_eq!(username, "alice");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn piece_move_without_correct_stays_absent_on_relay() {
        let msg: ClientToServer = serde_json::from_value(json!({
            "type": "piece-move",
            "roomId": "abc",
            "pieceId": "0_1",
            "x": 0.5, "y": -0.25, "z": 0.0,
        }))
        .unwrap();
        let relayed = serde_json::to_value(&msg).unwrap();
        assert_eq!(relayed["type"], "piece-move");
        assert_eq!(relayed["pieceId"], "0_1");
        assert!(relayed.get("correct").is_none());
    }

    #[test]
    fn piece_drag_keeps_correct_flag() {
        let msg: ClientToServer = serde_json::from_value(json!({
            "type": "piece-drag",
            "roomId": "abc",
            "pieceId": "1_1",
            "x": 0.0, "y": 0.0, "z": 0.1,
            "correct": true,
        }))
        .unwrap();
        let relayed = serde_json::to_value(&msg).unwrap();
        assert_eq!(relayed["correct"], true);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = serde_json::from_value::<ClientToServer>(json!({
            "type": "create-room",
            "roomId": "abc",
        }));
        assert!(err.is_err());
        let err = serde_json::from_value::<ClientToServer>(json!({
            "type": "join-room",
            "roomId": 7,
            "username": "bob",
        }));
        assert!(err.is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_value::<ClientToServer>(json!({
            "type": "teleport-room",
            "roomId": "abc",
        }));
        assert!(err.is_err());
    }

    #[test]
    fn outbound_messages_use_wire_tags() {
        let v = serde_json::to_value(ServerToClient::AllCorrect).unwrap();
        assert_eq!(v, json!({ "type": "all-correct" }));

        let v = serde_json::to_value(ServerToClient::UserList {
            users: vec![UserEntry {
                username: "alice".into(),
                score: 3,
            }],
        })
        .unwrap();
        assert_eq!(
            v,
            json!({ "type": "user-list", "users": [{ "username": "alice", "score": 3 }] })
        );

        let v = serde_json::to_value(ServerToClient::Error {
            error: "Room already exists".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["error"], "Room already exists");
    }

    #[test]
    fn full_state_wire_shape() {
        let mut pieces = HashMap::new();
        pieces.insert(
            piece_id(0, 0),
            PiecePosition {
                x: 0.1,
                y: 0.2,
                z: 0.0,
                dragging: false,
            },
        );
        let v = serde_json::to_value(ServerToClient::FullState {
            room_id: "abc".into(),
            pieces,
            image_url: "/puzzles/nebula.jpg".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "full-state");
        assert_eq!(v["roomId"], "abc");
        assert_eq!(v["imageUrl"], "/puzzles/nebula.jpg");
        assert_eq!(v["pieces"]["0_0"]["dragging"], false);
    }

    fn boxes_overlap(a: &PiecePosition, b: &PiecePosition, side: f64) -> bool {
        (a.x - b.x).abs() < side && (a.y - b.y).abs() < side
    }

    #[test]
    fn scatter_layout_has_one_piece_per_cell() {
        let pieces = scatter_layout(3);
        assert_eq!(pieces.len(), 9);
        for col in 0..3 {
            for row in 0..3 {
                let p = &pieces[&piece_id(col, row)];
                assert_eq!(p.z, 0.0);
                assert!(!p.dragging);
                assert!(p.x >= -SCATTER_BOUND && p.x < SCATTER_BOUND);
                assert!(p.y >= -SCATTER_BOUND && p.y < SCATTER_BOUND);
            }
        }
    }

    #[test]
    fn scatter_layout_avoids_overlap_at_moderate_density() {
        // At N=4 the board is sparse enough that the attempt bound should
        // never be exhausted in practice.
        let side = 1.0 / 4.0;
        for _ in 0..1000 {
            let pieces: Vec<PiecePosition> = scatter_layout(4).into_values().collect();
            for i in 0..pieces.len() {
                for j in (i + 1)..pieces.len() {
                    assert!(
                        !boxes_overlap(&pieces[i], &pieces[j], side),
                        "overlapping pieces at {:?} and {:?}",
                        pieces[i],
                        pieces[j]
                    );
                }
            }
        }
    }

    #[test]
    fn pick_image_stays_in_catalog() {
        for _ in 0..50 {
            assert!(IMAGE_CATALOG.contains(&pick_image()));
        }
    }
}
