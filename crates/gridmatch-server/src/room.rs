//! Room aggregate and the session store.
//!
//! Each room owns an independent [`MatchState`] and up to two seats, each
//! with its own [`mpsc`] sender for targeted message delivery. The
//! [`RoomManager`] is the single owner of all live rooms plus the
//! connection → (room, token) reverse index; every cross-event access goes
//! through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use gridmatch_core::board::Mark;
use gridmatch_core::protocol::{
    ErrorCode, ROOM_CODE_ALPHABET, ROOM_CODE_LEN, RoomStatus, ServerMessage, validate_room_code,
};
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::match_logic::MatchState;

/// Handle to a per-seat outbound channel.
///
/// The WebSocket write loop drains the receiver and forwards messages as
/// text frames.
pub type PlayerTx = mpsc::UnboundedSender<ServerMessage>;
pub type PlayerRx = mpsc::UnboundedReceiver<ServerMessage>;

/// One of the two player slots in a room. The mark is fixed for the
/// room's lifetime; only the transport binding changes across reconnects.
pub struct Seat {
    pub mark: Mark,
    pub connection_id: Option<u64>,
    pub connected: bool,
    /// Set on disconnect; the sweeper compares it against the grace window.
    pub disconnected_at: Option<Instant>,
    tx: Option<PlayerTx>,
}

/// A single match room. All fields are guarded by the room's `Mutex`,
/// which serializes every mutation for this room.
pub struct Room {
    pub id: String,
    /// Seat records keyed by the seat's durable player token.
    pub seats: HashMap<String, Seat>,
    pub state: MatchState,
    pub created_at: Instant,
    /// Set when the series decides; the sweeper's idle ceiling reads it.
    pub finished_at: Option<Instant>,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            seats: HashMap::new(),
            state: MatchState::new(),
            created_at: Instant::now(),
            finished_at: None,
        }
    }

    /// Broadcast a message to all connected seats.
    pub fn broadcast(&self, msg: &ServerMessage) {
        for seat in self.seats.values() {
            if let Some(tx) = &seat.tx {
                // Ignore send failure — the seat may have just dropped.
                let _ = tx.send(msg.clone());
            }
        }
    }

    /// Send a message to the seat holding `token`.
    pub fn send_to_token(&self, token: &str, msg: &ServerMessage) {
        if let Some(tx) = self.seats.get(token).and_then(|s| s.tx.as_ref()) {
            let _ = tx.send(msg.clone());
        }
    }

    /// Build a full state snapshot for a (re)joining seat.
    pub fn build_resync(&self, token: &str) -> ServerMessage {
        ServerMessage::GameState {
            room_id: self.id.clone(),
            your_mark: self.seats.get(token).map(|s| s.mark),
            board: self.state.board,
            current_turn: self.state.current_turn,
            status: self.state.status,
            round: self.state.series.current_round,
            max_rounds: self.state.series.max_rounds,
            wins: self.state.series.wins,
            tension: self.state.tension,
            morale: self.state.morale,
            last_commentary: self.state.last_commentary.clone(),
        }
    }

    /// Whether every seat is disconnected and has been for at least `grace`.
    pub fn abandoned_for(&self, grace: std::time::Duration) -> bool {
        !self.seats.is_empty()
            && self.seats.values().all(|s| {
                !s.connected
                    && s.disconnected_at
                        .map(|t| t.elapsed() >= grace)
                        .unwrap_or(true)
            })
    }
}

struct ConnectionEntry {
    room_id: String,
    token: String,
}

/// Manages all live rooms and the connection reverse index.
///
/// Thread-safe: the outer `RwLock` allows concurrent lookups while
/// create/remove take exclusive access. Each room is individually
/// `Mutex`-protected so independent rooms never contend.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    connections: RwLock<HashMap<u64, ConnectionEntry>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Create a room and seat the caller on X. Returns the room code, the
    /// seat's durable token, and the outbound receiver for the write loop.
    pub async fn create_room(
        &self,
        connection_id: u64,
    ) -> (String, String, PlayerRx, Arc<Mutex<Room>>) {
        let token = generate_token();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut rooms = self.rooms.write().await;
        let room_id = loop {
            let code = generate_room_code();
            if !rooms.contains_key(&code) {
                break code;
            }
        };

        let mut room = Room::new(room_id.clone());
        room.seats.insert(
            token.clone(),
            Seat {
                mark: Mark::X,
                connection_id: Some(connection_id),
                connected: true,
                disconnected_at: None,
                tx: Some(tx),
            },
        );
        let room_arc = Arc::new(Mutex::new(room));
        rooms.insert(room_id.clone(), Arc::clone(&room_arc));
        drop(rooms);

        self.connections.write().await.insert(
            connection_id,
            ConnectionEntry {
                room_id: room_id.clone(),
                token: token.clone(),
            },
        );

        tracing::info!(room = %room_id, "Room created");
        (room_id, token, rx, room_arc)
    }

    /// Seat the caller on O and start the match.
    pub async fn join_room(
        &self,
        room_id: &str,
        connection_id: u64,
    ) -> Result<(String, PlayerRx, Arc<Mutex<Room>>), ErrorCode> {
        validate_room_code(room_id)?;
        let room_arc = self
            .get_room(room_id)
            .await
            .ok_or(ErrorCode::RoomNotFound)?;

        let token = generate_token();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut room = room_arc.lock().await;
            if room.seats.len() >= 2 || room.state.status != RoomStatus::Waiting {
                return Err(ErrorCode::RoomFull);
            }
            room.seats.insert(
                token.clone(),
                Seat {
                    mark: Mark::O,
                    connection_id: Some(connection_id),
                    connected: true,
                    disconnected_at: None,
                    tx: Some(tx),
                },
            );
            room.state.begin();
        }

        self.connections.write().await.insert(
            connection_id,
            ConnectionEntry {
                room_id: room_id.to_string(),
                token: token.clone(),
            },
        );

        tracing::info!(room = %room_id, "Second seat joined, match starting");
        Ok((token, rx, room_arc))
    }

    /// Reclaim a seat using its durable token.
    pub async fn rejoin_room(
        &self,
        room_id: &str,
        token: &str,
        connection_id: u64,
    ) -> Result<(Mark, PlayerRx, Arc<Mutex<Room>>), ErrorCode> {
        validate_room_code(room_id)?;
        let room_arc = self
            .get_room(room_id)
            .await
            .ok_or(ErrorCode::RoomNotFound)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mark = {
            let mut room = room_arc.lock().await;
            let seat = room.seats.get_mut(token).ok_or(ErrorCode::InvalidToken)?;
            seat.connection_id = Some(connection_id);
            seat.connected = true;
            seat.disconnected_at = None;
            seat.tx = Some(tx);
            seat.mark
        };

        // Drop any stale reverse entry from the seat's previous connection
        // before binding the new one.
        let mut connections = self.connections.write().await;
        connections.retain(|_, e| !(e.room_id == room_id && e.token == token));
        connections.insert(
            connection_id,
            ConnectionEntry {
                room_id: room_id.to_string(),
                token: token.to_string(),
            },
        );

        tracing::info!(room = %room_id, mark = %mark, "Seat reclaimed");
        Ok((mark, rx, room_arc))
    }

    /// Resolve a connection to its room and seat token.
    pub async fn resolve_by_connection(
        &self,
        connection_id: u64,
    ) -> Option<(Arc<Mutex<Room>>, String, String)> {
        let (room_id, token) = {
            let connections = self.connections.read().await;
            let entry = connections.get(&connection_id)?;
            (entry.room_id.clone(), entry.token.clone())
        };
        let room_arc = self.get_room(&room_id).await?;
        Some((room_arc, room_id, token))
    }

    /// Soft-disconnect: clear the seat's transport binding and drop the
    /// reverse-index entry. The room itself is never deleted here — that is
    /// the sweeper's (or the forfeiture timer's) job.
    pub async fn disconnect(
        &self,
        connection_id: u64,
    ) -> Option<(Arc<Mutex<Room>>, String, String, Mark)> {
        let entry = self.connections.write().await.remove(&connection_id)?;
        // The room may already be swept — benign race, treat as a no-op.
        let room_arc = self.get_room(&entry.room_id).await?;

        let mark = {
            let mut room = room_arc.lock().await;
            let seat = room.seats.get_mut(&entry.token)?;
            // A rejoin from a new connection may have already rebound the
            // seat; only clear it if this connection still owns it.
            if seat.connection_id != Some(connection_id) {
                return None;
            }
            seat.connection_id = None;
            seat.connected = false;
            seat.disconnected_at = Some(Instant::now());
            seat.tx = None;
            seat.mark
        };

        Some((room_arc, entry.room_id, entry.token, mark))
    }

    /// Look up a room by ID.
    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).cloned()
    }

    /// Remove a room and any reverse-index entries still pointing at it.
    pub async fn remove_room(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
        self.connections
            .write()
            .await
            .retain(|_, e| e.room_id != room_id);
    }

    /// List active room IDs (for the debug API).
    pub async fn list_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms.keys().cloned().collect()
    }
}

/// Generate a random seat token (32-char hex string). Tokens are the
/// seat's durable identity, independent of transport connection identity.
fn generate_token() -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a short human-shareable room code.
fn generate_room_code() -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_join_seats_both_marks() {
        let manager = RoomManager::new();
        let (room_id, token_x, _rx_x, room_arc) = manager.create_room(1).await;
        assert!(validate_room_code(&room_id).is_ok());

        {
            let room = room_arc.lock().await;
            assert_eq!(room.state.status, RoomStatus::Waiting);
            assert_eq!(room.seats.get(&token_x).map(|s| s.mark), Some(Mark::X));
        }

        let (token_o, _rx_o, _) = manager.join_room(&room_id, 2).await.unwrap();
        let room = room_arc.lock().await;
        assert_eq!(room.state.status, RoomStatus::Active);
        assert_eq!(room.seats.get(&token_o).map(|s| s.mark), Some(Mark::O));
        assert_eq!(room.seats.len(), 2);
    }

    #[tokio::test]
    async fn join_errors_are_specific() {
        let manager = RoomManager::new();
        assert_eq!(
            manager.join_room("NOSUCH", 1).await.err(),
            Some(ErrorCode::RoomNotFound)
        );

        let (room_id, _t, _rx, _arc) = manager.create_room(1).await;
        manager.join_room(&room_id, 2).await.unwrap();
        assert_eq!(
            manager.join_room(&room_id, 3).await.err(),
            Some(ErrorCode::RoomFull)
        );
    }

    #[tokio::test]
    async fn disconnect_clears_seat_and_reverse_index() {
        let manager = RoomManager::new();
        let (room_id, token, _rx, room_arc) = manager.create_room(7).await;

        let (_, rid, tok, mark) = manager.disconnect(7).await.unwrap();
        assert_eq!(rid, room_id);
        assert_eq!(tok, token);
        assert_eq!(mark, Mark::X);

        {
            let room = room_arc.lock().await;
            let seat = room.seats.get(&token).unwrap();
            assert!(!seat.connected);
            assert!(seat.connection_id.is_none());
            assert!(seat.disconnected_at.is_some());
        }

        // Second disconnect for the same connection is a defensive no-op,
        // and the room is still alive.
        assert!(manager.disconnect(7).await.is_none());
        assert!(manager.get_room(&room_id).await.is_some());
        assert!(manager.resolve_by_connection(7).await.is_none());
    }

    #[tokio::test]
    async fn resync_snapshot_reflects_live_state() {
        let manager = RoomManager::new();
        let (room_id, token_x, _rx, room_arc) = manager.create_room(1).await;
        manager.join_room(&room_id, 2).await.unwrap();

        {
            let mut room = room_arc.lock().await;
            room.state.apply_move(Mark::X, 4).unwrap();
            room.state.last_commentary = Some("X strikes first.".to_string());
        }

        let room = room_arc.lock().await;
        match room.build_resync(&token_x) {
            ServerMessage::GameState {
                room_id: rid,
                your_mark,
                board,
                current_turn,
                status,
                round,
                last_commentary,
                ..
            } => {
                assert_eq!(rid, room_id);
                assert_eq!(your_mark, Some(Mark::X));
                assert_eq!(board.get(4), Some(Mark::X));
                assert_eq!(current_turn, Mark::O);
                assert_eq!(status, RoomStatus::Active);
                assert_eq!(round, 1);
                assert_eq!(last_commentary.as_deref(), Some("X strikes first."));
            }
            other => panic!("unexpected resync message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejoin_restores_the_same_seat() {
        let manager = RoomManager::new();
        let (room_id, token, _rx, room_arc) = manager.create_room(7).await;
        manager.disconnect(7).await.unwrap();

        let (mark, _rx2, _) = manager.rejoin_room(&room_id, &token, 8).await.unwrap();
        assert_eq!(mark, Mark::X);

        let room = room_arc.lock().await;
        let seat = room.seats.get(&token).unwrap();
        assert!(seat.connected);
        assert_eq!(seat.connection_id, Some(8));
        assert!(seat.disconnected_at.is_none());
        drop(room);

        let (_, rid, tok) = manager.resolve_by_connection(8).await.unwrap();
        assert_eq!(rid, room_id);
        assert_eq!(tok, token);
    }

    #[tokio::test]
    async fn rejoin_rejects_bad_token_and_room() {
        let manager = RoomManager::new();
        let (room_id, _token, _rx, _arc) = manager.create_room(1).await;

        assert_eq!(
            manager.rejoin_room(&room_id, "deadbeef", 2).await.err(),
            Some(ErrorCode::InvalidToken)
        );
        assert_eq!(
            manager.rejoin_room("NOSUCH", "deadbeef", 2).await.err(),
            Some(ErrorCode::RoomNotFound)
        );
    }

    #[tokio::test]
    async fn stale_disconnect_after_rejoin_is_ignored() {
        let manager = RoomManager::new();
        let (room_id, token, _rx, room_arc) = manager.create_room(1).await;

        // The seat rebinds to connection 2 before connection 1's
        // disconnect is processed.
        manager.rejoin_room(&room_id, &token, 2).await.unwrap();
        assert!(manager.disconnect(1).await.is_none());

        let room = room_arc.lock().await;
        assert!(room.seats.get(&token).unwrap().connected);
    }

    #[test]
    fn tokens_are_high_entropy_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
