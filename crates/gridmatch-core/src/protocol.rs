//! Wire protocol for the gridmatch server.
//!
//! All messages travel as JSON text frames with a `type` tag. Protocol
//! errors are surfaced as [`ServerMessage::Error`] carrying a stable
//! machine-readable [`ErrorCode`] plus a fixed human-readable message —
//! never as a closed connection or a panic across the event boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::board::{Board, Mark};

/// Room lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomStatus {
    /// One seat occupied, waiting for an opponent.
    Waiting,
    /// Both seats occupied, a round is in progress.
    Active,
    /// A round just ended; the next one starts after a short pause.
    RoundOver,
    /// The series is decided (or forfeited). Terminal.
    Finished,
}

/// Per-mark morale, each bounded to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoralePair {
    pub x: f64,
    pub o: f64,
}

impl MoralePair {
    pub fn baseline() -> Self {
        Self { x: 0.5, o: 0.5 }
    }

    pub fn get(&self, mark: Mark) -> f64 {
        match mark {
            Mark::X => self.x,
            Mark::O => self.o,
        }
    }

    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(0.0, 1.0),
            o: self.o.clamp(0.0, 1.0),
        }
    }
}

/// Per-mark round-win counters for a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinTally {
    pub x: u32,
    pub o: u32,
}

impl WinTally {
    pub fn get(&self, mark: Mark) -> u32 {
        match mark {
            Mark::X => self.x,
            Mark::O => self.o,
        }
    }

    pub fn increment(&mut self, mark: Mark) {
        match mark {
            Mark::X => self.x += 1,
            Mark::O => self.o += 1,
        }
    }
}

/// Aggregate statistics attached to the series-over broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub total_moves: u32,
    pub peak_tension: f64,
    pub peak_morale: MoralePair,
    pub final_morale: MoralePair,
}

/// Which pipeline produced an intensity value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    /// The external inference call succeeded and passed validation.
    Model,
    /// Deterministic fallback (inference failed, timed out, or disabled).
    Heuristic,
}

/// What fired a narration line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NarrationTrigger {
    Move,
    RoundEnd,
    RoundStart,
    SeriesEnd,
    MatchPoint,
}

/// Coarse tone classification derived from the tension score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Calm,
    Building,
    Tense,
    Explosive,
}

impl Tone {
    /// Fixed thresholds: <0.3 calm, <0.6 building, <0.8 tense, else explosive.
    pub fn for_tension(tension: f64) -> Tone {
        if tension < 0.3 {
            Tone::Calm
        } else if tension < 0.6 {
            Tone::Building
        } else if tension < 0.8 {
            Tone::Tense
        } else {
            Tone::Explosive
        }
    }
}

/// Stable protocol error codes.
///
/// Every code maps to exactly one fixed message; clients may key UI
/// behavior off the code and ignore the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    NotYourTurn,
    InvalidCell,
    CellOccupied,
    /// Move (or similar action) while the room is still waiting for an opponent.
    GameNotStarted,
    /// Move during the round-over pause — a race against the scheduled
    /// round advance, distinct from a protocol violation.
    RoundTransition,
    /// Move after the series is decided.
    GameFinished,
    /// Rematch request while the series is still running.
    SeriesNotOver,
    InvalidToken,
    NotInRoom,
    AlreadyInRoom,
    InvalidMessage,
}

impl ErrorCode {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::NotYourTurn => "NOT_YOUR_TURN",
            ErrorCode::InvalidCell => "INVALID_CELL",
            ErrorCode::CellOccupied => "CELL_OCCUPIED",
            ErrorCode::GameNotStarted => "GAME_NOT_STARTED",
            ErrorCode::RoundTransition => "ROUND_TRANSITION",
            ErrorCode::GameFinished => "GAME_FINISHED",
            ErrorCode::SeriesNotOver => "SERIES_NOT_OVER",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::AlreadyInRoom => "ALREADY_IN_ROOM",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::RoomNotFound => "Room not found",
            ErrorCode::RoomFull => "Room is full or no longer accepting players",
            ErrorCode::NotYourTurn => "It is not your turn",
            ErrorCode::InvalidCell => "Cell index must be between 0 and 8",
            ErrorCode::CellOccupied => "That cell is already taken",
            ErrorCode::GameNotStarted => "The game has not started yet",
            ErrorCode::RoundTransition => "The next round is about to start",
            ErrorCode::GameFinished => "The series is already over",
            ErrorCode::SeriesNotOver => "The series is still in progress",
            ErrorCode::InvalidToken => "Invalid or expired reconnection token",
            ErrorCode::NotInRoom => "You are not in that room",
            ErrorCode::AlreadyInRoom => "Already in a room",
            ErrorCode::InvalidMessage => "Could not parse message",
        }
    }

    /// Build the outbound error event for this code.
    pub fn to_message(self) -> ServerMessage {
        ServerMessage::Error {
            code: self,
            message: self.message().to_string(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Create a new room; the caller takes the X seat.
    CreateRoom,

    /// Join an existing room on the O seat.
    JoinRoom { room_id: String },

    /// Place a mark on a cell (0..9, row-major).
    MakeMove { room_id: String, cell: usize },

    /// Acknowledge a rematch. The series resets once both seats have acked.
    NewSeries { room_id: String },

    /// Reclaim a seat after a dropped connection.
    Rejoin { room_id: String, token: String },

    /// Ping to check connection.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Room created; the creator holds X and waits for an opponent.
    RoomCreated {
        room_id: String,
        token: String,
        mark: Mark,
    },

    /// Confirmation for the joining player (seat O).
    JoinedRoom {
        room_id: String,
        token: String,
        mark: Mark,
    },

    /// Both seats occupied — the match begins (also sent on series reset).
    GameStart {
        round: u32,
        current_turn: Mark,
        max_rounds: u32,
    },

    /// A move was accepted. Carries the synchronous heuristic signals;
    /// an `IntensityUpdate` may upgrade them later.
    MoveMade {
        cell: usize,
        mark: Mark,
        seq: u64,
        next_turn: Mark,
        tension: f64,
        morale: MoralePair,
    },

    /// Asynchronous tension/morale upgrade for the most recent move.
    IntensityUpdate {
        seq: u64,
        tension: f64,
        morale: MoralePair,
        source: SignalSource,
    },

    /// A round ended. `winner` is `None` for a draw.
    RoundOver {
        round: u32,
        winner: Option<Mark>,
        winning_line: Option<[usize; 3]>,
        wins: WinTally,
        tension: f64,
        morale: MoralePair,
    },

    /// The next round begins on a cleared board.
    RoundStart { round: u32, starting_mark: Mark },

    /// The series is decided. `winner` is `None` only for a tied,
    /// fully-played series.
    SeriesOver {
        winner: Option<Mark>,
        wins: WinTally,
        stats: SeriesStats,
        forfeit: bool,
    },

    /// Full state resync for a rejoining seat.
    GameState {
        room_id: String,
        your_mark: Option<Mark>,
        board: Board,
        current_turn: Mark,
        status: RoomStatus,
        round: u32,
        max_rounds: u32,
        wins: WinTally,
        tension: f64,
        morale: MoralePair,
        last_commentary: Option<String>,
    },

    /// A seat's connection dropped; their seat is held for `grace_ms`.
    PlayerDisconnected { mark: Mark, grace_ms: u64 },

    /// A dropped seat was reclaimed within the grace period.
    PlayerReconnected { mark: Mark },

    /// One seat has asked for a rematch; waiting on the other.
    RematchRequested { mark: Mark },

    /// A commentary line for the given trigger.
    NarrationUpdate {
        text: String,
        trigger: NarrationTrigger,
        tension: f64,
        tone: Tone,
    },

    /// Pong response to ping.
    Pong,

    /// Protocol error, unicast to the offending connection.
    Error { code: ErrorCode, message: String },
}

// ---------------------------------------------------------------------------
// Room code validation
// ---------------------------------------------------------------------------

/// Characters allowed in a room code: uppercase minus lookalikes (I, O, 0, 1).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated room codes.
pub const ROOM_CODE_LEN: usize = 6;

/// Validate a client-supplied room code.
pub fn validate_room_code(code: &str) -> Result<(), ErrorCode> {
    if code.len() != ROOM_CODE_LEN
        || !code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
    {
        return Err(ErrorCode::RoomNotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_room_codes() {
        assert!(validate_room_code("ABC234").is_ok());
        assert!(validate_room_code("ZZZZZZ").is_ok());
    }

    #[test]
    fn invalid_room_codes() {
        assert!(validate_room_code("").is_err());
        assert!(validate_room_code("ABC23").is_err()); // too short
        assert!(validate_room_code("ABC2345").is_err()); // too long
        assert!(validate_room_code("abc234").is_err()); // lowercase
        assert!(validate_room_code("ABC10I").is_err()); // lookalike chars
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::CellOccupied.code(), "CELL_OCCUPIED");
        assert_eq!(ErrorCode::RoundTransition.code(), "ROUND_TRANSITION");
        let json = serde_json::to_string(&ErrorCode::NotYourTurn).unwrap();
        assert_eq!(json, "\"NOT_YOUR_TURN\"");
    }

    #[test]
    fn error_message_carries_code_and_text() {
        let msg = ErrorCode::RoomFull.to_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Error");
        assert_eq!(json["code"], "ROOM_FULL");
        assert!(json["message"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[test]
    fn tone_thresholds() {
        assert_eq!(Tone::for_tension(0.0), Tone::Calm);
        assert_eq!(Tone::for_tension(0.29), Tone::Calm);
        assert_eq!(Tone::for_tension(0.3), Tone::Building);
        assert_eq!(Tone::for_tension(0.6), Tone::Tense);
        assert_eq!(Tone::for_tension(0.8), Tone::Explosive);
        assert_eq!(Tone::for_tension(1.0), Tone::Explosive);
    }

    #[test]
    fn client_messages_round_trip() {
        let msg = ClientMessage::MakeMove {
            room_id: "ABC234".into(),
            cell: 4,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"MakeMove\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::MakeMove { room_id, cell } => {
                assert_eq!(room_id, "ABC234");
                assert_eq!(cell, 4);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
