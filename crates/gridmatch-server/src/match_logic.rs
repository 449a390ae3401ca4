//! Round/series state machine for a single room.
//!
//! This module is transport-agnostic — it knows nothing about WebSockets,
//! channels, or timers. The [`ws_handler`](crate::ws_handler) module wires
//! its outcomes to broadcasts and scheduled tasks.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use gridmatch_core::board::{Board, BoardVerdict, Mark};
use gridmatch_core::protocol::{ErrorCode, MoralePair, RoomStatus, SeriesStats, WinTally};

use crate::signals;

/// Pause between a round ending and the next round starting.
pub const ROUND_ADVANCE_DELAY: Duration = Duration::from_secs(3);

/// Rounds per series. Best-of-five: first to three round wins.
pub const MAX_ROUNDS: u32 = 5;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One completed round. Immutable once appended.
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub round: u32,
    /// `None` for a draw.
    pub winner: Option<Mark>,
    pub moves: usize,
    pub duration: Duration,
    pub tension: f64,
    pub morale: MoralePair,
}

/// One placed mark. The tension/morale fields hold the synchronous
/// heuristic at creation and are upgraded at most once, only while the
/// move is still the most recent.
#[derive(Debug, Clone)]
pub struct MoveRecord {
    pub seq: u64,
    pub cell: usize,
    pub mark: Mark,
    pub placed_at: Instant,
    pub tension: f64,
    pub morale: MoralePair,
}

/// Best-of-N series bookkeeping.
#[derive(Debug, Clone)]
pub struct Series {
    pub max_rounds: u32,
    /// 1-indexed.
    pub current_round: u32,
    pub round_results: Vec<RoundResult>,
    pub wins: WinTally,
    pub series_over: bool,
    /// `None` while running, and for a tied fully-played series.
    pub series_winner: Option<Mark>,
}

impl Series {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds,
            current_round: 1,
            round_results: Vec::new(),
            wins: WinTally::default(),
            series_over: false,
            series_winner: None,
        }
    }

    /// Round wins needed to clinch the series.
    pub fn clinch_threshold(&self) -> u32 {
        self.max_rounds / 2 + 1
    }

    /// Re-evaluate the decided predicate after a round result. A mark
    /// clinches at the threshold; an exhausted series is decided by the
    /// higher tally, or undecided-winner if tied.
    fn evaluate(&mut self) -> bool {
        let clinch = self.clinch_threshold();
        if self.wins.x >= clinch {
            self.series_over = true;
            self.series_winner = Some(Mark::X);
        } else if self.wins.o >= clinch {
            self.series_over = true;
            self.series_winner = Some(Mark::O);
        } else if self.current_round >= self.max_rounds {
            self.series_over = true;
            self.series_winner = if self.wins.x > self.wins.o {
                Some(Mark::X)
            } else if self.wins.o > self.wins.x {
                Some(Mark::O)
            } else {
                None
            };
        }
        self.series_over
    }

    fn reset(&mut self) {
        self.current_round = 1;
        self.round_results.clear();
        self.wins = WinTally::default();
        self.series_over = false;
        self.series_winner = None;
    }
}

/// Outcome of an accepted move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub seq: u64,
    /// `Some` when the move ended the round.
    pub terminal: Option<RoundEnd>,
}

/// Details of a round that just ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundEnd {
    pub winner: Option<Mark>,
    pub winning_line: Option<[usize; 3]>,
    pub series_decided: bool,
    /// Set when the winner's tally first reached match point this round.
    pub newly_match_point: Option<Mark>,
}

// ---------------------------------------------------------------------------
// MatchState
// ---------------------------------------------------------------------------

/// Complete match state for one room: board, turn, series, and the live
/// tension/morale signals. All mutation happens under the owning room's
/// lock, in arrival order.
#[derive(Debug)]
pub struct MatchState {
    pub status: RoomStatus,
    pub board: Board,
    pub current_turn: Mark,
    pub tension: f64,
    pub morale: MoralePair,
    /// Append-only across the room's lifetime.
    pub move_log: Vec<MoveRecord>,
    /// Monotonic; captured at dispatch time for the staleness rule.
    pub move_seq: u64,
    pub series: Series,
    pub round_started_at: Instant,
    pub rematch_acks: HashSet<String>,
    pub last_commentary: Option<String>,
    pub peak_tension: f64,
    pub peak_morale: MoralePair,
}

impl MatchState {
    pub fn new() -> Self {
        Self {
            status: RoomStatus::Waiting,
            board: Board::new(),
            current_turn: Mark::X,
            tension: signals::BASELINE_TENSION,
            morale: MoralePair::baseline(),
            move_log: Vec::new(),
            move_seq: 0,
            series: Series::new(MAX_ROUNDS),
            round_started_at: Instant::now(),
            rematch_acks: HashSet::new(),
            last_commentary: None,
            peak_tension: signals::BASELINE_TENSION,
            peak_morale: MoralePair::baseline(),
        }
    }

    /// Round `r` starts with X iff `r` is odd.
    pub fn starting_mark(round: u32) -> Mark {
        if round % 2 == 1 { Mark::X } else { Mark::O }
    }

    /// Second seat joined: the match begins.
    pub fn begin(&mut self) {
        self.status = RoomStatus::Active;
        self.round_started_at = Instant::now();
    }

    /// Set the live signals, clamping and tracking series peaks.
    pub fn set_signals(&mut self, tension: f64, morale: MoralePair) {
        self.tension = tension.clamp(0.0, 1.0);
        self.morale = morale.clamped();
        self.peak_tension = self.peak_tension.max(self.tension);
        self.peak_morale.x = self.peak_morale.x.max(self.morale.x);
        self.peak_morale.o = self.peak_morale.o.max(self.morale.o);
    }

    /// Validate and apply one move. Every rejection maps to a distinct
    /// [`ErrorCode`]; acceptance mutates the board, appends a move record
    /// carrying the synchronous heuristic signals, and evaluates the
    /// round/series state machine.
    pub fn apply_move(&mut self, mark: Mark, cell: usize) -> Result<MoveOutcome, ErrorCode> {
        match self.status {
            RoomStatus::Waiting => return Err(ErrorCode::GameNotStarted),
            RoomStatus::RoundOver => return Err(ErrorCode::RoundTransition),
            RoomStatus::Finished => return Err(ErrorCode::GameFinished),
            RoomStatus::Active => {}
        }
        if mark != self.current_turn {
            return Err(ErrorCode::NotYourTurn);
        }
        if cell >= Board::CELLS {
            return Err(ErrorCode::InvalidCell);
        }
        if self.board.get(cell).is_some() {
            return Err(ErrorCode::CellOccupied);
        }

        self.board.place(cell, mark);
        self.move_seq += 1;
        let seq = self.move_seq;

        let (tension, morale) = signals::heuristic_scores(&self.board, &self.series);
        self.set_signals(tension, morale);
        self.move_log.push(MoveRecord {
            seq,
            cell,
            mark,
            placed_at: Instant::now(),
            tension: self.tension,
            morale: self.morale,
        });

        let terminal = match self.board.verdict() {
            Some(BoardVerdict::Win { mark: winner, line }) => {
                Some(self.finish_round(Some(winner), Some(line)))
            }
            Some(BoardVerdict::Draw) => Some(self.finish_round(None, None)),
            None => {
                self.current_turn = self.current_turn.opponent();
                None
            }
        };

        Ok(MoveOutcome { seq, terminal })
    }

    fn finish_round(&mut self, winner: Option<Mark>, line: Option<[usize; 3]>) -> RoundEnd {
        let mut newly_match_point = None;
        if let Some(w) = winner {
            // Pre/post comparison so match point fires exactly once per
            // mark per series, on the increment that first reaches it.
            let match_point = self.series.clinch_threshold().saturating_sub(1);
            let before = self.series.wins.get(w);
            self.series.wins.increment(w);
            if before < match_point && self.series.wins.get(w) == match_point {
                newly_match_point = Some(w);
            }
        }

        self.series.round_results.push(RoundResult {
            round: self.series.current_round,
            winner,
            moves: self.board.mark_count(),
            duration: self.round_started_at.elapsed(),
            tension: self.tension,
            morale: self.morale,
        });

        let decided = self.series.evaluate();
        self.status = if decided {
            RoomStatus::Finished
        } else {
            RoomStatus::RoundOver
        };

        RoundEnd {
            winner,
            winning_line: line,
            series_decided: decided,
            newly_match_point: if decided { None } else { newly_match_point },
        }
    }

    /// Advance to the next round after the round-over pause. Returns false
    /// if the room moved on in the meantime (the caller's timer is stale).
    pub fn advance_round(&mut self) -> bool {
        if self.status != RoomStatus::RoundOver || self.series.series_over {
            return false;
        }
        self.series.current_round += 1;
        self.board.clear();
        // Invalidate any in-flight upgrade for the previous round's
        // terminal move; the fresh baseline must not be overwritten.
        self.move_seq += 1;
        self.current_turn = Self::starting_mark(self.series.current_round);
        self.set_signals(signals::BASELINE_TENSION, MoralePair::baseline());
        self.status = RoomStatus::Active;
        self.round_started_at = Instant::now();
        true
    }

    /// A seat abandoned the match: the opponent wins the current round and
    /// the entire series unconditionally. No-op unless a round is live.
    pub fn forfeit(&mut self, abandoned: Mark) -> Option<Mark> {
        if self.status != RoomStatus::Active {
            return None;
        }
        let winner = abandoned.opponent();
        self.series.wins.increment(winner);
        self.series.round_results.push(RoundResult {
            round: self.series.current_round,
            winner: Some(winner),
            moves: self.board.mark_count(),
            duration: self.round_started_at.elapsed(),
            tension: self.tension,
            morale: self.morale,
        });
        self.series.series_over = true;
        self.series.series_winner = Some(winner);
        self.status = RoomStatus::Finished;
        Some(winner)
    }

    /// Record a rematch acknowledgement. Returns true once every token in
    /// `seat_tokens` has acked, at which point the series fully resets.
    pub fn rematch_ack<'a>(
        &mut self,
        token: &str,
        mut seat_tokens: impl Iterator<Item = &'a String>,
    ) -> bool {
        self.rematch_acks.insert(token.to_string());
        let all_acked = seat_tokens.all(|t| self.rematch_acks.contains(t));
        if all_acked {
            self.reset_series();
        }
        all_acked
    }

    fn reset_series(&mut self) {
        self.series.reset();
        self.board.clear();
        self.move_seq += 1;
        self.current_turn = Mark::X;
        self.tension = signals::BASELINE_TENSION;
        self.morale = MoralePair::baseline();
        self.peak_tension = signals::BASELINE_TENSION;
        self.peak_morale = MoralePair::baseline();
        self.status = RoomStatus::Active;
        self.round_started_at = Instant::now();
        self.rematch_acks.clear();
        self.last_commentary = None;
    }

    /// Apply an asynchronous intensity upgrade if — and only if — the move
    /// it describes is still the most recent. A superseded move's record
    /// is frozen; late results are discarded entirely.
    pub fn apply_intensity(&mut self, seq: u64, tension: f64, morale: MoralePair) -> bool {
        if self.move_seq != seq {
            return false;
        }
        self.set_signals(tension, morale);
        if let Some(rec) = self.move_log.last_mut()
            && rec.seq == seq
        {
            rec.tension = self.tension;
            rec.morale = self.morale;
        }
        true
    }

    /// Aggregate stats for the series-over broadcast.
    pub fn series_stats(&self) -> SeriesStats {
        SeriesStats {
            total_moves: self
                .series
                .round_results
                .iter()
                .map(|r| r.moves as u32)
                .sum(),
            peak_tension: self.peak_tension,
            peak_morale: self.peak_morale,
            final_morale: self.morale,
        }
    }
}
