//! Tension/morale scoring.
//!
//! Every accepted move gets a deterministic heuristic score synchronously
//! — published with the move itself, never absent, always in range. A
//! background task then races the inference service against the scoring
//! timeout and, if the move is still the most recent when the result
//! lands, upgrades the live signals and re-broadcasts. A stale result is
//! discarded silently: it no longer describes the current game state.

use gridmatch_core::board::{Board, Mark};
use gridmatch_core::protocol::{MoralePair, ServerMessage, SignalSource, WinTally};
use serde_json::Value;

use crate::AppState;
use crate::inference::InferenceOutcome;
use crate::match_logic::{MatchState, Series};

/// Tension on an empty board.
pub const BASELINE_TENSION: f64 = 0.1;

pub const SCORING_SYSTEM_PROMPT: &str = "You are scoring the drama of a competitive \
tic-tac-toe duel played as a best-of-five series. Given a position, rate the \
objective tension of the game state and each player's morale, all between 0 and 1. \
Respond with a single JSON object: \
{\"tension\": <0..1>, \"morale_x\": <0..1>, \"morale_o\": <0..1>}";

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

/// Deterministic, zero-latency scores for the current position. Tension
/// grows with board progress and open threats; morale leans on the series
/// standing and the threat balance.
pub fn heuristic_scores(board: &Board, series: &Series) -> (f64, MoralePair) {
    let threats_x = board.threats_for(Mark::X);
    let threats_o = board.threats_for(Mark::O);
    let progress = board.mark_count() as f64 / Board::CELLS as f64;

    let tension = (BASELINE_TENSION
        + 0.3 * progress
        + 0.2 * (threats_x + threats_o).min(3) as f64)
        .clamp(0.0, 1.0);

    let morale = MoralePair {
        x: heuristic_morale(Mark::X, threats_x, threats_o, &series.wins),
        o: heuristic_morale(Mark::O, threats_o, threats_x, &series.wins),
    };

    (tension, morale)
}

fn heuristic_morale(mark: Mark, threats_own: usize, threats_opp: usize, wins: &WinTally) -> f64 {
    let win_lead = wins.get(mark) as f64 - wins.get(mark.opponent()) as f64;
    let threat_lead = threats_own as f64 - threats_opp as f64;
    (0.5 + 0.12 * win_lead + 0.08 * threat_lead).clamp(0.05, 0.95)
}

/// Series-pressure amplification for heuristic-sourced tension. The
/// inference call reasons about series pressure itself, so its scores are
/// never amplified — only the fallback is, to avoid double-counting.
pub fn series_pressure(series: &Series) -> f64 {
    let match_point = series.clinch_threshold().saturating_sub(1);
    if series.wins.x >= match_point || series.wins.o >= match_point {
        1.3
    } else if series.current_round >= series.max_rounds {
        1.2
    } else {
        1.0
    }
}

/// Validate an inference response: all three fields must be numeric, and
/// in-range values are enforced by clamping. Anything else is a failure.
pub fn extract_scores(value: &Value) -> Option<(f64, MoralePair)> {
    let tension = value.get("tension")?.as_f64()?;
    let x = value.get("morale_x")?.as_f64()?;
    let o = value.get("morale_o")?.as_f64()?;
    Some((
        tension.clamp(0.0, 1.0),
        MoralePair { x, o }.clamped(),
    ))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Snapshot of everything the background scoring task needs, captured
/// under the room lock at dispatch time. The task never touches the room
/// again until it re-resolves it through the manager to apply-if-current.
pub struct ScoreContext {
    pub seq: u64,
    pub cell: usize,
    pub mark: Mark,
    board_text: String,
    wins: WinTally,
    round: u32,
    max_rounds: u32,
    heuristic_tension: f64,
    heuristic_morale: MoralePair,
    pressure: f64,
}

impl ScoreContext {
    pub fn capture(state: &MatchState, cell: usize, mark: Mark) -> Self {
        Self {
            seq: state.move_seq,
            cell,
            mark,
            board_text: state.board.to_string(),
            wins: state.series.wins,
            round: state.series.current_round,
            max_rounds: state.series.max_rounds,
            // The live signals at capture time are the move's heuristics —
            // no upgrade can have landed while the lock is held.
            heuristic_tension: state.tension,
            heuristic_morale: state.morale,
            pressure: series_pressure(&state.series),
        }
    }

    fn user_prompt(&self) -> String {
        format!(
            "Board after {} played cell {}:\n{}\nSeries standing: X {} — O {}, round {} of {}.\n\
             Score the current tension and each player's morale.",
            self.mark, self.cell, self.board_text, self.wins.x, self.wins.o, self.round,
            self.max_rounds,
        )
    }

    /// Heuristic fallback with the series-pressure amplification applied.
    pub fn fallback(&self) -> (f64, MoralePair) {
        (
            (self.heuristic_tension * self.pressure).clamp(0.0, 1.0),
            self.heuristic_morale,
        )
    }
}

/// Fire-and-forget scoring upgrade for one move. Never blocks the move
/// path; a disabled inference client skips the upgrade entirely and the
/// published heuristic stands.
pub fn dispatch_scoring(app: AppState, room_id: String, ctx: ScoreContext) {
    if !app.inference.enabled() {
        return;
    }

    tokio::spawn(async move {
        let outcome = app
            .inference
            .infer_with_timeout(
                SCORING_SYSTEM_PROMPT,
                &ctx.user_prompt(),
                app.config.inference_timeout,
            )
            .await;

        let (tension, morale, source) = match outcome {
            InferenceOutcome::Success(value) => match extract_scores(&value) {
                Some((t, m)) => (t, m, SignalSource::Model),
                None => {
                    tracing::debug!(room = %room_id, seq = ctx.seq,
                        "Scoring response missing numeric fields, using heuristic");
                    let (t, m) = ctx.fallback();
                    (t, m, SignalSource::Heuristic)
                }
            },
            InferenceOutcome::TimedOut => {
                tracing::debug!(room = %room_id, seq = ctx.seq,
                    "Scoring call timed out, using heuristic");
                let (t, m) = ctx.fallback();
                (t, m, SignalSource::Heuristic)
            }
            InferenceOutcome::Failed(reason) => {
                tracing::debug!(room = %room_id, seq = ctx.seq, %reason,
                    "Scoring call failed, using heuristic");
                let (t, m) = ctx.fallback();
                (t, m, SignalSource::Heuristic)
            }
        };

        // Re-resolve through the manager: the room may have been swept
        // while the call was in flight.
        let Some(room_arc) = app.manager.get_room(&room_id).await else {
            return;
        };
        let mut room = room_arc.lock().await;
        if !room.state.apply_intensity(ctx.seq, tension, morale) {
            tracing::trace!(room = %room_id, seq = ctx.seq, "Discarding stale intensity upgrade");
            return;
        }
        room.broadcast(&ServerMessage::IntensityUpdate {
            seq: ctx.seq,
            tension: room.state.tension,
            morale: room.state.morale,
            source,
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn series_with(wins_x: u32, wins_o: u32, round: u32) -> Series {
        let mut s = Series::new(5);
        s.wins = WinTally {
            x: wins_x,
            o: wins_o,
        };
        s.current_round = round;
        s
    }

    #[test]
    fn heuristics_stay_in_range_across_a_full_game() {
        let series = Series::new(5);
        let mut board = Board::new();
        let script = [
            (Mark::X, 0),
            (Mark::O, 4),
            (Mark::X, 8),
            (Mark::O, 1),
            (Mark::X, 7),
            (Mark::O, 6),
            (Mark::X, 2),
            (Mark::O, 5),
            (Mark::X, 3),
        ];
        for (mark, cell) in script {
            board.place(cell, mark);
            let (tension, morale) = heuristic_scores(&board, &series);
            assert!((0.0..=1.0).contains(&tension));
            assert!((0.0..=1.0).contains(&morale.x));
            assert!((0.0..=1.0).contains(&morale.o));
        }
    }

    #[test]
    fn threats_raise_tension() {
        let series = Series::new(5);
        let mut quiet = Board::new();
        quiet.place(0, Mark::X);
        quiet.place(4, Mark::O);

        let mut loaded = Board::new();
        loaded.place(0, Mark::X);
        loaded.place(1, Mark::X); // open threat on [0,1,2]
        loaded.place(4, Mark::O);

        let (quiet_t, _) = heuristic_scores(&quiet, &series);
        let (loaded_t, _) = heuristic_scores(&loaded, &series);
        assert!(loaded_t > quiet_t);
    }

    #[test]
    fn leading_the_series_lifts_morale() {
        let board = Board::new();
        let (_, morale) = heuristic_scores(&board, &series_with(2, 0, 3));
        assert!(morale.x > 0.5);
        assert!(morale.o < 0.5);
    }

    #[test]
    fn pressure_amplifies_only_under_series_pressure() {
        assert_eq!(series_pressure(&series_with(0, 0, 1)), 1.0);
        assert_eq!(series_pressure(&series_with(2, 0, 3)), 1.3); // match point
        assert_eq!(series_pressure(&series_with(1, 1, 5)), 1.2); // deciding round
    }

    #[test]
    fn extraction_rejects_missing_or_non_numeric_fields() {
        assert!(extract_scores(&json!({})).is_none());
        assert!(extract_scores(&json!({ "tension": 0.5, "morale_x": 0.5 })).is_none());
        assert!(
            extract_scores(&json!({ "tension": "high", "morale_x": 0.5, "morale_o": 0.5 }))
                .is_none()
        );
    }

    #[test]
    fn extraction_clamps_out_of_range_values() {
        let (tension, morale) = extract_scores(&json!({
            "tension": 3.2,
            "morale_x": -1.0,
            "morale_o": 0.7,
        }))
        .unwrap();
        assert_eq!(tension, 1.0);
        assert_eq!(morale.x, 0.0);
        assert_eq!(morale.o, 0.7);
    }

    #[test]
    fn fallback_amplifies_heuristic_tension_but_not_morale() {
        let mut state = MatchState::new();
        state.begin();
        state.series.wins = WinTally { x: 2, o: 0 };
        state.apply_move(Mark::X, 4).unwrap();

        let ctx = ScoreContext::capture(&state, 4, Mark::X);
        let (tension, morale) = ctx.fallback();
        assert!(tension > state.tension || tension == 1.0);
        assert_eq!(morale, state.morale);
        assert!(tension <= 1.0);
    }
}
