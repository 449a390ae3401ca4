//! Commentary pipeline.
//!
//! Fully decoupled from scoring and from the match state machine: its own
//! timeout, its own failure isolation. Any failure — timeout, malformed
//! response, kill switch, missing API key — produces *no* commentary for
//! that trigger. There is no fallback text and no error that could reach
//! the move path.

use gridmatch_core::board::Mark;
use gridmatch_core::protocol::{MoralePair, NarrationTrigger, ServerMessage, Tone, WinTally};

use crate::AppState;
use crate::inference::InferenceOutcome;
use crate::match_logic::MatchState;

/// Commentary lines longer than this are truncated at a char boundary.
const MAX_COMMENTARY_CHARS: usize = 240;

pub const NARRATION_SYSTEM_PROMPT: &str = "You are a sharp, excitable sports commentator \
covering a best-of-five tic-tac-toe duel between X and O. Given the game situation, write \
one short, vivid line of commentary (under 25 words). Never repeat the previous line. \
Respond with a single JSON object: {\"commentary\": \"<your line>\"}";

/// Snapshot for one narration call, captured under the room lock.
pub struct NarrationContext {
    pub trigger: NarrationTrigger,
    pub tension: f64,
    morale: MoralePair,
    wins: WinTally,
    round: u32,
    max_rounds: u32,
    board_text: String,
    last_move: Option<(usize, Mark)>,
    previous_line: Option<String>,
}

impl NarrationContext {
    /// Context for an ordinary move.
    pub fn for_move(state: &MatchState, cell: usize, mark: Mark) -> Self {
        Self::build(state, NarrationTrigger::Move, Some((cell, mark)))
    }

    /// Context for a structural trigger (round end/start, series end,
    /// match point); the last move comes from the log if there is one.
    pub fn structural(state: &MatchState, trigger: NarrationTrigger) -> Self {
        let last_move = state.move_log.last().map(|r| (r.cell, r.mark));
        Self::build(state, trigger, last_move)
    }

    fn build(state: &MatchState, trigger: NarrationTrigger, last_move: Option<(usize, Mark)>) -> Self {
        Self {
            trigger,
            tension: state.tension,
            morale: state.morale,
            wins: state.series.wins,
            round: state.series.current_round,
            max_rounds: state.series.max_rounds,
            board_text: state.board.to_string(),
            last_move,
            previous_line: state.last_commentary.clone(),
        }
    }

    fn user_prompt(&self) -> String {
        let mut prompt = format!(
            "Situation: {}.\nBoard:\n{}\nSeries: X {} — O {}, round {} of {}. Tension {:.2}, \
             morale X {:.2} / O {:.2}.",
            trigger_description(self.trigger),
            self.board_text,
            self.wins.x,
            self.wins.o,
            self.round,
            self.max_rounds,
            self.tension,
            self.morale.x,
            self.morale.o,
        );
        if let Some((cell, mark)) = self.last_move {
            prompt.push_str(&format!("\nLast move: {mark} on cell {cell}."));
        }
        if let Some(previous) = &self.previous_line {
            prompt.push_str(&format!("\nPrevious line (do not repeat): \"{previous}\""));
        }
        prompt
    }
}

fn trigger_description(trigger: NarrationTrigger) -> &'static str {
    match trigger {
        NarrationTrigger::Move => "a move was just played",
        NarrationTrigger::RoundEnd => "the round just ended",
        NarrationTrigger::RoundStart => "a fresh round is starting",
        NarrationTrigger::SeriesEnd => "the series is over",
        NarrationTrigger::MatchPoint => "a player just reached match point",
    }
}

/// Fire-and-forget narration for one trigger.
pub fn dispatch(app: AppState, room_id: String, ctx: NarrationContext) {
    if !app.config.narration_enabled || !app.inference.enabled() {
        return;
    }

    tokio::spawn(async move {
        let outcome = app
            .inference
            .infer_with_timeout(
                NARRATION_SYSTEM_PROMPT,
                &ctx.user_prompt(),
                app.config.narration_timeout,
            )
            .await;

        let text = match outcome {
            InferenceOutcome::Success(value) => match extract_commentary(&value) {
                Some(text) => text,
                None => {
                    tracing::debug!(room = %room_id, trigger = ?ctx.trigger,
                        "Narration response had no usable commentary, skipping");
                    return;
                }
            },
            InferenceOutcome::TimedOut => {
                tracing::debug!(room = %room_id, trigger = ?ctx.trigger,
                    "Narration call timed out, skipping");
                return;
            }
            InferenceOutcome::Failed(reason) => {
                tracing::debug!(room = %room_id, trigger = ?ctx.trigger, %reason,
                    "Narration call failed, skipping");
                return;
            }
        };

        let Some(room_arc) = app.manager.get_room(&room_id).await else {
            return;
        };
        let mut room = room_arc.lock().await;
        room.state.last_commentary = Some(text.clone());
        room.broadcast(&ServerMessage::NarrationUpdate {
            text,
            trigger: ctx.trigger,
            tension: ctx.tension,
            tone: Tone::for_tension(ctx.tension),
        });
    });
}

fn extract_commentary(value: &serde_json::Value) -> Option<String> {
    let text = value.get("commentary")?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    let mut text = text.to_string();
    if text.chars().count() > MAX_COMMENTARY_CHARS {
        text = text.chars().take(MAX_COMMENTARY_CHARS).collect();
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commentary_extraction_rejects_junk() {
        assert_eq!(extract_commentary(&json!({})), None);
        assert_eq!(extract_commentary(&json!({ "commentary": 42 })), None);
        assert_eq!(extract_commentary(&json!({ "commentary": "   " })), None);
        assert_eq!(
            extract_commentary(&json!({ "commentary": "What a block!" })),
            Some("What a block!".to_string())
        );
    }

    #[test]
    fn overlong_commentary_is_truncated() {
        let long = "x".repeat(1000);
        let text = extract_commentary(&json!({ "commentary": long })).unwrap();
        assert_eq!(text.chars().count(), MAX_COMMENTARY_CHARS);
    }

    #[test]
    fn prompt_carries_previous_line_for_novelty() {
        let mut state = MatchState::new();
        state.begin();
        state.apply_move(Mark::X, 4).unwrap();
        state.last_commentary = Some("X opens in the center!".to_string());

        let ctx = NarrationContext::structural(&state, NarrationTrigger::Move);
        let prompt = ctx.user_prompt();
        assert!(prompt.contains("do not repeat"));
        assert!(prompt.contains("X opens in the center!"));
        assert!(prompt.contains("Last move: X on cell 4."));
    }
}
