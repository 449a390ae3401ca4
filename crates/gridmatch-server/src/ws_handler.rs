//! WebSocket handler for the gridmatch server.
//!
//! Each connection follows this lifecycle:
//!
//! 1. Client sends `CreateRoom`, `JoinRoom`, or `Rejoin`.
//! 2. On success the connection is bound to a room, a seat token, and a
//!    mark.
//! 3. Subsequent `ClientMessage`s are processed against that room's
//!    [`MatchState`] in arrival order, under the room lock.
//! 4. On disconnect the seat is released; if a round was live, a
//!    grace-period timer is armed that forfeits the series on expiry.
//!
//! Signal work (scoring upgrades, narration) is dispatched fire-and-forget
//! after the synchronous broadcast — it never blocks the move path.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use gridmatch_core::board::Mark;
use gridmatch_core::protocol::{
    ClientMessage, ErrorCode, NarrationTrigger, RoomStatus, ServerMessage,
};
use tokio::sync::Mutex;

use crate::AppState;
use crate::match_logic::{ROUND_ADVANCE_DELAY, RoundEnd};
use crate::narration::{self, NarrationContext};
use crate::room::{PlayerRx, Room};
use crate::signals::{self, ScoreContext};

/// Drive a single WebSocket connection.
///
/// Called after the axum upgrade; `socket` is the full-duplex WebSocket.
pub async fn handle_socket(socket: WebSocket, app: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let ws_sink = Arc::new(Mutex::new(ws_sink));

    let connection_id = app.next_connection_id();

    let room_id: String;
    let token: String;
    let mark: Mark;
    let player_rx: PlayerRx;
    let room_arc: Arc<Mutex<Room>>;

    // ── Lobby: wait for room assignment ──────────────────────────────────
    loop {
        let frame = ws_stream.next().await;
        match frame {
            Some(Ok(Message::Text(text))) => {
                let msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        send_one(&ws_sink, &ErrorCode::InvalidMessage.to_message()).await;
                        continue;
                    }
                };

                match msg {
                    ClientMessage::CreateRoom => {
                        let (rid, tok, rx, rarc) = app.manager.create_room(connection_id).await;
                        send_one(
                            &ws_sink,
                            &ServerMessage::RoomCreated {
                                room_id: rid.clone(),
                                token: tok.clone(),
                                mark: Mark::X,
                            },
                        )
                        .await;

                        room_id = rid;
                        token = tok;
                        mark = Mark::X;
                        player_rx = rx;
                        room_arc = rarc;
                        break; // → enter the game loop
                    }
                    ClientMessage::JoinRoom { room_id: ref rid } => {
                        match app.manager.join_room(rid, connection_id).await {
                            Ok((tok, rx, rarc)) => {
                                send_one(
                                    &ws_sink,
                                    &ServerMessage::JoinedRoom {
                                        room_id: rid.clone(),
                                        token: tok.clone(),
                                        mark: Mark::O,
                                    },
                                )
                                .await;

                                // Both seats occupied — announce the match.
                                {
                                    let room = rarc.lock().await;
                                    room.broadcast(&ServerMessage::GameStart {
                                        round: room.state.series.current_round,
                                        current_turn: room.state.current_turn,
                                        max_rounds: room.state.series.max_rounds,
                                    });
                                }

                                room_id = rid.clone();
                                token = tok;
                                mark = Mark::O;
                                player_rx = rx;
                                room_arc = rarc;
                                break;
                            }
                            Err(code) => {
                                send_one(&ws_sink, &code.to_message()).await;
                            }
                        }
                    }
                    ClientMessage::Rejoin {
                        room_id: ref rid,
                        token: ref tok,
                    } => {
                        match app.manager.rejoin_room(rid, tok, connection_id).await {
                            Ok((seat_mark, rx, rarc)) => {
                                // A pending forfeiture countdown is void now.
                                app.timers.cancel(tok).await;

                                let resync = {
                                    let room = rarc.lock().await;
                                    room.broadcast(&ServerMessage::PlayerReconnected {
                                        mark: seat_mark,
                                    });
                                    room.build_resync(tok)
                                };
                                // Full resync goes straight down the raw sink
                                // — the mpsc write loop isn't running yet.
                                send_one(&ws_sink, &resync).await;

                                room_id = rid.clone();
                                token = tok.clone();
                                mark = seat_mark;
                                player_rx = rx;
                                room_arc = rarc;
                                break;
                            }
                            Err(code) => {
                                send_one(&ws_sink, &code.to_message()).await;
                            }
                        }
                    }
                    ClientMessage::Ping => {
                        send_one(&ws_sink, &ServerMessage::Pong).await;
                    }
                    ClientMessage::MakeMove { .. } | ClientMessage::NewSeries { .. } => {
                        send_one(&ws_sink, &ErrorCode::NotInRoom.to_message()).await;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            _ => continue,
        }
    }

    // ── Game loop ────────────────────────────────────────────────────────
    let mut rx = player_rx;

    // Write task: drain the seat's mpsc receiver and forward messages as
    // WebSocket text frames.
    let write_sink = Arc::clone(&ws_sink);
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(_) => continue,
            };
            let mut sink = write_sink.lock().await;
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Read loop: deserialize, process, route responses.
    loop {
        match ws_stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        send_one(&ws_sink, &ErrorCode::InvalidMessage.to_message()).await;
                        continue;
                    }
                };
                process_client_message(&app, msg, &room_arc, &room_id, &token, mark).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            _ => continue,
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────
    write_handle.abort();
    handle_disconnect(&app, connection_id).await;
    tracing::info!(room = %room_id, mark = %mark, "Connection closed");
}

// ─── Helpers ─────────────────────────────────────────────────────────────

/// Send a single `ServerMessage` directly on the raw WebSocket sink
/// (used during the lobby phase before the mpsc channel is drained).
async fn send_one(
    sink: &Arc<Mutex<futures_util::stream::SplitSink<WebSocket, Message>>>,
    msg: &ServerMessage,
) {
    if let Ok(json) = serde_json::to_string(msg) {
        let mut s = sink.lock().await;
        let _ = s.send(Message::Text(json.into())).await;
    }
}

// ─── Message processing ──────────────────────────────────────────────────

/// Process a single [`ClientMessage`] within an established room session.
async fn process_client_message(
    app: &AppState,
    msg: ClientMessage,
    room_arc: &Arc<Mutex<Room>>,
    room_id: &str,
    token: &str,
    mark: Mark,
) {
    match msg {
        ClientMessage::CreateRoom
        | ClientMessage::JoinRoom { .. }
        | ClientMessage::Rejoin { .. } => {
            let room = room_arc.lock().await;
            room.send_to_token(token, &ErrorCode::AlreadyInRoom.to_message());
        }

        ClientMessage::Ping => {
            let room = room_arc.lock().await;
            room.send_to_token(token, &ServerMessage::Pong);
        }

        ClientMessage::MakeMove {
            room_id: ref rid,
            cell,
        } => {
            if rid != room_id {
                let room = room_arc.lock().await;
                room.send_to_token(token, &ErrorCode::NotInRoom.to_message());
                return;
            }
            process_move(app, room_arc, room_id, token, mark, cell).await;
        }

        ClientMessage::NewSeries { room_id: ref rid } => {
            if rid != room_id {
                let room = room_arc.lock().await;
                room.send_to_token(token, &ErrorCode::NotInRoom.to_message());
                return;
            }
            process_new_series(room_arc, room_id, token, mark).await;
        }
    }
}

/// Handle one move: validate, mutate, broadcast the immediate result with
/// its heuristic signals, then dispatch the background signal work.
async fn process_move(
    app: &AppState,
    room_arc: &Arc<Mutex<Room>>,
    room_id: &str,
    token: &str,
    mark: Mark,
    cell: usize,
) {
    let mut room = room_arc.lock().await;

    let outcome = match room.state.apply_move(mark, cell) {
        Ok(o) => o,
        Err(code) => {
            room.send_to_token(token, &code.to_message());
            return;
        }
    };

    room.broadcast(&ServerMessage::MoveMade {
        cell,
        mark,
        seq: outcome.seq,
        next_turn: room.state.current_turn,
        tension: room.state.tension,
        morale: room.state.morale,
    });

    let score_ctx = ScoreContext::capture(&room.state, cell, mark);

    match outcome.terminal {
        None => {
            let narr = NarrationContext::for_move(&room.state, cell, mark);
            drop(room);
            signals::dispatch_scoring(app.clone(), room_id.to_string(), score_ctx);
            narration::dispatch(app.clone(), room_id.to_string(), narr);
        }
        Some(end) => {
            finish_round(app, room, room_id, score_ctx, end).await;
        }
    }
}

/// Broadcast a round (and possibly series) conclusion and schedule what
/// comes next. Takes the held room guard to keep the broadcast ordering
/// (`MoveMade` → `RoundOver` → `SeriesOver`) atomic for this room.
async fn finish_round(
    app: &AppState,
    room: tokio::sync::MutexGuard<'_, Room>,
    room_id: &str,
    score_ctx: ScoreContext,
    end: RoundEnd,
) {
    room.broadcast(&ServerMessage::RoundOver {
        round: room.state.series.current_round,
        winner: end.winner,
        winning_line: end.winning_line,
        wins: room.state.series.wins,
        tension: room.state.tension,
        morale: room.state.morale,
    });

    if end.series_decided {
        let mut room = room;
        room.finished_at = Some(Instant::now());
        room.broadcast(&ServerMessage::SeriesOver {
            winner: room.state.series.series_winner,
            wins: room.state.series.wins,
            stats: room.state.series_stats(),
            forfeit: false,
        });
        tracing::info!(room = %room_id, winner = ?room.state.series.series_winner,
            "Series decided");

        let narr = NarrationContext::structural(&room.state, NarrationTrigger::SeriesEnd);
        drop(room);
        signals::dispatch_scoring(app.clone(), room_id.to_string(), score_ctx);
        narration::dispatch(app.clone(), room_id.to_string(), narr);
    } else {
        // A round that first reaches match point narrates as match point;
        // otherwise as a plain round end.
        let trigger = if end.newly_match_point.is_some() {
            NarrationTrigger::MatchPoint
        } else {
            NarrationTrigger::RoundEnd
        };
        let narr = NarrationContext::structural(&room.state, trigger);
        let finished_round = room.state.series.current_round;
        drop(room);

        signals::dispatch_scoring(app.clone(), room_id.to_string(), score_ctx);
        narration::dispatch(app.clone(), room_id.to_string(), narr);
        schedule_round_advance(app.clone(), room_id.to_string(), finished_round);
    }
}

/// After the round-over pause, reset the board and start the next round.
///
/// The task re-resolves the room through the manager and checks that the
/// room is still paused on the same round before acting — the captured
/// context is not assumed to still be authoritative.
fn schedule_round_advance(app: AppState, room_id: String, finished_round: u32) {
    tokio::spawn(async move {
        tokio::time::sleep(ROUND_ADVANCE_DELAY).await;

        let Some(room_arc) = app.manager.get_room(&room_id).await else {
            return;
        };
        let mut room = room_arc.lock().await;
        if room.state.status != RoomStatus::RoundOver
            || room.state.series.current_round != finished_round
        {
            return;
        }
        if !room.state.advance_round() {
            return;
        }

        room.broadcast(&ServerMessage::RoundStart {
            round: room.state.series.current_round,
            starting_mark: room.state.current_turn,
        });
        let narr = NarrationContext::structural(&room.state, NarrationTrigger::RoundStart);
        drop(room);
        narration::dispatch(app.clone(), room_id.clone(), narr);
    });
}

/// Handle a rematch acknowledgement. The series resets only once both
/// seats have acked.
async fn process_new_series(room_arc: &Arc<Mutex<Room>>, room_id: &str, token: &str, mark: Mark) {
    let mut room = room_arc.lock().await;

    if room.state.status != RoomStatus::Finished {
        room.send_to_token(token, &ErrorCode::SeriesNotOver.to_message());
        return;
    }

    // Seats persist across disconnects, so a Finished room always has
    // both tokens; the reset requires an ack from each.
    let seat_tokens: Vec<String> = room.seats.keys().cloned().collect();
    let reset = room.state.rematch_ack(token, seat_tokens.iter());

    if reset {
        room.finished_at = None;
        room.broadcast(&ServerMessage::GameStart {
            round: room.state.series.current_round,
            current_turn: room.state.current_turn,
            max_rounds: room.state.series.max_rounds,
        });
        tracing::info!(room = %room_id, "Series reset after mutual rematch ack");
    } else {
        room.broadcast(&ServerMessage::RematchRequested { mark });
    }
}

// ─── Disconnect handling ─────────────────────────────────────────────────

/// Release the seat and, if a round was live, arm the forfeiture countdown.
async fn handle_disconnect(app: &AppState, connection_id: u64) {
    let Some((room_arc, room_id, token, mark)) = app.manager.disconnect(connection_id).await
    else {
        return;
    };

    let status = {
        let room = room_arc.lock().await;
        room.broadcast(&ServerMessage::PlayerDisconnected {
            mark,
            grace_ms: app.config.reconnect_grace.as_millis() as u64,
        });
        room.state.status
    };

    // Arm during the round-over pause too: the scheduled round advance
    // brings the room back to Active with the seat still empty, and the
    // expiry callback re-checks status at fire time.
    if matches!(status, RoomStatus::Active | RoomStatus::RoundOver) {
        tracing::info!(room = %room_id, mark = %mark,
            "Player disconnected mid-series — seat held for {:?}", app.config.reconnect_grace);
        app.timers
            .arm(
                token,
                app.config.reconnect_grace,
                forfeit_abandoned(app.clone(), room_id, mark),
            )
            .await;
    } else {
        tracing::info!(room = %room_id, mark = %mark, "Player disconnected");
    }
}

/// Grace period expired without a reconnect: the opponent wins the round
/// and the entire series. No-op if the room's status moved on — the
/// callback, not the timer, is the source of truth.
async fn forfeit_abandoned(app: AppState, room_id: String, mark: Mark) {
    let Some(room_arc) = app.manager.get_room(&room_id).await else {
        return;
    };
    let mut room = room_arc.lock().await;
    let Some(winner) = room.state.forfeit(mark) else {
        return;
    };
    room.finished_at = Some(Instant::now());

    room.broadcast(&ServerMessage::RoundOver {
        round: room.state.series.current_round,
        winner: Some(winner),
        winning_line: None,
        wins: room.state.series.wins,
        tension: room.state.tension,
        morale: room.state.morale,
    });
    room.broadcast(&ServerMessage::SeriesOver {
        winner: Some(winner),
        wins: room.state.series.wins,
        stats: room.state.series_stats(),
        forfeit: true,
    });

    tracing::info!(room = %room_id, abandoned = %mark, winner = %winner,
        "Reconnect grace expired — series forfeited");

    let narr = NarrationContext::structural(&room.state, NarrationTrigger::SeriesEnd);
    drop(room);
    narration::dispatch(app, room_id, narr);
}
