//! Cleanup sweeper.
//!
//! Rooms are never garbage-collected synchronously from an event handler;
//! forfeiture merely marks a room finished, and this periodic pass is the
//! only deleter. A room goes when every seat has been disconnected past
//! the grace window, or when it has sat finished past the idle ceiling. All access goes through the manager's synchronized
//! path, so the sweep runs safely alongside live event handling.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::room::RoomManager;

pub fn spawn(manager: Arc<RoomManager>, config: Arc<Config>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let removed = sweep_once(&manager, &config).await;
            if removed > 0 {
                tracing::info!(removed, "Cleanup sweep removed abandoned rooms");
            }
        }
    })
}

/// One sweep pass. Returns the number of rooms removed.
pub async fn sweep_once(manager: &RoomManager, config: &Config) -> usize {
    let mut removed = 0;
    for room_id in manager.list_rooms().await {
        // Re-resolve each room; another task may have raced us.
        let Some(room_arc) = manager.get_room(&room_id).await else {
            continue;
        };

        let expired = {
            let room = room_arc.lock().await;
            let abandoned = room.abandoned_for(config.reconnect_grace);
            let stale_finished = room
                .finished_at
                .map(|t| t.elapsed() >= config.finished_room_ttl)
                .unwrap_or(false);
            abandoned || stale_finished
        };

        if expired {
            manager.remove_room(&room_id).await;
            tracing::info!(room = %room_id, "Swept abandoned room");
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            reconnect_grace: Duration::from_secs(30),
            finished_room_ttl: Duration::from_secs(600),
            ..Config::default()
        }
    }

    fn long_ago(age: Duration) -> Instant {
        Instant::now().checked_sub(age).expect("instant in range")
    }

    #[tokio::test]
    async fn sweeps_rooms_abandoned_past_the_grace_window() {
        let manager = RoomManager::new();
        let config = test_config();
        let (room_id, token, _rx, room_arc) = manager.create_room(1).await;
        manager.disconnect(1).await.unwrap();

        // Still within the grace window: kept.
        assert_eq!(sweep_once(&manager, &config).await, 0);
        assert!(manager.get_room(&room_id).await.is_some());

        {
            let mut room = room_arc.lock().await;
            let seat = room.seats.get_mut(&token).unwrap();
            seat.disconnected_at = Some(long_ago(Duration::from_secs(31)));
        }
        assert_eq!(sweep_once(&manager, &config).await, 1);
        assert!(manager.get_room(&room_id).await.is_none());
    }

    #[tokio::test]
    async fn sweeps_finished_rooms_past_the_idle_ceiling() {
        let manager = RoomManager::new();
        let config = test_config();
        let (room_id, _token, _rx, room_arc) = manager.create_room(1).await;

        {
            let mut room = room_arc.lock().await;
            room.finished_at = Some(long_ago(Duration::from_secs(601)));
        }
        assert_eq!(sweep_once(&manager, &config).await, 1);
        assert!(manager.get_room(&room_id).await.is_none());
        // Its reverse-index entry goes with it.
        assert!(manager.resolve_by_connection(1).await.is_none());
    }

    #[tokio::test]
    async fn keeps_live_and_recently_finished_rooms() {
        let manager = RoomManager::new();
        let config = test_config();
        let (room_id, _token, _rx, room_arc) = manager.create_room(1).await;

        {
            let mut room = room_arc.lock().await;
            room.finished_at = Some(Instant::now());
        }
        assert_eq!(sweep_once(&manager, &config).await, 0);
        assert!(manager.get_room(&room_id).await.is_some());
    }
}
