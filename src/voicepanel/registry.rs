//! Explicitly owned registries for rooms and agent connections.
//!
//! A [`RoomRegistry`] is an arena of [`RoomTurnState`]s keyed by room name.
//! Entries are created on the first join and removed by
//! [`RoomRegistry::remove`] when the room closes. A [`ConnectionRegistry`]
//! maps `(room, agent)` to the agent's [`ManagedAgentConnection`]. Rooms never
//! share entries; the room name is the unit of isolation.

use crate::voicepanel::session::ManagedAgentConnection;
use crate::voicepanel::turn_state::RoomTurnState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Arena of per-room turn state.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<RoomTurnState>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the room's state, creating it with `agent_names` on first use.
    ///
    /// On reuse the rotation is replaced by `agent_names` and an out-of-range
    /// `next_agent_idx` is reset to 0.
    pub async fn ensure_room(
        &self,
        room_name: &str,
        agent_names: &[String],
        rotation_seed: Option<u64>,
    ) -> Arc<RoomTurnState> {
        let (room, created) = {
            let mut rooms = lock_recovering(&self.rooms);
            match rooms.get(room_name) {
                Some(room) => (Arc::clone(room), false),
                None => {
                    log::info!("room-create room={} agents={:?}", room_name, agent_names);
                    let room = Arc::new(RoomTurnState::new(
                        room_name,
                        agent_names.to_vec(),
                        rotation_seed,
                    ));
                    rooms.insert(room_name.to_string(), Arc::clone(&room));
                    (room, true)
                }
            }
        };
        if !created {
            room.lock().await.set_agent_order(agent_names.to_vec());
        }
        room
    }

    pub fn get(&self, room_name: &str) -> Option<Arc<RoomTurnState>> {
        lock_recovering(&self.rooms).get(room_name).cloned()
    }

    pub fn remove(&self, room_name: &str) -> Option<Arc<RoomTurnState>> {
        lock_recovering(&self.rooms).remove(room_name)
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_recovering(&self.rooms).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        lock_recovering(&self.rooms).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live agent connections keyed by `(room, agent)`.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<(String, String), ManagedAgentConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room_name: &str, agent_name: &str) -> Option<ManagedAgentConnection> {
        lock_recovering(&self.connections)
            .get(&(room_name.to_string(), agent_name.to_string()))
            .cloned()
    }

    /// Register a connection, returning the one it replaced.
    pub fn insert(&self, room_name: &str, connection: ManagedAgentConnection) -> Option<ManagedAgentConnection> {
        let key = (room_name.to_string(), connection.agent_name.clone());
        lock_recovering(&self.connections).insert(key, connection)
    }

    pub fn remove(&self, room_name: &str, agent_name: &str) -> Option<ManagedAgentConnection> {
        lock_recovering(&self.connections).remove(&(room_name.to_string(), agent_name.to_string()))
    }

    /// Drop every connection registered for `room_name`.
    pub fn remove_room(&self, room_name: &str) -> Vec<ManagedAgentConnection> {
        let mut connections = lock_recovering(&self.connections);
        let keys: Vec<(String, String)> = connections
            .keys()
            .filter(|(room, _)| room == room_name)
            .cloned()
            .collect();
        let mut removed: Vec<ManagedAgentConnection> = keys
            .iter()
            .filter_map(|key| connections.remove(key))
            .collect();
        removed.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        removed
    }

    /// Agents with a registered connection in `room_name`, sorted.
    pub fn agents_in(&self, room_name: &str) -> Vec<String> {
        let mut agents: Vec<String> = lock_recovering(&self.connections)
            .keys()
            .filter(|(room, _)| room == room_name)
            .map(|(_, agent)| agent.clone())
            .collect();
        agents.sort();
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn ensure_room_creates_once_and_updates_rotation() {
        let registry = RoomRegistry::new();
        let first = registry
            .ensure_room("pitch", &names(&["Mark", "Kevin", "Lori"]), Some(1))
            .await;
        first.lock().await.next_agent_idx = 2;

        let second = registry
            .ensure_room("pitch", &names(&["Mark", "Kevin"]), Some(1))
            .await;
        assert!(Arc::ptr_eq(&first, &second));
        let state = second.lock().await;
        assert_eq!(state.agent_order, names(&["Mark", "Kevin"]));
        assert_eq!(state.next_agent_idx, 0);
    }

    #[tokio::test]
    async fn rooms_are_isolated_and_removable() {
        let registry = RoomRegistry::new();
        let a = registry.ensure_room("a", &names(&["Mark"]), None).await;
        let b = registry.ensure_room("b", &names(&["Kevin"]), None).await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_names(), names(&["a", "b"]));

        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a").is_none());
    }

    #[tokio::test]
    async fn racing_joins_both_apply_their_rotation() {
        let registry = Arc::new(RoomRegistry::new());
        let mut handles = Vec::new();
        for order in [names(&["Mark", "Kevin", "Lori"]), names(&["Mark", "Kevin"])] {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let room = registry.ensure_room("pitch", &order, None).await;
                (room, order)
            }));
        }
        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap());
        }
        assert!(Arc::ptr_eq(&rooms[0].0, &rooms[1].0));

        // Whichever call ran last decides the order; it must be one of the two
        let order = rooms[0].0.lock().await.agent_order.clone();
        assert!(order == rooms[0].1 || order == rooms[1].1);

        // A later join always wins
        registry.ensure_room("pitch", &names(&["Lori"]), None).await;
        assert_eq!(registry.get("pitch").unwrap().lock().await.agent_order, names(&["Lori"]));
    }
}
