//! Listener rotation and audio-subscription sync.
//!
//! When the agent the room is waiting on reports that it finished speaking,
//! the room returns to Idle and a new listener is drawn uniformly at random
//! from every other agent in rotation. The draw uses the room's own RNG, which
//! is seeded from [`PanelConfig::rotation_seed`](crate::PanelConfig) when one is
//! configured.
//!
//! Rotation then re-routes audio so only the new listener receives the
//! founder's audio; everyone else is muted. This holds at the transport layer
//! independently of the text-level gates in [`arbitration`](crate::arbitration).

use crate::voicepanel::orchestrator::PanelError;
use crate::voicepanel::registry::ConnectionRegistry;
use crate::voicepanel::turn_manager::TurnManager;
use crate::voicepanel::turn_state::{RoomTurnState, TurnState};
use rand::seq::IndexedRandom;

/// Result of a completion signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The reporting agent was not the one being awaited; nothing changed.
    Skipped { awaiting: Option<String> },
    /// The room returned to Idle and `to` is now the selected listener.
    Rotated { from: String, to: Option<String> },
}

/// Move `next_agent_idx` to a random agent other than `current_agent`.
///
/// No-op when fewer than two agents are in rotation. Returns the new index
/// when it changed.
pub fn pick_next_listener(state: &mut TurnState, current_agent: &str) -> Option<usize> {
    if state.agent_order.len() < 2 {
        return None;
    }
    let candidates: Vec<usize> = state
        .agent_order
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() != current_agent)
        .map(|(idx, _)| idx)
        .collect();
    let next = *candidates.choose(&mut state.rng)?;
    state.next_agent_idx = next;
    Some(next)
}

/// Route the founder's audio to the selected agent and mute every other session.
pub fn sync_audio_subscriptions(room_name: &str, state: &TurnState, connections: &ConnectionRegistry) {
    let Some(selected) = state.selected_agent() else {
        return;
    };
    for agent_name in &state.agent_order {
        let Some(conn) = connections.get(room_name, agent_name) else {
            continue;
        };
        let participant = if agent_name == selected {
            state.founder_identity.as_deref()
        } else {
            None
        };
        conn.session.set_audio_participant(participant);
    }
}

/// Handle "agent finished speaking" for `agent_name`.
///
/// Only the agent the room is awaiting can clear it. When a [`TurnManager`] is
/// in use, that agent's turn claim is released after the rotation; a failed
/// release is logged and does not undo the rotation.
pub async fn handle_reply_completed(
    room: &RoomTurnState,
    agent_name: &str,
    connections: &ConnectionRegistry,
    turn_manager: Option<&dyn TurnManager>,
) -> Result<RotationOutcome, PanelError> {
    let room_name = room.room_name();
    let mut state = room.lock().await;

    if state.awaiting_reply_from.as_deref() != Some(agent_name) {
        log::info!(
            "listener-rotate skip room={} trigger={} awaiting={}",
            room_name,
            agent_name,
            state.awaiting_reply_from.as_deref().unwrap_or("<none>")
        );
        return Ok(RotationOutcome::Skipped {
            awaiting: state.awaiting_reply_from.clone(),
        });
    }

    state.awaiting_reply_from = None;
    pick_next_listener(&mut state, agent_name);
    sync_audio_subscriptions(room_name, &state, connections);

    // An unreleased claim lapses with its TTL; the local rotation stands either way
    if let Some(manager) = turn_manager {
        match manager.release(room_name, agent_name).await {
            Ok(released) => log::debug!(
                "turn-lock release room={} agent={} released={}",
                room_name,
                agent_name,
                released
            ),
            Err(err) => log::warn!(
                "turn-lock release failed room={} agent={}: {}",
                room_name,
                agent_name,
                err
            ),
        }
    }

    let to = state.selected_agent().map(str::to_string);
    log::info!(
        "listener-rotate room={} from={} to={}",
        room_name,
        agent_name,
        to.as_deref().unwrap_or("<none>")
    );
    Ok(RotationOutcome::Rotated {
        from: agent_name.to_string(),
        to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn state_with(order: &[&str], seed: u64) -> TurnState {
        TurnState::new(
            order.iter().map(|name| name.to_string()).collect(),
            StdRng::seed_from_u64(seed),
        )
    }

    #[test]
    fn never_repeats_the_finishing_agent() {
        let mut state = state_with(&["Mark", "Kevin", "Lori"], 42);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let current = state.selected_agent().unwrap().to_string();
            pick_next_listener(&mut state, &current).unwrap();
            let next = state.selected_agent().unwrap().to_string();
            assert_ne!(current, next);
            seen.insert(next);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn same_seed_same_rotation() {
        let run = |seed| {
            let mut state = state_with(&["Mark", "Kevin", "Lori", "Robert"], seed);
            (0..20)
                .map(|_| {
                    let current = state.selected_agent().unwrap().to_string();
                    pick_next_listener(&mut state, &current);
                    state.next_agent_idx
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn single_agent_rotation_is_a_no_op() {
        let mut state = state_with(&["Mark"], 1);
        assert_eq!(pick_next_listener(&mut state, "Mark"), None);
        assert_eq!(state.next_agent_idx, 0);

        let mut empty = state_with(&[], 1);
        assert_eq!(pick_next_listener(&mut empty, "Mark"), None);
    }

    #[test]
    fn two_agents_alternate() {
        let mut state = state_with(&["Mark", "Kevin"], 5);
        assert_eq!(pick_next_listener(&mut state, "Mark"), Some(1));
        assert_eq!(pick_next_listener(&mut state, "Kevin"), Some(0));
    }
}
