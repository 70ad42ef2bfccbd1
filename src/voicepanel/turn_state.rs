//! Per-room turn state.
//!
//! [`RoomTurnState`] is the aggregate one room owns for its lifetime. All
//! mutable fields live in [`TurnState`] behind the room's async mutex, so
//! arbitration and rotation for the same room never interleave.
//!
//! A room is **Idle** while `awaiting_reply_from` is `None` and
//! **AwaitingReply** while it names an agent. Only a committed arbitration
//! decision moves Idle → AwaitingReply, and only a completion reported by that
//! same agent moves it back.

use crate::voicepanel::event_bus::EventBus;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Lock-guarded fields of a room.
#[derive(Debug)]
pub struct TurnState {
    /// Agents in rotation.
    pub agent_order: Vec<String>,
    /// Human participant whose speech is authoritative, once known.
    pub founder_identity: Option<String>,
    /// Index into `agent_order` of the agent entitled to listen and reply.
    pub next_agent_idx: usize,
    /// Recent normalized founder utterances, most recent last.
    pub shared_context: VecDeque<String>,
    /// Fingerprint of the last committed utterance.
    pub last_handled_turn_key: String,
    /// Agent currently generating a reply.
    pub awaiting_reply_from: Option<String>,
    /// Set once the opening greeting was issued.
    pub greeted: bool,
    pub(crate) rng: StdRng,
}

impl TurnState {
    pub fn new(agent_order: Vec<String>, rng: StdRng) -> Self {
        Self {
            agent_order,
            founder_identity: None,
            next_agent_idx: 0,
            shared_context: VecDeque::new(),
            last_handled_turn_key: String::new(),
            awaiting_reply_from: None,
            greeted: false,
            rng,
        }
    }

    /// Agent at `next_agent_idx`, or `None` for an empty rotation.
    pub fn selected_agent(&self) -> Option<&str> {
        self.agent_order.get(self.next_agent_idx).map(String::as_str)
    }

    /// Replace the rotation, resetting the index to 0 if it fell out of range.
    pub fn set_agent_order(&mut self, agent_order: Vec<String>) {
        self.agent_order = agent_order;
        if self.next_agent_idx >= self.agent_order.len() {
            self.next_agent_idx = 0;
        }
    }

    /// Append an utterance, evicting the oldest entries beyond `window`.
    pub fn push_context(&mut self, utterance: String, window: usize) {
        self.shared_context.push_back(utterance);
        while self.shared_context.len() > window {
            self.shared_context.pop_front();
        }
    }

    /// Render the context window as the grounding block passed to replies.
    pub fn context_block(&self) -> String {
        self.shared_context
            .iter()
            .map(|line| format!("- Founder said: {}", line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Serializable view of a room for status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSnapshot {
    pub room_name: String,
    pub agent_order: Vec<String>,
    pub selected_agent: Option<String>,
    pub awaiting_reply_from: Option<String>,
    pub founder_identity: Option<String>,
    pub context_len: usize,
    pub greeted: bool,
    pub created_at: DateTime<Utc>,
}

/// One room's turn aggregate: its lock-guarded state and its event bus.
pub struct RoomTurnState {
    room_name: String,
    state: Mutex<TurnState>,
    event_bus: EventBus,
    orchestrator_wired: AtomicBool,
    created_at: DateTime<Utc>,
}

impl RoomTurnState {
    /// Create room state. `rotation_seed` makes listener rotation reproducible.
    pub fn new(
        room_name: impl Into<String>,
        agent_order: Vec<String>,
        rotation_seed: Option<u64>,
    ) -> Self {
        let rng = match rotation_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            room_name: room_name.into(),
            state: Mutex::new(TurnState::new(agent_order, rng)),
            event_bus: EventBus::new(),
            orchestrator_wired: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Acquire the room lock.
    pub async fn lock(&self) -> MutexGuard<'_, TurnState> {
        self.state.lock().await
    }

    /// Mark the room's bus subscriptions as installed. Returns `false` if they already were.
    pub(crate) fn mark_wired(&self) -> bool {
        !self.orchestrator_wired.swap(true, Ordering::SeqCst)
    }

    pub fn is_wired(&self) -> bool {
        self.orchestrator_wired.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.lock().await;
        RoomSnapshot {
            room_name: self.room_name.clone(),
            agent_order: state.agent_order.clone(),
            selected_agent: state.selected_agent().map(str::to_string),
            awaiting_reply_from: state.awaiting_reply_from.clone(),
            founder_identity: state.founder_identity.clone(),
            context_len: state.shared_context.len(),
            greeted: state.greeted,
            created_at: self.created_at,
        }
    }
}
