//! In-process publish/subscribe for turn events.
//!
//! The bus decouples transcript and agent-state observation from arbitration.
//! Each room owns one [`EventBus`]; the orchestrator subscribes the arbitration
//! and rotation handlers to it, and session callbacks publish onto it.
//!
//! # Ordering contract
//!
//! [`EventBus::emit`] invokes the handlers registered for the event's name in
//! registration order, awaiting each one to completion before starting the
//! next. There is no concurrent fan-out and no back-pressure.
//!
//! The listener list is snapshotted under the bus lock and handlers run after
//! the lock is released, so a handler may itself subscribe or emit without
//! deadlocking.
//!
//! A handler returning `Err` aborts the remaining handlers of that emission
//! and the error is returned to the emitter. Handlers are not isolated from
//! one another.
//!
//! # Example
//!
//! ```rust
//! use voicepanel::event_bus::{event_callback, EventBus, TurnEvent, AGENT_REPLY_COMPLETED};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let bus = EventBus::new();
//! bus.subscribe(
//!     AGENT_REPLY_COMPLETED,
//!     event_callback(|event| async move {
//!         println!("{} finished", event.agent_name());
//!         Ok(())
//!     }),
//! )
//! .await;
//!
//! bus.emit(TurnEvent::AgentReplyCompleted {
//!     room_name: "pitch-1".into(),
//!     agent_name: "Mark".into(),
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Event name published when an agent's session observed a completed founder utterance.
pub const FOUNDER_TURN_COMPLETED: &str = "founder_turn_completed";
/// Event name published when an agent finished speaking and returned to listening/idle.
pub const AGENT_REPLY_COMPLETED: &str = "agent_reply_completed";

/// Error type returned by bus handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Asynchronous bus handler.
pub type EventCallback =
    Arc<dyn Fn(TurnEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Box an async handler function into an [`EventCallback`].
pub fn event_callback<F, Fut>(handler: F) -> EventCallback
where
    F: Fn(TurnEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |event: TurnEvent| -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(handler(event))
    })
}

/// Payloads carried on a room's bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    /// An agent's session transcribed a completed user utterance.
    FounderTurnCompleted {
        room_name: String,
        /// Agent whose session observed the utterance.
        agent_name: String,
        transcript: String,
        /// Speaker attribution, when the transport provides one.
        speaker_id: Option<String>,
    },
    /// An agent reported it is done speaking.
    AgentReplyCompleted { room_name: String, agent_name: String },
}

impl TurnEvent {
    /// Name handlers subscribe under.
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::FounderTurnCompleted { .. } => FOUNDER_TURN_COMPLETED,
            TurnEvent::AgentReplyCompleted { .. } => AGENT_REPLY_COMPLETED,
        }
    }

    pub fn room_name(&self) -> &str {
        match self {
            TurnEvent::FounderTurnCompleted { room_name, .. }
            | TurnEvent::AgentReplyCompleted { room_name, .. } => room_name,
        }
    }

    pub fn agent_name(&self) -> &str {
        match self {
            TurnEvent::FounderTurnCompleted { agent_name, .. }
            | TurnEvent::AgentReplyCompleted { agent_name, .. } => agent_name,
        }
    }
}

/// Sequential, name-keyed publish/subscribe.
pub struct EventBus {
    listeners: Mutex<HashMap<String, Vec<EventCallback>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` for events named `event`. Handlers accumulate; there is no dedupe.
    pub async fn subscribe(&self, event: &str, callback: EventCallback) {
        self.listeners
            .lock()
            .await
            .entry(event.to_string())
            .or_default()
            .push(callback);
    }

    /// Deliver `event` to every handler registered under its name, one at a time.
    ///
    /// Returns the first handler error; handlers after the failing one are not invoked.
    pub async fn emit(&self, event: TurnEvent) -> Result<(), HandlerError> {
        let listeners: Vec<EventCallback> = {
            let guard = self.listeners.lock().await;
            guard.get(event.name()).cloned().unwrap_or_default()
        };

        for callback in listeners {
            callback(event.clone()).await?;
        }
        Ok(())
    }

    /// Number of handlers registered under `event`.
    pub async fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .await
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
