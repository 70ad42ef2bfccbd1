//! Room orchestration: wiring sessions, the event bus and the turn logic together.
//!
//! # Architecture
//!
//! ```text
//! PanelOrchestrator
//!   ├─ RoomRegistry        room → RoomTurnState (lock + EventBus)
//!   ├─ ConnectionRegistry  (room, agent) → ManagedAgentConnection
//!   ├─ AgentConnector      external: connects agents, starts sessions
//!   └─ TurnManager?        optional cross-process turn claims
//!
//! session event ──► observe_session_event ──runtime.spawn──► EventBus.emit
//!     founder_turn_completed ──► arbitration::handle_user_turn ──► session.generate_reply
//!     agent_reply_completed  ──► rotation::handle_reply_completed ──► set_audio_participant
//! ```
//!
//! Bus handlers hold only weak references back to the orchestrator, so
//! closing a room (or dropping the orchestrator) releases everything.
//!
//! # Example
//!
//! ```rust,no_run
//! use voicepanel::{PanelConfig, PanelOrchestrator};
//! use voicepanel::session::AgentConnector;
//! use std::sync::Arc;
//!
//! # async fn example(connector: Arc<dyn AgentConnector>) -> Result<(), voicepanel::PanelError> {
//! let config = PanelConfig::from_env();
//! let panel = PanelOrchestrator::from_config(config, connector).await?;
//!
//! let names = panel.config().default_agent_names();
//! let joined = panel.join_agents("pitch-42", &names, Some("founder-7")).await?;
//! println!("joined {:?}", joined);
//! # Ok(())
//! # }
//! ```

use crate::voicepanel::arbitration::{self, DropReason, TurnDecision, UtteranceObservation};
use crate::voicepanel::config::PanelConfig;
use crate::voicepanel::event_bus::{
    event_callback, HandlerError, TurnEvent, AGENT_REPLY_COMPLETED, FOUNDER_TURN_COMPLETED,
};
use crate::voicepanel::registry::{ConnectionRegistry, RoomRegistry};
use crate::voicepanel::rotation::{self, RotationOutcome};
use crate::voicepanel::session::{
    AgentConnector, AgentJoinRequest, AgentSession, ChatRole, ManagedAgentConnection,
    ReplyRequest, SessionEvent,
};
use crate::voicepanel::turn_manager::{create_turn_manager, TurnManager, TurnManagerError};
use crate::voicepanel::turn_state::{RoomSnapshot, RoomTurnState};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors surfaced by the orchestrator to the collaborator layer.
///
/// ```
/// use voicepanel::PanelError;
///
/// let err = PanelError::UnknownAgent("Barbara".into());
/// assert_eq!(err.to_string(), "Unsupported agent name: Barbara");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum PanelError {
    /// No persona is configured under this name.
    UnknownAgent(String),
    /// A credential needed to start sessions is not configured.
    MissingCredentials(String),
    RoomNotFound(String),
    /// The connector failed to bring an agent into the room.
    ConnectionFailed { agent: String, message: String },
    /// A session refused a reply instruction.
    ReplyFailed { agent: String, message: String },
    TurnLock(TurnManagerError),
    /// A bus handler failed during emission.
    Handler(String),
}

impl fmt::Display for PanelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanelError::UnknownAgent(name) => write!(f, "Unsupported agent name: {}", name),
            PanelError::MissingCredentials(what) => write!(f, "{} not configured", what),
            PanelError::RoomNotFound(room) => write!(f, "Room not found: {}", room),
            PanelError::ConnectionFailed { agent, message } => {
                write!(f, "Failed to connect {}: {}", agent, message)
            }
            PanelError::ReplyFailed { agent, message } => {
                write!(f, "Reply from {} failed: {}", agent, message)
            }
            PanelError::TurnLock(err) => write!(f, "{}", err),
            PanelError::Handler(msg) => write!(f, "Event handler failed: {}", msg),
        }
    }
}

impl Error for PanelError {}

impl From<TurnManagerError> for PanelError {
    fn from(err: TurnManagerError) -> Self {
        PanelError::TurnLock(err)
    }
}

/// Owns every room this process arbitrates.
pub struct PanelOrchestrator {
    config: PanelConfig,
    rooms: RoomRegistry,
    connections: ConnectionRegistry,
    connector: Arc<dyn AgentConnector>,
    turn_manager: Option<Arc<dyn TurnManager>>,
    join_lock: Mutex<()>,
}

impl PanelOrchestrator {
    pub fn new(config: PanelConfig, connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            config,
            rooms: RoomRegistry::new(),
            connections: ConnectionRegistry::new(),
            connector,
            turn_manager: None,
            join_lock: Mutex::new(()),
        }
    }

    /// Require a cross-process turn claim for every commit.
    pub fn with_turn_manager(mut self, turn_manager: Arc<dyn TurnManager>) -> Self {
        self.turn_manager = Some(turn_manager);
        self
    }

    /// Build an orchestrator, attaching the external turn manager when `redis_url` is configured.
    pub async fn from_config(
        config: PanelConfig,
        connector: Arc<dyn AgentConnector>,
    ) -> Result<Arc<Self>, PanelError> {
        let turn_manager = match config.redis_url.as_deref() {
            Some(url) => Some(create_turn_manager(Some(url)).await?),
            None => None,
        };
        let mut orchestrator = Self::new(config, connector);
        orchestrator.turn_manager = turn_manager;
        Ok(Arc::new(orchestrator))
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn turn_manager(&self) -> Option<&Arc<dyn TurnManager>> {
        self.turn_manager.as_ref()
    }

    pub async fn snapshot(&self, room_name: &str) -> Option<RoomSnapshot> {
        match self.rooms.get(room_name) {
            Some(room) => Some(room.snapshot().await),
            None => None,
        }
    }

    /// Connect `agent_names` to `room_name` and start arbitrating the room.
    ///
    /// Already-connected agents are reused. After joining, audio is routed to
    /// the selected listener and, once per room, the first agent in rotation
    /// greets the founder. Returns the connected agent names, sorted.
    pub async fn join_agents(
        self: &Arc<Self>,
        room_name: &str,
        agent_names: &[String],
        founder_identity: Option<&str>,
    ) -> Result<Vec<String>, PanelError> {
        if self.config.model_api_key.is_none() {
            return Err(PanelError::MissingCredentials("GOOGLE_API_KEY".to_string()));
        }
        let profiles = agent_names
            .iter()
            .map(|name| {
                self.config
                    .profile(name)
                    .cloned()
                    .ok_or_else(|| PanelError::UnknownAgent(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let room = self
            .rooms
            .ensure_room(room_name, agent_names, self.config.rotation_seed)
            .await;
        room.lock().await.founder_identity = founder_identity.map(str::to_string);
        self.wire_room(&room).await;

        let _join_guard = self.join_lock.lock().await;
        let mut connected = Vec::with_capacity(profiles.len());

        for profile in profiles {
            let agent_name = profile.name.clone();
            if let Some(existing) = self.connections.get(room_name, &agent_name) {
                if existing.room.is_connected() {
                    connected.push(agent_name);
                    continue;
                }
            }

            let initial_audio_participant = {
                let state = room.lock().await;
                if state.selected_agent() == Some(agent_name.as_str()) {
                    state.founder_identity.clone()
                } else {
                    None
                }
            };
            let connection = self
                .connector
                .connect_agent(AgentJoinRequest {
                    room_name: room_name.to_string(),
                    profile,
                    initial_audio_participant,
                })
                .await
                .map_err(|err| PanelError::ConnectionFailed {
                    agent: agent_name.clone(),
                    message: err.to_string(),
                })?;

            self.attach_session(room_name, &agent_name, connection.session.as_ref());
            self.connections.insert(room_name, connection);
            log::info!("agent-join room={} agent={}", room_name, agent_name);
            connected.push(agent_name);
        }

        let mut state = room.lock().await;
        rotation::sync_audio_subscriptions(room_name, &state, &self.connections);

        if !state.greeted && !agent_names.is_empty() {
            let opener = state.agent_order.first().cloned();
            if let Some(conn) = opener.and_then(|name| self.connections.get(room_name, &name)) {
                conn.session
                    .generate_reply(ReplyRequest {
                        reply_id: Uuid::new_v4().to_string(),
                        user_input: None,
                        instructions: self.config.greeting_instructions.clone(),
                    })
                    .await
                    .map_err(|err| PanelError::ReplyFailed {
                        agent: conn.agent_name.clone(),
                        message: err.to_string(),
                    })?;
                state.greeted = true;
                log::info!("room-greet room={} opener={}", room_name, conn.agent_name);
            }
        }

        connected.sort();
        Ok(connected)
    }

    /// Subscribe the arbitration and rotation handlers to the room's bus, once.
    pub async fn wire_room(self: &Arc<Self>, room: &Arc<RoomTurnState>) {
        if !room.mark_wired() {
            return;
        }

        let weak = Arc::downgrade(self);
        let on_founder_turn = event_callback(move |event| {
            let weak: Weak<PanelOrchestrator> = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(this) => this.dispatch_founder_turn(event).await,
                    None => Ok(()),
                }
            }
        });

        let weak = Arc::downgrade(self);
        let on_reply_completed = event_callback(move |event| {
            let weak: Weak<PanelOrchestrator> = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(this) => this.dispatch_reply_completed(event).await,
                    None => Ok(()),
                }
            }
        });

        let bus = room.event_bus();
        bus.subscribe(FOUNDER_TURN_COMPLETED, on_founder_turn).await;
        bus.subscribe(AGENT_REPLY_COMPLETED, on_reply_completed).await;
    }

    async fn dispatch_founder_turn(&self, event: TurnEvent) -> Result<(), HandlerError> {
        if let TurnEvent::FounderTurnCompleted {
            room_name,
            agent_name,
            transcript,
            speaker_id,
        } = event
        {
            let observation = UtteranceObservation {
                triggering_agent: agent_name,
                transcript,
                speaker_id,
            };
            self.handle_user_turn(&room_name, &observation).await?;
        }
        Ok(())
    }

    async fn dispatch_reply_completed(&self, event: TurnEvent) -> Result<(), HandlerError> {
        self.handle_reply_completed(event.room_name(), event.agent_name())
            .await?;
        Ok(())
    }

    /// Arbitrate one observation for `room_name`.
    pub async fn handle_user_turn(
        &self,
        room_name: &str,
        observation: &UtteranceObservation,
    ) -> Result<TurnDecision, PanelError> {
        let room = self
            .rooms
            .get(room_name)
            .ok_or_else(|| PanelError::RoomNotFound(room_name.to_string()))?;
        let Some(conn) = self.connections.get(room_name, &observation.triggering_agent) else {
            log::info!(
                "turn-drop not-connected room={} trigger={}",
                room_name,
                observation.triggering_agent
            );
            return Ok(TurnDecision::Dropped(DropReason::NotConnected));
        };
        arbitration::handle_user_turn(
            &room,
            conn.session.as_ref(),
            observation,
            &self.config,
            self.turn_manager.as_deref(),
        )
        .await
    }

    /// Process a completion signal from `agent_name` in `room_name`.
    pub async fn handle_reply_completed(
        &self,
        room_name: &str,
        agent_name: &str,
    ) -> Result<RotationOutcome, PanelError> {
        let room = self
            .rooms
            .get(room_name)
            .ok_or_else(|| PanelError::RoomNotFound(room_name.to_string()))?;
        rotation::handle_reply_completed(
            &room,
            agent_name,
            &self.connections,
            self.turn_manager.as_deref(),
        )
        .await
    }

    /// Route a session's events through [`observe_session_event`](Self::observe_session_event).
    ///
    /// Must be called from within a Tokio runtime. The installed callback may
    /// then fire from any thread; publishing happens on that runtime.
    pub fn attach_session(self: &Arc<Self>, room_name: &str, agent_name: &str, session: &dyn AgentSession) {
        let weak = Arc::downgrade(self);
        let runtime = Handle::current();
        let room_name = room_name.to_string();
        let agent_name = agent_name.to_string();
        session.on_event(Arc::new(move |event| {
            if let Some(this) = weak.upgrade() {
                this.observe_session_event(&runtime, &room_name, &agent_name, event);
            }
        }));
    }

    /// Entry point for synchronous session callbacks. Publishes on a task spawned onto `runtime`.
    pub fn observe_session_event(
        self: &Arc<Self>,
        runtime: &Handle,
        room_name: &str,
        agent_name: &str,
        event: SessionEvent,
    ) {
        let this = Arc::clone(self);
        let room_name = room_name.to_string();
        let agent_name = agent_name.to_string();
        runtime.spawn(async move {
            if let Err(err) = this
                .publish_session_event(&room_name, &agent_name, event)
                .await
            {
                log::error!(
                    "session-event failed room={} agent={}: {}",
                    room_name,
                    agent_name,
                    err
                );
            }
        });
    }

    /// Translate a session event into a bus event and emit it.
    ///
    /// User items are trimmed and dropped when empty, noise, or observed by a
    /// non-selected agent. `Listening`/`Idle` state changes become completions.
    pub async fn publish_session_event(
        &self,
        room_name: &str,
        agent_name: &str,
        event: SessionEvent,
    ) -> Result<(), PanelError> {
        let room = self
            .rooms
            .get(room_name)
            .ok_or_else(|| PanelError::RoomNotFound(room_name.to_string()))?;

        let bus_event = match event {
            SessionEvent::ConversationItemAdded { role, text } => {
                if role != ChatRole::User {
                    return Ok(());
                }
                let transcript = text.trim().to_string();
                if transcript.is_empty() {
                    return Ok(());
                }
                if self.config.is_noise(&transcript) {
                    log::info!(
                        "item-drop noise room={} agent={} text={}",
                        room_name,
                        agent_name,
                        transcript
                    );
                    return Ok(());
                }
                let selected = room.lock().await.selected_agent().map(str::to_string);
                if selected.as_deref() != Some(agent_name) {
                    log::info!(
                        "item-drop non-selected room={} agent={} selected={} text={}",
                        room_name,
                        agent_name,
                        selected.as_deref().unwrap_or("<none>"),
                        transcript
                    );
                    return Ok(());
                }
                log::info!(
                    "conversation-item room={} agent={} role=user text={}",
                    room_name,
                    agent_name,
                    transcript
                );
                TurnEvent::FounderTurnCompleted {
                    room_name: room_name.to_string(),
                    agent_name: agent_name.to_string(),
                    transcript,
                    speaker_id: None,
                }
            }
            SessionEvent::AgentStateChanged { new_state } => {
                if !new_state.is_reply_finished() {
                    return Ok(());
                }
                TurnEvent::AgentReplyCompleted {
                    room_name: room_name.to_string(),
                    agent_name: agent_name.to_string(),
                }
            }
        };

        room.event_bus()
            .emit(bus_event)
            .await
            .map_err(|err| PanelError::Handler(err.to_string()))
    }

    /// Forget `room_name`: drop its turn state and return its connections for teardown.
    pub async fn close_room(&self, room_name: &str) -> Vec<ManagedAgentConnection> {
        if let Some(room) = self.rooms.remove(room_name) {
            let awaiting = room.lock().await.awaiting_reply_from.clone();
            if let (Some(manager), Some(agent)) = (&self.turn_manager, awaiting) {
                if let Err(err) = manager.release(room_name, &agent).await {
                    log::warn!("turn-lock release failed room={}: {}", room_name, err);
                }
            }
        }
        let removed = self.connections.remove_room(room_name);
        log::info!(
            "room-close room={} connections={}",
            room_name,
            removed.len()
        );
        removed
    }
}
