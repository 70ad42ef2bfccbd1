//! Collaborator contracts the arbitration core drives.
//!
//! The room transport, speech pipeline and realtime model live outside this
//! crate. The core only needs the capabilities below:
//!
//! ```text
//! AgentConnector ──connect_agent()──► ManagedAgentConnection
//!                                       ├─ RoomConnection  (is_connected)
//!                                       └─ AgentSession    (generate_reply, set_audio_participant, on_event)
//! ```
//!
//! Sessions report what they observe through [`SessionEvent`]s delivered to a
//! synchronous [`SessionEventCallback`], mirroring the emitter style of the
//! realtime SDKs these traits wrap.

use crate::voicepanel::config::AgentProfile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Error type returned by collaborator calls.
pub type CollaboratorError = Box<dyn Error + Send + Sync>;

/// Speaker role of a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// Agent lifecycle states reported by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Initializing,
    Listening,
    Thinking,
    Speaking,
    Idle,
}

impl AgentState {
    /// `true` for the states that mean the agent has stopped talking.
    pub fn is_reply_finished(self) -> bool {
        matches!(self, AgentState::Listening | AgentState::Idle)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentState::Initializing => "initializing",
            AgentState::Listening => "listening",
            AgentState::Thinking => "thinking",
            AgentState::Speaking => "speaking",
            AgentState::Idle => "idle",
        };
        f.write_str(label)
    }
}

/// Something an agent session observed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A conversation item was committed to the session's history.
    ConversationItemAdded { role: ChatRole, text: String },
    /// The agent moved to a new lifecycle state.
    AgentStateChanged { new_state: AgentState },
}

/// Synchronous observer installed on a session.
pub type SessionEventCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Instruction handed to the winning agent's session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyRequest {
    /// Fresh UUID correlating the commit log line with the reply.
    pub reply_id: String,
    /// Utterance being answered. `None` for greetings.
    pub user_input: Option<String>,
    /// Instructions including the grounding context block.
    pub instructions: String,
}

/// A live conversational session for one agent.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Schedule a spoken reply. Implementations return once the reply is queued;
    /// completion is reported later through [`SessionEvent::AgentStateChanged`].
    async fn generate_reply(&self, request: ReplyRequest) -> Result<(), CollaboratorError>;

    /// Route a participant's audio into this session, or mute input with `None`.
    ///
    /// Sessions without a routable audio input may ignore the call.
    fn set_audio_participant(&self, participant_identity: Option<&str>);

    /// Install the observer for this session's events.
    fn on_event(&self, callback: SessionEventCallback);
}

/// Transport handle for one agent's room membership.
#[async_trait]
pub trait RoomConnection: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<(), CollaboratorError>;

    fn is_connected(&self) -> bool;
}

/// Parameters for bringing one agent into a room.
#[derive(Debug, Clone)]
pub struct AgentJoinRequest {
    pub room_name: String,
    pub profile: AgentProfile,
    /// Participant whose audio the new session starts listening to.
    pub initial_audio_participant: Option<String>,
}

/// Factory that connects an agent to a room and starts its session.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect_agent(
        &self,
        request: AgentJoinRequest,
    ) -> Result<ManagedAgentConnection, CollaboratorError>;
}

/// A joined agent: its room handle and live session.
#[derive(Clone)]
pub struct ManagedAgentConnection {
    pub agent_name: String,
    pub room: Arc<dyn RoomConnection>,
    pub session: Arc<dyn AgentSession>,
}

impl ManagedAgentConnection {
    pub fn new(
        agent_name: impl Into<String>,
        room: Arc<dyn RoomConnection>,
        session: Arc<dyn AgentSession>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            room,
            session,
        }
    }
}

impl fmt::Debug for ManagedAgentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedAgentConnection")
            .field("agent_name", &self.agent_name)
            .field("connected", &self.room.is_connected())
            .finish()
    }
}
