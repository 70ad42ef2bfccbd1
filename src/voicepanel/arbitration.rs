//! Turn arbitration: deciding whether an observed utterance earns a reply.
//!
//! Every agent in a room hears the founder, so each completed utterance is
//! typically observed and published several times. [`handle_user_turn`] runs
//! once per observation under the room lock and evaluates the gates below in
//! a fixed order. The first one that trips drops the observation without
//! touching state:
//!
//! 1. **not-selected**: the observing agent is not `agent_order[next_agent_idx]`
//! 2. **non-founder**: the speaker is known, the founder is known, and they differ
//! 3. **short**: the normalized text has fewer than `min_transcript_chars` characters
//! 4. **duplicate**: the turn key equals the last committed one
//! 5. **awaiting-reply**: another reply is still in flight
//! 6. **lock-held**: a configured [`TurnManager`] refused the room's turn
//!
//! Otherwise the turn is committed: the key is recorded, the room enters
//! AwaitingReply, the utterance joins the context window and the selected
//! agent's session is told to reply with the window as grounding.

use crate::voicepanel::config::PanelConfig;
use crate::voicepanel::orchestrator::PanelError;
use crate::voicepanel::session::{AgentSession, ReplyRequest};
use crate::voicepanel::turn_manager::TurnManager;
use crate::voicepanel::turn_state::{RoomTurnState, TurnState};
use std::fmt;
use uuid::Uuid;

/// One agent's report of a completed founder utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceObservation {
    pub triggering_agent: String,
    pub transcript: String,
    pub speaker_id: Option<String>,
}

impl UtteranceObservation {
    pub fn new(triggering_agent: impl Into<String>, transcript: impl Into<String>) -> Self {
        Self {
            triggering_agent: triggering_agent.into(),
            transcript: transcript.into(),
            speaker_id: None,
        }
    }

    pub fn with_speaker(mut self, speaker_id: impl Into<String>) -> Self {
        self.speaker_id = Some(speaker_id.into());
        self
    }
}

/// Why an observation did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The observing agent has no live connection in the room.
    NotConnected,
    NotSelected { selected: Option<String> },
    NonFounder { speaker: String, founder: String },
    TooShort { chars: usize },
    Duplicate,
    AwaitingReply { awaiting: String },
    LockHeld { owner: Option<String> },
}

impl DropReason {
    /// Stable tag used in `turn-drop` log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            DropReason::NotConnected => "not-connected",
            DropReason::NotSelected { .. } => "not-selected",
            DropReason::NonFounder { .. } => "non-founder",
            DropReason::TooShort { .. } => "short",
            DropReason::Duplicate => "duplicate",
            DropReason::AwaitingReply { .. } => "awaiting-reply",
            DropReason::LockHeld { .. } => "lock-held",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NotConnected => f.write_str("not-connected"),
            DropReason::NotSelected { selected } => write!(
                f,
                "not-selected selected={}",
                selected.as_deref().unwrap_or("<none>")
            ),
            DropReason::NonFounder { speaker, founder } => {
                write!(f, "non-founder speaker={} founder={}", speaker, founder)
            }
            DropReason::TooShort { chars } => write!(f, "short chars={}", chars),
            DropReason::Duplicate => f.write_str("duplicate"),
            DropReason::AwaitingReply { awaiting } => {
                write!(f, "awaiting-reply awaiting={}", awaiting)
            }
            DropReason::LockHeld { owner } => write!(
                f,
                "lock-held owner={}",
                owner.as_deref().unwrap_or("<unknown>")
            ),
        }
    }
}

/// Outcome of arbitrating one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnDecision {
    Dropped(DropReason),
    Committed(ReplyRequest),
}

impl TurnDecision {
    pub fn is_committed(&self) -> bool {
        matches!(self, TurnDecision::Committed(_))
    }

    pub fn drop_reason(&self) -> Option<&DropReason> {
        match self {
            TurnDecision::Dropped(reason) => Some(reason),
            TurnDecision::Committed(_) => None,
        }
    }
}

/// An observation that passed every local gate, ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    pub agent: String,
    pub normalized_text: String,
    pub turn_key: String,
}

/// Collapse runs of whitespace to single spaces and trim.
///
/// ```rust
/// use voicepanel::arbitration::normalize_transcript;
///
/// assert_eq!(normalize_transcript("  Hello \n\t sharks  "), "Hello sharks");
/// ```
pub fn normalize_transcript(transcript: &str) -> String {
    transcript.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Dedupe fingerprint of an utterance: `speaker::lowercased text`.
///
/// ```rust
/// use voicepanel::arbitration::turn_key;
///
/// assert_eq!(turn_key(None, "Hello Sharks"), "unknown::hello sharks");
/// assert_eq!(turn_key(Some("founder-1"), "Hi"), "founder-1::hi");
/// ```
pub fn turn_key(speaker_id: Option<&str>, normalized_text: &str) -> String {
    format!(
        "{}::{}",
        speaker_id.unwrap_or("unknown"),
        normalized_text.to_lowercase()
    )
}

/// Evaluate the local gates against `state` without mutating it.
pub fn check_gates(
    state: &TurnState,
    observation: &UtteranceObservation,
    config: &PanelConfig,
) -> Result<PendingTurn, DropReason> {
    let normalized_text = normalize_transcript(&observation.transcript);
    let key = turn_key(observation.speaker_id.as_deref(), &normalized_text);
    let selected = state.selected_agent();

    if selected != Some(observation.triggering_agent.as_str()) {
        return Err(DropReason::NotSelected {
            selected: selected.map(str::to_string),
        });
    }

    if let (Some(speaker), Some(founder)) = (&observation.speaker_id, &state.founder_identity) {
        if speaker != founder {
            return Err(DropReason::NonFounder {
                speaker: speaker.clone(),
                founder: founder.clone(),
            });
        }
    }

    let chars = normalized_text.chars().count();
    if chars < config.min_transcript_chars {
        return Err(DropReason::TooShort { chars });
    }

    if key == state.last_handled_turn_key {
        return Err(DropReason::Duplicate);
    }

    if let Some(awaiting) = &state.awaiting_reply_from {
        return Err(DropReason::AwaitingReply {
            awaiting: awaiting.clone(),
        });
    }

    Ok(PendingTurn {
        agent: observation.triggering_agent.clone(),
        normalized_text,
        turn_key: key,
    })
}

/// Apply a commit to `state` and build the reply instruction.
pub fn commit_turn(state: &mut TurnState, pending: PendingTurn, config: &PanelConfig) -> ReplyRequest {
    state.last_handled_turn_key = pending.turn_key;
    state.awaiting_reply_from = Some(pending.agent);
    state.push_context(pending.normalized_text.clone(), config.context_window);

    ReplyRequest {
        reply_id: Uuid::new_v4().to_string(),
        user_input: Some(pending.normalized_text),
        instructions: format!(
            "{}\nRecent founder context:\n{}",
            config.reply_preamble,
            state.context_block()
        ),
    }
}

/// Arbitrate one observation under the room lock and, on commit, instruct `session` to reply.
///
/// Drops are returned as [`TurnDecision::Dropped`]. A failure to issue the
/// reply instruction is returned as [`PanelError::ReplyFailed`] after the room
/// is returned to Idle so the failed reply does not block the room forever.
pub async fn handle_user_turn(
    room: &RoomTurnState,
    session: &dyn AgentSession,
    observation: &UtteranceObservation,
    config: &PanelConfig,
    turn_manager: Option<&dyn TurnManager>,
) -> Result<TurnDecision, PanelError> {
    let room_name = room.room_name();
    let mut state = room.lock().await;

    let normalized = normalize_transcript(&observation.transcript);
    log::info!(
        "turn-event room={} trigger={} selected={} key={}",
        room_name,
        observation.triggering_agent,
        state.selected_agent().unwrap_or("<none>"),
        turn_key(observation.speaker_id.as_deref(), &normalized),
    );

    let pending = match check_gates(&state, observation, config) {
        Ok(pending) => pending,
        Err(reason) => {
            log::info!(
                "turn-drop {} room={} trigger={}",
                reason,
                room_name,
                observation.triggering_agent
            );
            return Ok(TurnDecision::Dropped(reason));
        }
    };

    if let Some(manager) = turn_manager {
        let acquired = manager
            .try_acquire(room_name, &pending.agent, config.turn_lock_ttl)
            .await?;
        if !acquired {
            let reason = DropReason::LockHeld {
                owner: manager.get_current(room_name).await?,
            };
            log::info!(
                "turn-drop {} room={} trigger={}",
                reason,
                room_name,
                observation.triggering_agent
            );
            return Ok(TurnDecision::Dropped(reason));
        }
    }

    let agent = pending.agent.clone();
    let text = pending.normalized_text.clone();
    let request = commit_turn(&mut state, pending, config);

    if let Err(err) = session.generate_reply(request.clone()).await {
        state.awaiting_reply_from = None;
        if let Some(manager) = turn_manager {
            if let Err(release_err) = manager.release(room_name, &agent).await {
                log::warn!(
                    "turn-lock release failed room={} agent={}: {}",
                    room_name,
                    agent,
                    release_err
                );
            }
        }
        log::error!(
            "turn-commit failed room={} trigger={} reply_id={}: {}",
            room_name,
            agent,
            request.reply_id,
            err
        );
        return Err(PanelError::ReplyFailed {
            agent,
            message: err.to_string(),
        });
    }

    log::info!(
        "turn-commit room={} trigger={} reply_id={} text={}",
        room_name,
        agent,
        request.reply_id,
        text
    );
    Ok(TurnDecision::Committed(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn state_with(order: &[&str]) -> TurnState {
        TurnState::new(
            order.iter().map(|name| name.to_string()).collect(),
            StdRng::seed_from_u64(0),
        )
    }

    #[test]
    fn gates_fire_in_priority_order() {
        let config = PanelConfig::default();
        let mut state = state_with(&["Mark", "Kevin"]);
        state.founder_identity = Some("founder".into());
        state.awaiting_reply_from = Some("Mark".into());

        // Wrong agent, wrong speaker, too short: selection wins.
        let obs = UtteranceObservation::new("Kevin", "hi").with_speaker("intruder");
        assert_eq!(
            check_gates(&state, &obs, &config),
            Err(DropReason::NotSelected {
                selected: Some("Mark".into())
            })
        );

        // Right agent, wrong speaker, too short: founder check wins.
        let obs = UtteranceObservation::new("Mark", "hi").with_speaker("intruder");
        assert_eq!(check_gates(&state, &obs, &config).unwrap_err().tag(), "non-founder");

        // Too short beats awaiting; "o k" is exactly long enough to reach it.
        let obs = UtteranceObservation::new("Mark", "ok").with_speaker("founder");
        assert_eq!(
            check_gates(&state, &obs, &config),
            Err(DropReason::TooShort { chars: 2 })
        );
        let obs = UtteranceObservation::new("Mark", " o  k ");
        assert_eq!(check_gates(&state, &obs, &config).unwrap_err().tag(), "awaiting-reply");
    }

    #[test]
    fn too_short_counts_normalized_characters() {
        let config = PanelConfig::default();
        let state = state_with(&["Mark"]);
        let obs = UtteranceObservation::new("Mark", "   ok   ");
        assert_eq!(
            check_gates(&state, &obs, &config),
            Err(DropReason::TooShort { chars: 2 })
        );
    }

    #[test]
    fn duplicate_beats_awaiting_and_is_case_insensitive() {
        let config = PanelConfig::default();
        let mut state = state_with(&["Mark"]);
        state.last_handled_turn_key = "unknown::hello sharks".into();
        state.awaiting_reply_from = Some("Mark".into());

        let obs = UtteranceObservation::new("Mark", "HELLO   Sharks");
        assert_eq!(check_gates(&state, &obs, &config), Err(DropReason::Duplicate));

        let obs = UtteranceObservation::new("Mark", "Something new");
        assert_eq!(
            check_gates(&state, &obs, &config),
            Err(DropReason::AwaitingReply {
                awaiting: "Mark".into()
            })
        );
    }

    #[test]
    fn unattributed_speech_passes_founder_gate() {
        let config = PanelConfig::default();
        let mut state = state_with(&["Mark"]);
        state.founder_identity = Some("founder".into());
        let pending = check_gates(&state, &UtteranceObservation::new("Mark", "We sell socks"), &config)
            .unwrap();
        assert_eq!(pending.turn_key, "unknown::we sell socks");
    }

    #[test]
    fn commit_records_key_awaiting_and_bounded_context() {
        let config = PanelConfig::default().with_context_window(2);
        let mut state = state_with(&["Mark"]);
        for text in ["first pitch", "second pitch", "third pitch"] {
            state.awaiting_reply_from = None;
            let pending = check_gates(&state, &UtteranceObservation::new("Mark", text), &config)
                .unwrap();
            let request = commit_turn(&mut state, pending, &config);
            assert_eq!(request.user_input.as_deref(), Some(text));
            assert!(!request.reply_id.is_empty());
        }
        assert_eq!(state.awaiting_reply_from.as_deref(), Some("Mark"));
        assert_eq!(state.last_handled_turn_key, "unknown::third pitch");
        assert_eq!(state.shared_context.len(), 2);
        assert!(state.context_block().starts_with("- Founder said: second pitch"));
    }

    #[test]
    fn empty_rotation_drops_everything() {
        let config = PanelConfig::default();
        let state = state_with(&[]);
        assert_eq!(
            check_gates(&state, &UtteranceObservation::new("Mark", "Hello sharks"), &config),
            Err(DropReason::NotSelected { selected: None })
        );
    }
}
