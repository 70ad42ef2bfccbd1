//! # voicepanel
//!
//! voicepanel arbitrates turns between several AI voice personas that share one
//! real-time audio room. Every persona hears the same founder speech, so
//! without arbitration all of them would answer at once. The crate decides,
//! for each utterance, which single agent may reply, and rotates the listening
//! role once that reply is done.
//!
//! The crate provides:
//!
//! * **Event bus**: [`event_bus::EventBus`], a sequential in-process
//!   publish/subscribe that decouples session observation from arbitration
//! * **Room state**: [`turn_state::RoomTurnState`], the lock-guarded per-room
//!   aggregate (rotation order, pending reply, dedupe key, context window)
//! * **Arbitration**: [`arbitration::handle_user_turn`], the gating pipeline that
//!   commits at most one reply per utterance and at most one in flight per room
//! * **Rotation**: [`rotation::handle_reply_completed`], which picks the next
//!   listener and re-routes founder audio to it
//! * **Turn locks**: [`turn_manager::TurnManager`] with in-memory and external
//!   (Redis, feature `redis`) backends for TTL-bounded cross-process claims
//! * **Orchestration**: [`PanelOrchestrator`], which joins agents through an
//!   [`session::AgentConnector`] and wires their sessions to the above
//!
//! Transport, transcription and the realtime model are collaborators reached
//! through the traits in [`session`].
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voicepanel::{PanelConfig, PanelOrchestrator};
//! use voicepanel::session::AgentConnector;
//!
//! # async fn run(connector: Arc<dyn AgentConnector>) -> Result<(), Box<dyn std::error::Error>> {
//! voicepanel::init_logger();
//!
//! let panel = PanelOrchestrator::from_config(PanelConfig::from_env(), connector).await?;
//! let sharks = panel.config().default_agent_names();
//! panel.join_agents("pitch-42", &sharks, Some("founder-7")).await?;
//!
//! if let Some(snapshot) = panel.snapshot("pitch-42").await {
//!     println!("{}", serde_json::to_string_pretty(&snapshot)?);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Turn decisions are logged through the [`log`] facade; call this to see them
/// with `RUST_LOG=info`.
///
/// ```rust
/// voicepanel::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `voicepanel` module.
pub mod voicepanel;

// Re-exporting key items for easier external access.
pub use voicepanel::arbitration;
pub use voicepanel::arbitration::{DropReason, TurnDecision, UtteranceObservation};
pub use voicepanel::config;
pub use voicepanel::config::{AgentProfile, PanelConfig};
pub use voicepanel::event_bus;
pub use voicepanel::event_bus::{EventBus, TurnEvent};
pub use voicepanel::orchestrator;
pub use voicepanel::orchestrator::{PanelError, PanelOrchestrator};
pub use voicepanel::registry;
pub use voicepanel::rotation;
pub use voicepanel::rotation::RotationOutcome;
pub use voicepanel::session;
pub use voicepanel::turn_manager;
pub use voicepanel::turn_manager::{InMemoryTurnManager, TurnManager, TurnManagerError};
pub use voicepanel::turn_state;
pub use voicepanel::turn_state::{RoomSnapshot, RoomTurnState};
