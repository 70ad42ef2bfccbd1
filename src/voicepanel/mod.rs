// src/voicepanel/mod.rs

pub mod arbitration;
pub mod config;
pub mod event_bus;
pub mod orchestrator;
pub mod registry;
pub mod rotation;
pub mod session;
pub mod turn_manager;
pub mod turn_state;

// Re-export the orchestrator types
pub use orchestrator::{PanelError, PanelOrchestrator};
