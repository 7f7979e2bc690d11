//! Shared types for PromptDJ: the screen wire protocol, configuration, the
//! vibe catalog and platform paths.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod vibes;
