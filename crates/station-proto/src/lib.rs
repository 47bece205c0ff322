//! Shared types for the station daemon and its control client: wire
//! protocol, playback transition table, daemon state, configuration,
//! platform paths and the "now playing" page scraper.

pub mod config;
pub mod platform;
pub mod playback;
pub mod protocol;
pub mod replica;
pub mod state;
pub mod track;
