//! The seam between the synchronizer and whatever produces audio.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("player binary not found")]
    PlayerMissing,

    #[error("stream preparation failed: {0}")]
    Prepare(String),

    #[error("stream not prepared")]
    NotPrepared,

    #[error("player IPC failed: {0}")]
    Ipc(#[from] anyhow::Error),
}

/// Unsolicited news from the engine, forwarded into the core loop.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSignal {
    /// The loaded stream ended with an error (network drop, decoder error).
    StreamFailed(String),
    /// The player process or its IPC connection went away.
    PlayerExited,
}

/// A single player bound to one stream URL.
///
/// `prepare` must succeed before `start` means anything.  `stop` unloads the
/// stream, so the next `start` needs another `prepare`.  Success of
/// `start`/`pause` only means the player accepted the command; callers that
/// care should ask `is_playing` afterwards.
#[async_trait]
pub trait PlaybackEngine: Send {
    async fn prepare(&mut self) -> Result<(), EngineError>;

    fn is_prepared(&self) -> bool;

    async fn start(&mut self) -> Result<(), EngineError>;

    async fn pause(&mut self) -> Result<(), EngineError>;

    async fn stop(&mut self) -> Result<(), EngineError>;

    async fn is_playing(&mut self) -> bool;

    async fn set_volume(&mut self, volume: f32) -> Result<(), EngineError>;

    /// Release the player.  Called once when the daemon exits.
    async fn shutdown(&mut self);
}
