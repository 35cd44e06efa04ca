use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::SourceKind;

pub type EngineEventSender = UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = UnboundedReceiver<EngineEvent>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine is not initialized")]
    NotInitialized,
    #[error("Source {url} could not be loaded: {reason}")]
    LoadFailed { url: String, reason: String },
    #[error("Source {0} did not become ready in time")]
    ReadyTimeout(String),
    #[error("No source is loaded")]
    NoSource,
}

/// Events fired by a playback engine, whether caused by the user or by the client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The loaded source has its metadata and can be seeked.
    Ready,
    Play,
    Pause,
    /// A seek started.
    Seeking,
    /// A seek finished.
    Seeked,
}

/// The local media player, as seen by the synchronization protocol.
///
/// Implementors fire [EngineEvent]s for every state change, including the ones
/// caused by calling these methods.
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    /// Replaces the current source. Returns once the source is accepted, not when it is ready.
    async fn load(&self, url: &str, kind: SourceKind) -> Result<(), EngineError>;

    /// Resolves once the current source can be seeked.
    async fn ready(&self) -> Result<(), EngineError>;

    /// Starts playback if possible.
    fn play(&self);

    /// Pauses playback.
    fn pause(&self);

    /// Seeks to a specific time.
    /// * `position` is the time in seconds.
    fn seek(&self, position: f64);

    /// Returns the current position in seconds.
    fn current_time(&self) -> f64;

    fn is_paused(&self) -> bool;

    /// The url of the currently loaded source, if any.
    fn source(&self) -> Option<String>;
}

/// Creates the channel an engine fires its events into.
pub fn engine_channel() -> (EngineEventSender, EngineEventReceiver) {
    unbounded_channel()
}
