use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a client writes back to the room when its join grace period runs out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraceExpiry {
    /// Resume locally, but pause the room for everyone.
    #[default]
    PauseRoom,
    /// Resume locally and publish a resume to the room.
    ResumeRoom,
}

/// The timing configuration of the synchronization protocol
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long the sync lock is held after a client applies or publishes playback state
    pub damping_window: Duration,
    /// How many seconds local and remote positions may differ before a seek is forced
    pub drift_threshold: f64,
    /// How long a late joiner stays paused to buffer before resuming
    pub join_grace_period: Duration,
    /// How long to wait for the engine to become ready after loading a source
    pub ready_timeout: Duration,
    pub grace_expiry: GraceExpiry,
}

impl SyncConfig {
    /// Returns true if the positions are far enough apart to warrant a seek.
    pub fn exceeds_drift(&self, local: f64, remote: f64) -> bool {
        (local - remote).abs() > self.drift_threshold
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            // Long enough for the echo of a write to come back through the change feed
            damping_window: Duration::from_millis(500),
            // Ordinary jitter and clock drift stay well below a second
            drift_threshold: 1.0,
            join_grace_period: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(10),
            grace_expiry: GraceExpiry::PauseRoom,
        }
    }
}

/// Replaces timestamps that cannot be stored or seeked to with zero.
pub fn sanitize_timestamp(timestamp: f64) -> f64 {
    if timestamp.is_finite() {
        timestamp.max(0.)
    } else {
        0.
    }
}
