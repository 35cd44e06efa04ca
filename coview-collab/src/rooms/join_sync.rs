use std::sync::Arc;

use coview_core::{sanitize_timestamp, GraceExpiry, PlaybackEngine, SyncConfig};
use log::info;

use crate::{Database, MemberPatch, RoomData, RoomPatch};

use super::{synchronizer::load_source, ClientSession, SyncError};

/// Brings a freshly joined client to the room's position.
///
/// The engine is paused and moved to the exact room position. If the room is
/// playing, the client stays paused for a grace period to buffer, then resumes.
pub struct JoinSync<Db> {
    database: Arc<Db>,
    engine: Arc<dyn PlaybackEngine>,
    config: SyncConfig,
}

/// How a started handshake continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinProgress {
    /// The room is paused, the client is already in sync
    Synced,
    /// The grace timer is running
    Buffering,
}

impl<Db> JoinSync<Db>
where
    Db: Database,
{
    pub fn new(database: Arc<Db>, engine: Arc<dyn PlaybackEngine>, config: SyncConfig) -> Self {
        Self {
            database,
            engine,
            config,
        }
    }

    /// Runs the handshake, restarting it if one is already pending.
    ///
    /// The member is acknowledged even if the engine fails, so the handshake
    /// isn't requested again for a source that cannot be played.
    pub async fn begin(&self, session: &mut ClientSession) -> Result<JoinProgress, SyncError> {
        if session.cancel_grace() {
            info!("Restarting join sync in room {}", session.room_id);
        }

        let room = self.database.room_by_id(session.room_id).await?;
        session.replace_room(room.clone());

        session.lock().acquire(self.config.damping_window);
        let aligned = self.align_engine(&room).await;

        let member = self
            .database
            .update_member(
                session.member().id,
                MemberPatch {
                    needs_sync: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        session.replace_member(member);
        session.lock().acquire(self.config.damping_window);

        aligned?;

        if room.is_playing {
            session.start_grace(self.config.join_grace_period);
            Ok(JoinProgress::Buffering)
        } else {
            Ok(JoinProgress::Synced)
        }
    }

    /// Ends the grace period: resumes locally and publishes the configured state.
    pub async fn complete(&self, session: &mut ClientSession) -> Result<RoomData, SyncError> {
        session.cancel_grace();
        session.lock().acquire(self.config.damping_window);

        self.engine.play();
        let position = sanitize_timestamp(self.engine.current_time());

        let is_playing = match self.config.grace_expiry {
            GraceExpiry::PauseRoom => false,
            GraceExpiry::ResumeRoom => true,
        };

        let room = self
            .database
            .update_room(session.room_id, RoomPatch::playback(position, is_playing))
            .await?;

        session.lock().acquire(self.config.damping_window);
        session.replace_room(room.clone());

        info!(
            "Join sync in room {} completed at {:.2}s",
            session.room_id, position
        );

        Ok(room)
    }

    /// Drops a pending grace period, used when the client goes away.
    pub fn cancel(&self, session: &mut ClientSession) {
        session.cancel_grace();
    }

    async fn align_engine(&self, room: &RoomData) -> Result<(), SyncError> {
        let position = sanitize_timestamp(room.video_timestamp);

        if let Some(url) = room.current_video_url.as_deref() {
            if self.engine.source().as_deref() != Some(url) {
                load_source(self.engine.as_ref(), &self.config, url, position).await?;
            }
        }

        if self.engine.source().is_none() {
            return Ok(());
        }

        // First sync is always exact, drift is not considered
        self.engine.pause();
        self.engine.seek(position);

        Ok(())
    }
}
