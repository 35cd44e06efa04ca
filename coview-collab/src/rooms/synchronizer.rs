use std::sync::Arc;

use coview_core::{sanitize_timestamp, EngineError, PlaybackEngine, SourceKind, SyncConfig};
use log::{debug, info};
use thiserror::Error;
use tokio::time::timeout;

use crate::{Database, DatabaseError, RoomData, RoomPatch};

use super::{Action, ClientSession};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not allowed to {0}")]
    PermissionDenied(Action),
    #[error("Video url cannot be empty")]
    EmptyUrl,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

/// Reconciles the local playback engine with the playback state of the room.
///
/// Local engine events are published to the room, and room changes are applied
/// to the engine. The session's sync lock keeps the two directions from
/// feeding into each other.
pub struct PlaybackSynchronizer<Db> {
    database: Arc<Db>,
    engine: Arc<dyn PlaybackEngine>,
    config: SyncConfig,
    /// Whether the engine was playing when the current seek started
    was_playing: Option<bool>,
    /// The last url the engine failed to load, so it isn't retried on every change
    broken_source: Option<String>,
}

impl<Db> PlaybackSynchronizer<Db>
where
    Db: Database,
{
    pub fn new(database: Arc<Db>, engine: Arc<dyn PlaybackEngine>, config: SyncConfig) -> Self {
        Self {
            database,
            engine,
            config,
            was_playing: None,
            broken_source: None,
        }
    }

    pub async fn on_play(&mut self, session: &ClientSession) -> Result<(), SyncError> {
        self.publish_state(session, true).await
    }

    pub async fn on_pause(&mut self, session: &ClientSession) -> Result<(), SyncError> {
        self.publish_state(session, false).await
    }

    pub fn on_seeking(&mut self, session: &ClientSession) {
        if session.lock().is_held() {
            return;
        }

        // A seek may fire several seeking events, only the first one knows the real state
        if self.was_playing.is_none() {
            self.was_playing = Some(!self.engine.is_paused());
        }
    }

    pub async fn on_seeked(&mut self, session: &ClientSession) -> Result<(), SyncError> {
        let was_playing = self.was_playing.take();

        if session.lock().is_held() {
            debug!("Ignoring seek in room {} while sync lock is held", session.room_id);
            return Ok(());
        }

        ensure_allowed(session, Action::ControlPlayback)?;

        let was_playing = was_playing.unwrap_or_else(|| !self.engine.is_paused());
        let position = sanitize_timestamp(self.engine.current_time());

        let published = self
            .publish(session, RoomPatch::playback(position, was_playing))
            .await;

        // Seeking must never leave the seeking client paused, even if the write failed
        if was_playing {
            self.engine.play();
        }

        published?;
        Ok(())
    }

    /// Switches the whole room to a new video, then loads it locally.
    pub async fn load_video(
        &mut self,
        session: &ClientSession,
        url: &str,
    ) -> Result<RoomData, SyncError> {
        let url = url.trim();

        if url.is_empty() {
            return Err(SyncError::EmptyUrl);
        }

        ensure_allowed(session, Action::LoadVideo)?;

        let room = self.publish(session, RoomPatch::load(url)).await?;
        info!("Room {} switched to {}", session.room_id, url);

        self.broken_source = None;
        let loaded = load_source(self.engine.as_ref(), &self.config, url, 0.).await;
        session.lock().acquire(self.config.damping_window);

        if loaded.is_err() {
            self.broken_source = Some(url.to_string());
        }

        loaded?;
        Ok(room)
    }

    /// Applies a room change to the local engine, without publishing anything back.
    pub async fn apply_remote(
        &mut self,
        session: &ClientSession,
        room: &RoomData,
    ) -> Result<(), SyncError> {
        if session.lock().is_held() {
            debug!("Ignoring echo of room {}", room.id);
            return Ok(());
        }

        let Some(url) = room.current_video_url.as_deref() else {
            return Ok(());
        };

        let remote_position = sanitize_timestamp(room.video_timestamp);
        let mut reloaded = false;

        if self.engine.source().as_deref() != Some(url) {
            if self.broken_source.as_deref() == Some(url) {
                return Ok(());
            }

            info!("Loading {} at {:.2}s to follow room {}", url, remote_position, room.id);

            session.lock().acquire(self.config.damping_window);
            let loaded =
                load_source(self.engine.as_ref(), &self.config, url, remote_position).await;
            session.lock().acquire(self.config.damping_window);

            if let Err(e) = loaded {
                self.broken_source = Some(url.to_string());
                return Err(e.into());
            }

            self.broken_source = None;
            reloaded = true;
        }

        // A reload already started at the remote position
        if !reloaded {
            let local_position = self.engine.current_time();

            if self.config.exceeds_drift(local_position, remote_position) {
                debug!(
                    "Drifted {:.2}s from room {}, seeking to {:.2}s",
                    (local_position - remote_position).abs(),
                    room.id,
                    remote_position
                );

                session.lock().acquire(self.config.damping_window);
                self.engine.seek(remote_position);
            }
        }

        if self.engine.is_paused() == room.is_playing {
            session.lock().acquire(self.config.damping_window);

            if room.is_playing {
                self.engine.play();
            } else {
                self.engine.pause();
            }
        }

        Ok(())
    }

    async fn publish_state(
        &mut self,
        session: &ClientSession,
        is_playing: bool,
    ) -> Result<(), SyncError> {
        if session.lock().is_held() {
            debug!(
                "Ignoring local {} in room {} while sync lock is held",
                if is_playing { "play" } else { "pause" },
                session.room_id
            );
            return Ok(());
        }

        ensure_allowed(session, Action::ControlPlayback)?;

        let position = sanitize_timestamp(self.engine.current_time());
        self.publish(session, RoomPatch::playback(position, is_playing))
            .await?;

        Ok(())
    }

    /// Writes to the room, holding the sync lock so the echo is ignored.
    async fn publish(
        &self,
        session: &ClientSession,
        patch: RoomPatch,
    ) -> Result<RoomData, SyncError> {
        let token = session.lock().acquire(self.config.damping_window);

        let room = match self.database.update_room(session.room_id, patch).await {
            Ok(room) => room,
            Err(e) => {
                // No echo is coming, so local changes may be published again
                session.lock().release(token);
                return Err(e.into());
            }
        };

        // The echo can only arrive after the write is acknowledged
        session.lock().acquire(self.config.damping_window);

        Ok(room)
    }
}

fn ensure_allowed(session: &ClientSession, action: Action) -> Result<(), SyncError> {
    if session.can(action) {
        Ok(())
    } else {
        Err(SyncError::PermissionDenied(action))
    }
}

/// Loads a source and moves to `offset` once the engine is ready for it.
pub(crate) async fn load_source(
    engine: &dyn PlaybackEngine,
    config: &SyncConfig,
    url: &str,
    offset: f64,
) -> Result<(), EngineError> {
    engine.load(url, SourceKind::detect(url)).await?;

    timeout(config.ready_timeout, engine.ready())
        .await
        .map_err(|_| EngineError::ReadyTimeout(url.to_string()))??;

    let offset = sanitize_timestamp(offset);

    if offset > 0. {
        engine.seek(offset);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coview_core::{Introspect, PlaybackEngine};
    use tokio::time::advance;

    use super::*;
    use crate::{
        rooms::testing::{clock_engine, seeded_room, GUEST, HOST, VIDEO},
        MemoryDatabase, Permission,
    };

    const PAST_LOCK: Duration = Duration::from_millis(600);

    async fn setup(
        user_id: i64,
    ) -> (
        Arc<MemoryDatabase>,
        Arc<coview_impls::ClockEngine>,
        ClientSession,
        PlaybackSynchronizer<MemoryDatabase>,
    ) {
        let database = Arc::new(MemoryDatabase::new());
        let (room, host, guest) = seeded_room(&database).await;
        let member = if user_id == HOST { host } else { guest };

        let (engine, _events) = clock_engine();
        engine.load(VIDEO, SourceKind::Direct).await.unwrap();
        engine.ready().await.unwrap();

        let synchronizer =
            PlaybackSynchronizer::new(database.clone(), engine.clone(), SyncConfig::default());

        (
            database,
            engine,
            ClientSession::new(room, member),
            synchronizer,
        )
    }

    fn remote(session: &ClientSession, video_timestamp: f64, is_playing: bool) -> RoomData {
        let mut room = (*session.room()).clone();
        room.current_video_url = Some(VIDEO.to_string());
        room.video_timestamp = video_timestamp;
        room.is_playing = is_playing;
        room
    }

    #[tokio::test(start_paused = true)]
    async fn small_drift_is_tolerated() {
        let (_, engine, session, mut synchronizer) = setup(GUEST).await;
        engine.seek(10.);

        synchronizer
            .apply_remote(&session, &remote(&session, 10.9, false))
            .await
            .unwrap();
        assert_eq!(engine.introspect().seeks, 1);

        advance(PAST_LOCK).await;
        synchronizer
            .apply_remote(&session, &remote(&session, 11.5, false))
            .await
            .unwrap();

        let introspection = engine.introspect();
        assert_eq!(introspection.seeks, 2);
        assert_eq!(introspection.position, 11.5);
    }

    #[tokio::test(start_paused = true)]
    async fn same_notification_twice_changes_nothing() {
        let (_, engine, session, mut synchronizer) = setup(GUEST).await;
        let room = remote(&session, 42., true);

        synchronizer.apply_remote(&session, &room).await.unwrap();
        let first = engine.introspect();
        assert_eq!(first.plays, 1);
        assert_eq!(first.seeks, 1);

        advance(PAST_LOCK).await;
        let before = engine.introspect();

        synchronizer.apply_remote(&session, &room).await.unwrap();
        let after = engine.introspect();

        assert_eq!(after.seeks, before.seeks);
        assert_eq!(after.plays, before.plays);
        assert_eq!(after.pauses, before.pauses);
    }

    #[tokio::test(start_paused = true)]
    async fn held_lock_ignores_notifications() {
        let (_, engine, session, mut synchronizer) = setup(GUEST).await;
        session.lock().acquire(Duration::from_millis(500));

        synchronizer
            .apply_remote(&session, &remote(&session, 300., true))
            .await
            .unwrap();

        let introspection = engine.introspect();
        assert_eq!(introspection.seeks, 0);
        assert_eq!(introspection.plays, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_video_reloads_at_remote_position() {
        let (_, engine, session, mut synchronizer) = setup(GUEST).await;
        let mut room = remote(&session, 75., false);
        room.current_video_url = Some("https://cdn.example.com/live/stream.m3u8".to_string());

        synchronizer.apply_remote(&session, &room).await.unwrap();

        let introspection = engine.introspect();
        assert_eq!(introspection.loads, 2);
        assert_eq!(introspection.kind, Some(SourceKind::Hls));
        // Only the start offset, no drift correction on top
        assert_eq!(introspection.seeks, 1);
        assert_eq!(introspection.position, 75.);
    }

    #[tokio::test(start_paused = true)]
    async fn non_finite_timestamps_count_as_zero() {
        let (_, engine, session, mut synchronizer) = setup(GUEST).await;
        engine.seek(5.);

        synchronizer
            .apply_remote(&session, &remote(&session, f64::NAN, false))
            .await
            .unwrap();

        assert_eq!(engine.current_time(), 0.);
    }

    #[tokio::test(start_paused = true)]
    async fn local_play_publishes_and_holds_lock() {
        let (database, engine, session, mut synchronizer) = setup(HOST).await;
        engine.seek(12.);
        engine.play();

        synchronizer.on_play(&session).await.unwrap();

        let room = database.room_by_id(session.room_id).await.unwrap();
        assert!(room.is_playing);
        assert_eq!(room.video_timestamp, 12.);
        assert!(session.lock().is_held());

        // The echo of the write is ignored
        synchronizer.apply_remote(&session, &room).await.unwrap();
        assert_eq!(engine.introspect().plays, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn seeking_while_playing_keeps_playing() {
        let (database, engine, session, mut synchronizer) = setup(HOST).await;
        engine.play();

        synchronizer.on_seeking(&session);
        engine.seek(200.);
        synchronizer.on_seeked(&session).await.unwrap();

        let room = database.room_by_id(session.room_id).await.unwrap();
        assert!(room.is_playing);
        assert_eq!(room.video_timestamp, 200.);
        assert!(!engine.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_seek_write_still_resumes() {
        let (database, engine, session, mut synchronizer) = setup(HOST).await;
        engine.play();

        synchronizer.on_seeking(&session);
        // Players may pause while they buffer the new position
        engine.pause();
        engine.seek(200.);

        database.set_offline(true);
        let result = synchronizer.on_seeked(&session).await;
        database.set_offline(false);

        assert!(matches!(result, Err(SyncError::Store(_))));
        assert!(!engine.is_paused());
        assert!(!session.lock().is_held());
        assert!(!database.room_by_id(session.room_id).await.unwrap().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn members_without_control_are_denied() {
        let (database, engine, session, mut synchronizer) = setup(GUEST).await;
        engine.play();

        let result = synchronizer.on_play(&session).await;

        assert!(matches!(
            result,
            Err(SyncError::PermissionDenied(Action::ControlPlayback))
        ));
        assert!(!database.room_by_id(session.room_id).await.unwrap().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn everyone_may_control_when_permitted() {
        let (database, engine, mut session, mut synchronizer) = setup(GUEST).await;
        let room = database
            .update_room(
                session.room_id,
                RoomPatch {
                    playback_control: Some(Permission::Everyone),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        session.replace_room(room);

        engine.play();
        synchronizer.on_play(&session).await.unwrap();

        assert!(database.room_by_id(session.room_id).await.unwrap().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_resets_the_room() {
        let (database, engine, session, mut synchronizer) = setup(HOST).await;
        database
            .update_room(session.room_id, RoomPatch::playback(90., true))
            .await
            .unwrap();

        synchronizer
            .load_video(&session, "  youtu.be/dQw4w9WgXcQ ")
            .await
            .unwrap();

        let room = database.room_by_id(session.room_id).await.unwrap();
        assert_eq!(room.current_video_url.as_deref(), Some("youtu.be/dQw4w9WgXcQ"));
        assert_eq!(room.video_timestamp, 0.);
        assert!(!room.is_playing);
        assert_eq!(engine.introspect().kind, Some(SourceKind::YouTube));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_urls_are_rejected() {
        let (_, _, session, mut synchronizer) = setup(HOST).await;

        let result = synchronizer.load_video(&session, "   ").await;

        assert!(matches!(result, Err(SyncError::EmptyUrl)));
    }

    #[tokio::test(start_paused = true)]
    async fn broken_sources_are_not_retried() {
        let (_, engine, session, mut synchronizer) = setup(GUEST).await;
        engine.set_failing(true);

        let mut room = remote(&session, 0., false);
        room.current_video_url = Some("https://example.com/broken.mp4".to_string());

        let result = synchronizer.apply_remote(&session, &room).await;
        assert!(matches!(result, Err(SyncError::Engine(_))));

        advance(PAST_LOCK).await;
        synchronizer.apply_remote(&session, &room).await.unwrap();

        assert_eq!(engine.introspect().loads, 2);
    }
}
