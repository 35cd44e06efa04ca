use std::{pin::Pin, sync::Arc, time::Duration};

use coview_core::{EngineEvent, EngineEventReceiver, Introspect, PlaybackEngine};
use futures_util::future::OptionFuture;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{sleep, Sleep},
};

use crate::{
    events::{CollabEvent, EventReceiver, EventSender},
    ChangeEvent, ChangeFeed, CollabContext, Database, DatabaseError, MemberData, MemberStatus,
    Permissions, PrimaryKey, RoomData, RowChange, UserId,
};

use super::{
    ClientSession, JoinProgress, JoinSync, MembershipCoordinator, MembershipError,
    PlaybackSynchronizer, Removal, SyncError,
};

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// How long to wait before checking a removal again, multiplied by the attempt
const REMOVAL_RETRY_DELAY: Duration = Duration::from_millis(500);
/// A client that cannot tell whether it was removed gives up after this many attempts
const REMOVAL_CHECK_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("The room session has ended")]
    SessionEnded,
}

/// Why a room session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user left the room
    Left,
    /// The client went away, the user is still a member
    Disconnected,
    Kicked,
    RoomClosed,
    /// The store stopped delivering changes
    Detached,
}

/// Requests from the user interface, answered by the client loop
pub enum RoomCommand {
    LoadVideo {
        url: String,
        reply: Reply<()>,
    },
    Invite {
        user_id: UserId,
        reply: Reply<MemberData>,
    },
    Kick {
        user_id: UserId,
        reply: Reply<()>,
    },
    TransferHost {
        user_id: UserId,
        reply: Reply<()>,
    },
    UpdatePermissions {
        permissions: Permissions,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
}

/// One client attached to one room.
///
/// Engine events, room changes, commands and the join grace timer are handled
/// one at a time, never concurrently.
pub(crate) struct RoomClient<Db> {
    session: ClientSession,
    engine: Arc<dyn PlaybackEngine>,
    synchronizer: PlaybackSynchronizer<Db>,
    join_sync: JoinSync<Db>,
    membership: MembershipCoordinator<Db>,
    engine_events: EngineEventReceiver,
    feed: ChangeFeed,
    commands: UnboundedReceiver<RoomCommand>,
    events: EventSender,
    /// A removal check that failed and is waiting to run again
    removal_retry: Option<Pin<Box<Sleep>>>,
    removal_attempts: u32,
}

/// A handle to a running room client. Dropping it disconnects the client.
pub struct RoomHandle {
    pub room_id: PrimaryKey,
    pub user_id: UserId,
    commands: UnboundedSender<RoomCommand>,
    events: EventReceiver,
    task: JoinHandle<SessionEnd>,
}

impl<Db> RoomClient<Db>
where
    Db: Database,
{
    pub fn new(
        context: &CollabContext<Db>,
        session: ClientSession,
        engine: Arc<dyn PlaybackEngine>,
        engine_events: EngineEventReceiver,
        feed: ChangeFeed,
        commands: UnboundedReceiver<RoomCommand>,
        events: EventSender,
    ) -> Self {
        let database = context.database.clone();
        let config = context.config.clone();

        Self {
            session,
            synchronizer: PlaybackSynchronizer::new(
                database.clone(),
                engine.clone(),
                config.clone(),
            ),
            join_sync: JoinSync::new(database.clone(), engine.clone(), config),
            membership: MembershipCoordinator::new(database),
            engine,
            engine_events,
            feed,
            commands,
            events,
            removal_retry: None,
            removal_attempts: 0,
        }
    }

    pub async fn run(mut self) -> SessionEnd {
        info!(
            "User {} attached to room {}",
            self.session.user_id, self.session.room_id
        );

        self.publish_roster().await;

        let end = loop {
            let end = tokio::select! {
                Some(()) = OptionFuture::from(self.session.grace_timer()) => {
                    self.on_grace_expired().await
                }
                Some(()) = OptionFuture::from(self.removal_retry.as_mut()) => {
                    self.on_member_removed().await
                }
                change = self.feed.next() => match change {
                    Some(change) => self.on_change(change).await,
                    None => Some(SessionEnd::Detached),
                },
                Some(event) = self.engine_events.recv() => self.on_engine_event(event).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => Some(SessionEnd::Disconnected),
                },
            };

            if let Some(end) = end {
                break end;
            }
        };

        self.teardown(end).await;
        end
    }

    async fn on_change(&mut self, change: ChangeEvent) -> Option<SessionEnd> {
        match change {
            ChangeEvent::Room(RowChange::Insert(room) | RowChange::Update(room)) => {
                self.on_room_changed(room).await
            }
            ChangeEvent::Room(RowChange::Delete) => Some(SessionEnd::RoomClosed),
            ChangeEvent::Member(RowChange::Insert(member) | RowChange::Update(member)) => {
                self.on_member_changed(member).await
            }
            ChangeEvent::Member(RowChange::Delete) => self.on_member_removed().await,
        }
    }

    async fn on_room_changed(&mut self, room: RoomData) -> Option<SessionEnd> {
        let previous = self.session.replace_room(room.clone());

        if previous.host_id != room.host_id {
            let is_local_host = room.is_host(self.session.user_id);
            info!("Room {} is now hosted by user {}", room.id, room.host_id);

            self.emit(CollabEvent::HostChanged {
                room_id: room.id,
                host_id: room.host_id,
                is_local_host,
            });
        }

        if self.session.grace_pending() {
            // Keep buffering as long as the room keeps playing the same video
            if room.is_playing && room.current_video_url == previous.current_video_url {
                return None;
            }

            self.join_sync.cancel(&mut self.session);
            self.emit(CollabEvent::JoinSyncCompleted { room_id: room.id });
        }

        let result = self.synchronizer.apply_remote(&self.session, &room).await;
        self.on_sync_result(result).await
    }

    async fn on_member_changed(&mut self, member: MemberData) -> Option<SessionEnd> {
        if member.user_id == self.session.user_id {
            self.session.replace_member(member.clone());

            if member.status == MemberStatus::Left {
                info!(
                    "User {} left room {} elsewhere",
                    member.user_id, member.room_id
                );
                return Some(SessionEnd::Left);
            }

            if member.needs_sync {
                if let Some(end) = self.run_join_sync().await {
                    return Some(end);
                }
            }
        }

        self.publish_roster().await;
        None
    }

    async fn on_member_removed(&mut self) -> Option<SessionEnd> {
        self.removal_retry = None;

        let removal = self
            .membership
            .check_removal(self.session.room_id, self.session.user_id)
            .await;

        if removal.is_ok() {
            self.removal_attempts = 0;
        }

        match removal {
            Ok(Removal::Present(member)) => {
                self.session.replace_member(member);
                self.publish_roster().await;
                None
            }
            Ok(Removal::Kicked) => Some(SessionEnd::Kicked),
            Ok(Removal::RoomClosed) => Some(SessionEnd::RoomClosed),
            Err(e) => {
                self.removal_attempts += 1;

                if self.removal_attempts >= REMOVAL_CHECK_ATTEMPTS {
                    error!(
                        "Giving up on membership check in room {} after {} attempts: {}",
                        self.session.room_id, self.removal_attempts, e
                    );
                    return Some(SessionEnd::Detached);
                }

                let delay = REMOVAL_RETRY_DELAY * self.removal_attempts;
                warn!(
                    "Could not check membership in room {}, retrying in {:?}: {}",
                    self.session.room_id, delay, e
                );

                self.removal_retry = Some(Box::pin(sleep(delay)));
                None
            }
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) -> Option<SessionEnd> {
        // Nothing is published until the client knows it is still a member
        if self.removal_retry.is_some() {
            debug!("Ignoring {:?} while membership is unconfirmed", event);
            return None;
        }

        let result = match event {
            EngineEvent::Ready => Ok(()),
            EngineEvent::Play => self.synchronizer.on_play(&self.session).await,
            EngineEvent::Pause => self.synchronizer.on_pause(&self.session).await,
            EngineEvent::Seeking => {
                self.synchronizer.on_seeking(&self.session);
                Ok(())
            }
            EngineEvent::Seeked => self.synchronizer.on_seeked(&self.session).await,
        };

        self.on_sync_result(result).await
    }

    async fn on_grace_expired(&mut self) -> Option<SessionEnd> {
        let result = self.join_sync.complete(&mut self.session).await;
        let room_id = self.session.room_id;

        match result {
            Ok(_) => {
                self.emit(CollabEvent::JoinSyncCompleted { room_id });
                None
            }
            Err(e) => self.on_sync_result(Err(e)).await,
        }
    }

    async fn on_command(&mut self, command: RoomCommand) -> Option<SessionEnd> {
        let room = self.session.room();
        let user_id = self.session.user_id;

        match command {
            RoomCommand::LoadVideo { url, reply } => {
                let result = self.synchronizer.load_video(&self.session, &url).await;

                if let Err(SyncError::Engine(e)) = &result {
                    error!("Could not load {}: {}", url, e);

                    self.emit(CollabEvent::PlaybackError {
                        room_id: room.id,
                        error: e.to_string(),
                    });
                }

                let stale = matches!(&result, Err(SyncError::Store(e)) if e.is_not_found());
                let _ = reply.send(result.map(|_| ()).map_err(Into::into));

                self.after_command(stale).await
            }
            RoomCommand::Invite { user_id: invitee, reply } => {
                let result = self.membership.invite(&room, user_id, invitee).await;
                let stale = result.as_ref().is_err_and(MembershipError::is_stale);
                let _ = reply.send(result.map_err(Into::into));

                self.after_command(stale).await
            }
            RoomCommand::Kick { user_id: target, reply } => {
                let result = self.membership.kick(&room, user_id, target).await;
                let stale = result.as_ref().is_err_and(MembershipError::is_stale);
                let _ = reply.send(result.map(|_| ()).map_err(Into::into));

                self.after_command(stale).await
            }
            RoomCommand::TransferHost { user_id: new_host, reply } => {
                let result = self.membership.transfer_host(&room, user_id, new_host).await;
                let stale = result.as_ref().is_err_and(MembershipError::is_stale);
                let _ = reply.send(result.map(|_| ()).map_err(Into::into));

                self.after_command(stale).await
            }
            RoomCommand::UpdatePermissions { permissions, reply } => {
                let result = self
                    .membership
                    .update_permissions(&room, user_id, permissions)
                    .await;
                let stale = result.as_ref().is_err_and(MembershipError::is_stale);
                let _ = reply.send(result.map(|_| ()).map_err(Into::into));

                self.after_command(stale).await
            }
            RoomCommand::Leave { reply } => {
                let member = self.session.member();

                match self.membership.leave(&room, &member).await {
                    Ok(_) => {
                        let _ = reply.send(Ok(()));
                        Some(SessionEnd::Left)
                    }
                    Err(e) => {
                        let stale = e.is_stale();
                        let _ = reply.send(Err(e.into()));

                        self.after_command(stale).await
                    }
                }
            }
            RoomCommand::Disconnect { reply } => {
                let _ = reply.send(Ok(()));
                Some(SessionEnd::Disconnected)
            }
        }
    }

    /// A command hit a room or member that no longer exists.
    async fn after_command(&mut self, stale: bool) -> Option<SessionEnd> {
        if stale {
            self.on_member_removed().await
        } else {
            None
        }
    }

    async fn run_join_sync(&mut self) -> Option<SessionEnd> {
        let room_id = self.session.room_id;

        self.emit(CollabEvent::JoinSyncStarted {
            room_id,
            position: self.session.room().video_timestamp,
        });

        match self.join_sync.begin(&mut self.session).await {
            Ok(JoinProgress::Synced) => {
                self.emit(CollabEvent::JoinSyncCompleted { room_id });
                None
            }
            Ok(JoinProgress::Buffering) => {
                debug!("Buffering before resuming in room {}", room_id);
                None
            }
            Err(e) => self.on_sync_result(Err(e)).await,
        }
    }

    /// Sync failures are reported and heal on the next change.
    async fn on_sync_result(&mut self, result: Result<(), SyncError>) -> Option<SessionEnd> {
        let room_id = self.session.room_id;

        match result {
            Ok(()) => None,
            Err(SyncError::PermissionDenied(action)) => {
                debug!("User {} may not {}", self.session.user_id, action);
                self.emit(CollabEvent::PermissionDenied { room_id, action });
                None
            }
            Err(SyncError::Engine(e)) => {
                error!("Playback failed in room {}: {}", room_id, e);

                self.emit(CollabEvent::PlaybackError {
                    room_id,
                    error: e.to_string(),
                });
                None
            }
            Err(SyncError::Store(e)) if e.is_not_found() => self.on_member_removed().await,
            Err(e) => {
                warn!("Could not sync room {}: {}", room_id, e);
                None
            }
        }
    }

    async fn publish_roster(&self) {
        match self.membership.roster(self.session.room_id).await {
            Ok(members) => self.emit(CollabEvent::RosterUpdate {
                room_id: self.session.room_id,
                members,
            }),
            Err(e) => warn!(
                "Could not fetch roster of room {}: {}",
                self.session.room_id, e
            ),
        }
    }

    async fn teardown(&mut self, end: SessionEnd) {
        debug!("Tearing down session: {:?}", self.session.introspect());

        self.session.teardown();
        self.removal_retry = None;
        self.engine.pause();

        let room_id = self.session.room_id;

        match end {
            SessionEnd::Disconnected | SessionEnd::Detached => {
                let member = self.session.member();

                if let Err(e) = self.membership.disconnect(&member).await {
                    warn!("Could not mark user {} as disconnected: {}", member.user_id, e);
                }
            }
            SessionEnd::Kicked => self.emit(CollabEvent::Kicked { room_id }),
            SessionEnd::RoomClosed => self.emit(CollabEvent::RoomClosed { room_id }),
            SessionEnd::Left => {}
        }

        info!(
            "User {} detached from room {}: {:?}",
            self.session.user_id, room_id, end
        );
    }

    fn emit(&self, event: CollabEvent) {
        // The handle may be gone already
        let _ = self.events.send(event);
    }
}

impl RoomHandle {
    pub(crate) fn new(
        room_id: PrimaryKey,
        user_id: UserId,
        commands: UnboundedSender<RoomCommand>,
        events: EventReceiver,
        task: JoinHandle<SessionEnd>,
    ) -> Self {
        Self {
            room_id,
            user_id,
            commands,
            events,
            task,
        }
    }

    /// The notices of this client, meant for the user interface.
    pub fn events(&self) -> &EventReceiver {
        &self.events
    }

    pub async fn load_video(&self, url: &str) -> Result<(), ClientError> {
        let url = url.to_string();
        self.request(|reply| RoomCommand::LoadVideo { url, reply })
            .await
    }

    pub async fn invite(&self, user_id: UserId) -> Result<MemberData, ClientError> {
        self.request(|reply| RoomCommand::Invite { user_id, reply })
            .await
    }

    pub async fn kick(&self, user_id: UserId) -> Result<(), ClientError> {
        self.request(|reply| RoomCommand::Kick { user_id, reply })
            .await
    }

    pub async fn transfer_host(&self, user_id: UserId) -> Result<(), ClientError> {
        self.request(|reply| RoomCommand::TransferHost { user_id, reply })
            .await
    }

    pub async fn update_permissions(&self, permissions: Permissions) -> Result<(), ClientError> {
        self.request(|reply| RoomCommand::UpdatePermissions { permissions, reply })
            .await
    }

    pub async fn leave(&self) -> Result<(), ClientError> {
        self.request(|reply| RoomCommand::Leave { reply }).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(|reply| RoomCommand::Disconnect { reply })
            .await
    }

    /// Waits for the session to end.
    pub async fn closed(self) -> SessionEnd {
        match self.task.await {
            Ok(end) => end,
            Err(e) => {
                error!("Room client for room {} failed: {}", self.room_id, e);
                SessionEnd::Detached
            }
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> RoomCommand,
    ) -> Result<T, ClientError> {
        let (reply, response) = oneshot::channel();

        self.commands
            .send(command(reply))
            .map_err(|_| ClientError::SessionEnded)?;

        response.await.map_err(|_| ClientError::SessionEnded)?
    }
}
