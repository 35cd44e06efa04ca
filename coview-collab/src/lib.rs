//! Watch party collaboration: the shared room store, playback synchronization
//! between clients, and the membership lifecycle of rooms.

mod db;
mod events;
mod rooms;

use std::sync::Arc;

pub use db::*;
pub use events::*;
pub use rooms::*;

use coview_core::{EngineEventReceiver, PlaybackEngine, SyncConfig};
use crossbeam::channel::unbounded;
use log::info;
use tokio::sync::mpsc::unbounded_channel;

/// The coview collab system, facilitating rooms, their members and playback sync.
pub struct Collab<Db> {
    context: CollabContext<Db>,

    pub membership: MembershipCoordinator<Db>,
}

/// A type passed to the room clients, to access the store and the sync configuration.
pub struct CollabContext<Db> {
    pub database: Arc<Db>,
    pub config: SyncConfig,
}

impl<Db> Collab<Db>
where
    Db: Database,
{
    pub fn new(database: Db, config: SyncConfig) -> Self {
        let database = Arc::new(database);

        let context = CollabContext {
            database: database.clone(),
            config,
        };

        Self {
            context,
            membership: MembershipCoordinator::new(database),
        }
    }

    pub fn database(&self) -> &Arc<Db> {
        &self.context.database
    }

    pub fn config(&self) -> &SyncConfig {
        &self.context.config
    }

    /// Creates a room hosted by `host_id`, inviting the given users.
    pub async fn create_room(
        &self,
        name: &str,
        host_id: UserId,
        permissions: Permissions,
        invitees: &[UserId],
    ) -> std::result::Result<RoomData, MembershipError> {
        let (room, _) = self
            .membership
            .create_room(name, host_id, permissions, invitees)
            .await?;

        Ok(room)
    }

    pub async fn rooms_for_user(
        &self,
        user_id: UserId,
    ) -> std::result::Result<Vec<RoomSummary>, MembershipError> {
        self.membership.rooms_for_user(user_id).await
    }

    /// Attaches a client to a room the user is a member of, joining it.
    ///
    /// The engine is driven by the returned client until the session ends.
    pub async fn enter(
        &self,
        room_id: PrimaryKey,
        user_id: UserId,
        engine: Arc<dyn PlaybackEngine>,
        engine_events: EngineEventReceiver,
    ) -> std::result::Result<RoomHandle, ClientError> {
        // Subscribe first, so the client sees its own join and runs the handshake
        let feed = self.context.database.subscribe(room_id).await?;
        let member = self.membership.enter(room_id, user_id).await?;
        let room = self.context.database.room_by_id(room_id).await?;

        let (event_sender, event_receiver) = unbounded();
        let (command_sender, command_receiver) = unbounded_channel();

        let client = RoomClient::new(
            &self.context,
            ClientSession::new(room, member),
            engine,
            engine_events,
            feed,
            command_receiver,
            event_sender,
        );

        let task = tokio::spawn(client.run());

        Ok(RoomHandle::new(
            room_id,
            user_id,
            command_sender,
            event_receiver,
            task,
        ))
    }

    /// Leaves the room the user is currently in, if any, then enters another.
    pub async fn switch_room(
        &self,
        room_id: PrimaryKey,
        user_id: UserId,
        engine: Arc<dyn PlaybackEngine>,
        engine_events: EngineEventReceiver,
    ) -> std::result::Result<RoomHandle, ClientError> {
        let left = self.membership.switch_room(user_id, room_id).await?;

        if !left.is_empty() {
            info!("User {} switched from rooms {:?} to {}", user_id, left, room_id);
        }

        self.enter(room_id, user_id, engine, engine_events).await
    }
}

impl<Db> Clone for CollabContext<Db>
where
    Db: Database,
{
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            config: self.config.clone(),
        }
    }
}
