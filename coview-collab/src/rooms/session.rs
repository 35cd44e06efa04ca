use std::{pin::Pin, sync::Arc, time::Duration};

use coview_core::{Introspect, SyncLock, SyncLockIntrospection};
use tokio::time::{sleep, Sleep};

use crate::{MemberData, PrimaryKey, RoomData, UserId};

use super::Action;

/// The local state of a client attached to a room. Never persisted.
///
/// The room and member are immutable snapshots, replaced wholesale whenever
/// a newer version arrives.
pub struct ClientSession {
    pub room_id: PrimaryKey,
    pub user_id: UserId,
    room: Arc<RoomData>,
    member: Arc<MemberData>,
    lock: SyncLock,
    /// Pending join grace period, if the client is still catching up
    grace: Option<Pin<Box<Sleep>>>,
}

#[derive(Debug)]
pub struct ClientSessionIntrospection {
    pub room_id: PrimaryKey,
    pub user_id: UserId,
    pub is_host: bool,
    pub lock: SyncLockIntrospection,
    pub grace_pending: bool,
}

impl ClientSession {
    pub fn new(room: RoomData, member: MemberData) -> Self {
        Self {
            room_id: room.id,
            user_id: member.user_id,
            room: room.into(),
            member: member.into(),
            lock: SyncLock::new(),
            grace: None,
        }
    }

    pub fn room(&self) -> Arc<RoomData> {
        self.room.clone()
    }

    pub fn member(&self) -> Arc<MemberData> {
        self.member.clone()
    }

    pub fn lock(&self) -> &SyncLock {
        &self.lock
    }

    /// Replaces the room snapshot, returning the previous one.
    pub fn replace_room(&mut self, room: RoomData) -> Arc<RoomData> {
        std::mem::replace(&mut self.room, room.into())
    }

    pub fn replace_member(&mut self, member: MemberData) -> Arc<MemberData> {
        std::mem::replace(&mut self.member, member.into())
    }

    pub fn is_host(&self) -> bool {
        self.room.is_host(self.user_id)
    }

    pub fn can(&self, action: Action) -> bool {
        self.room.allows(self.user_id, action)
    }

    /// Starts the join grace timer, replacing a pending one.
    pub fn start_grace(&mut self, duration: Duration) {
        self.grace = Some(Box::pin(sleep(duration)));
    }

    /// Drops the pending grace timer. Returns true if there was one.
    pub fn cancel_grace(&mut self) -> bool {
        self.grace.take().is_some()
    }

    pub fn grace_pending(&self) -> bool {
        self.grace.is_some()
    }

    /// The pending grace timer, to be awaited by the client loop.
    pub fn grace_timer(&mut self) -> Option<&mut Pin<Box<Sleep>>> {
        self.grace.as_mut()
    }

    /// Cancels every timer the session owns.
    pub fn teardown(&mut self) {
        self.cancel_grace();
        self.lock.clear();
    }
}

impl Introspect<ClientSessionIntrospection> for ClientSession {
    fn introspect(&self) -> ClientSessionIntrospection {
        ClientSessionIntrospection {
            room_id: self.room_id,
            user_id: self.user_id,
            is_host: self.is_host(),
            lock: self.lock.introspect(),
            grace_pending: self.grace_pending(),
        }
    }
}
