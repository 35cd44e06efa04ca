use async_trait::async_trait;
use chrono::Utc;
use crossbeam::atomic::AtomicCell;
use dashmap::{mapref::entry::Entry, DashMap};
use log::info;
use parking_lot::Mutex;

use crate::{
    ChangeEvent, ChangeFeed, ChangeSender, Database, DatabaseError, MemberData, MemberFilter,
    MemberPatch, NewMember, NewRoom, PrimaryKey, Result, RoomData, RoomPatch, RowChange, UserId,
};

/// An in-process store, shared by every client in the same process.
///
/// Changes are published while the written row is still locked, which keeps
/// per-row delivery in commit order.
pub struct MemoryDatabase {
    rooms: DashMap<PrimaryKey, RoomData>,
    members: DashMap<PrimaryKey, MemberData>,
    /// Unique index of members by room and user
    member_keys: DashMap<(PrimaryKey, UserId), PrimaryKey>,
    next_id: AtomicCell<PrimaryKey>,
    subscribers: Mutex<Vec<Subscriber>>,
    offline: AtomicCell<bool>,
}

struct Subscriber {
    room_id: PrimaryKey,
    sender: ChangeSender,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            rooms: Default::default(),
            members: Default::default(),
            member_keys: Default::default(),
            next_id: AtomicCell::new(1),
            subscribers: Default::default(),
            offline: false.into(),
        }
    }

    /// Makes every following call fail, like a store that cannot be reached.
    pub fn set_offline(&self, offline: bool) {
        info!("Memory store is now {}", if offline { "offline" } else { "online" });
        self.offline.store(offline);
    }

    /// Returns how many subscriptions are still alive.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.len()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load() {
            return Err(DatabaseError::Internal("store is unreachable".into()));
        }

        Ok(())
    }

    fn next_id(&self) -> PrimaryKey {
        self.next_id.fetch_add(1)
    }

    fn publish(&self, room_id: PrimaryKey, event: ChangeEvent) {
        self.subscribers.lock().retain(|subscriber| {
            if subscriber.room_id != room_id {
                return !subscriber.sender.is_closed();
            }

            subscriber.sender.send(event.clone()).is_ok()
        });
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        self.ensure_online()?;

        self.rooms
            .get(&room_id)
            .map(|r| r.clone())
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            })
    }

    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        self.ensure_online()?;

        let room = RoomData {
            id: self.next_id(),
            name: new_room.name,
            host_id: new_room.host_id,
            current_video_url: None,
            video_timestamp: 0.,
            is_playing: false,
            playback_control: new_room.permissions.playback_control,
            load_movies: new_room.permissions.load_movies,
            invite_users: new_room.permissions.invite_users,
            created_at: Utc::now(),
        };

        self.rooms.insert(room.id, room.clone());
        self.publish(room.id, ChangeEvent::Room(RowChange::Insert(room.clone())));

        Ok(room)
    }

    async fn update_room(&self, room_id: PrimaryKey, patch: RoomPatch) -> Result<RoomData> {
        self.ensure_online()?;

        let mut entry = self
            .rooms
            .get_mut(&room_id)
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            })?;

        patch.apply(&mut entry);
        let room = entry.clone();

        self.publish(room_id, ChangeEvent::Room(RowChange::Update(room.clone())));

        Ok(room)
    }

    async fn delete_room(&self, room_id: PrimaryKey) -> Result<()> {
        self.ensure_online()?;

        // The room is gone before any member delete is observed
        self.rooms
            .remove(&room_id)
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            })?;

        let member_ids: Vec<_> = self
            .members
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| m.id)
            .collect();

        // Members are reported first, the same way a cascading delete would report them
        for member_id in member_ids {
            if let Some((_, member)) = self.members.remove(&member_id) {
                self.member_keys.remove(&(member.room_id, member.user_id));
                self.publish(room_id, ChangeEvent::Member(RowChange::Delete));
            }
        }

        self.publish(room_id, ChangeEvent::Room(RowChange::Delete));

        Ok(())
    }

    async fn member_by_user(&self, room_id: PrimaryKey, user_id: UserId) -> Result<MemberData> {
        self.ensure_online()?;

        let member_id = self.member_keys.get(&(room_id, user_id)).map(|id| *id);

        member_id
            .and_then(|id| self.members.get(&id).map(|m| m.clone()))
            .ok_or(DatabaseError::NotFound {
                resource: "member",
                identifier: "user_id",
            })
    }

    async fn list_members(
        &self,
        room_id: PrimaryKey,
        filter: MemberFilter,
    ) -> Result<Vec<MemberData>> {
        self.ensure_online()?;

        let mut members: Vec<_> = self
            .members
            .iter()
            .filter(|m| m.room_id == room_id && filter.matches(m))
            .map(|m| m.clone())
            .collect();

        members.sort_by_key(|m| m.id);
        Ok(members)
    }

    async fn memberships_by_user(&self, user_id: UserId) -> Result<Vec<MemberData>> {
        self.ensure_online()?;

        let mut members: Vec<_> = self
            .members
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.clone())
            .collect();

        members.sort_by_key(|m| m.id);
        Ok(members)
    }

    async fn count_members(&self, room_id: PrimaryKey, filter: MemberFilter) -> Result<usize> {
        self.ensure_online()?;

        Ok(self
            .members
            .iter()
            .filter(|m| m.room_id == room_id && filter.matches(m))
            .count())
    }

    async fn create_member(&self, new_member: NewMember) -> Result<MemberData> {
        self.room_by_id(new_member.room_id).await?;

        let key = (new_member.room_id, new_member.user_id);

        // The index entry stays locked until the member is in place
        let member = match self.member_keys.entry(key) {
            Entry::Occupied(_) => {
                return Err(DatabaseError::Conflict {
                    resource: "member",
                    field: "user_id",
                    value: new_member.user_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let member = MemberData {
                    id: self.next_id(),
                    room_id: new_member.room_id,
                    user_id: new_member.user_id,
                    status: new_member.status,
                    is_connected: new_member.is_connected,
                    needs_sync: false,
                    joined_at: new_member.joined_at,
                    last_disconnected: None,
                };

                self.members.insert(member.id, member.clone());
                slot.insert(member.id);
                member
            }
        };

        self.publish(
            member.room_id,
            ChangeEvent::Member(RowChange::Insert(member.clone())),
        );

        Ok(member)
    }

    async fn update_member(
        &self,
        member_id: PrimaryKey,
        patch: MemberPatch,
    ) -> Result<MemberData> {
        self.ensure_online()?;

        let mut entry = self
            .members
            .get_mut(&member_id)
            .ok_or(DatabaseError::NotFound {
                resource: "member",
                identifier: "id",
            })?;

        patch.apply(&mut entry);
        let member = entry.clone();

        self.publish(
            member.room_id,
            ChangeEvent::Member(RowChange::Update(member.clone())),
        );

        Ok(member)
    }

    async fn delete_member(&self, member_id: PrimaryKey) -> Result<()> {
        self.ensure_online()?;

        let (_, member) = self
            .members
            .remove(&member_id)
            .ok_or(DatabaseError::NotFound {
                resource: "member",
                identifier: "id",
            })?;

        self.member_keys.remove(&(member.room_id, member.user_id));
        self.publish(member.room_id, ChangeEvent::Member(RowChange::Delete));

        Ok(())
    }

    async fn subscribe(&self, room_id: PrimaryKey) -> Result<ChangeFeed> {
        self.ensure_online()?;

        let (sender, feed) = ChangeFeed::channel();
        self.subscribers.lock().push(Subscriber { room_id, sender });

        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemberStatus, Permissions};

    async fn room_with_host(db: &MemoryDatabase) -> (RoomData, MemberData) {
        let room = db
            .create_room(NewRoom {
                name: "Movie night".to_string(),
                host_id: 1,
                permissions: Permissions::default(),
            })
            .await
            .unwrap();

        let host = db
            .create_member(NewMember {
                room_id: room.id,
                user_id: 1,
                status: MemberStatus::Joined,
                is_connected: true,
                joined_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        (room, host)
    }

    #[tokio::test]
    async fn members_are_unique_per_room_and_user() {
        let db = MemoryDatabase::new();
        let (room, _) = room_with_host(&db).await;

        let duplicate = db
            .create_member(NewMember {
                room_id: room.id,
                user_id: 1,
                status: MemberStatus::Invited,
                is_connected: false,
                joined_at: None,
            })
            .await;

        assert!(matches!(duplicate, Err(DatabaseError::Conflict { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_inserts_create_one_member() {
        let db = std::sync::Arc::new(MemoryDatabase::new());
        let (room, _) = room_with_host(&db).await;
        let room_id = room.id;

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let db = db.clone();

                tokio::spawn(async move {
                    db.create_member(NewMember {
                        room_id,
                        user_id: 2,
                        status: MemberStatus::Invited,
                        is_connected: false,
                        joined_at: None,
                    })
                    .await
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(
            db.count_members(room.id, MemberFilter::default())
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn kicked_users_can_be_invited_again() {
        let db = MemoryDatabase::new();
        let (room, host) = room_with_host(&db).await;

        db.delete_member(host.id).await.unwrap();
        assert!(db
            .member_by_user(room.id, 1)
            .await
            .unwrap_err()
            .is_not_found());

        let again = db
            .create_member(NewMember {
                room_id: room.id,
                user_id: 1,
                status: MemberStatus::Invited,
                is_connected: false,
                joined_at: None,
            })
            .await
            .unwrap();

        assert_eq!(db.member_by_user(room.id, 1).await.unwrap().id, again.id);
    }

    #[tokio::test]
    async fn deletes_carry_no_row_and_cascade() {
        let db = MemoryDatabase::new();
        let (room, _) = room_with_host(&db).await;
        let mut feed = db.subscribe(room.id).await.unwrap();

        db.delete_room(room.id).await.unwrap();

        assert_eq!(feed.try_next(), Some(ChangeEvent::Member(RowChange::Delete)));
        assert_eq!(feed.try_next(), Some(ChangeEvent::Room(RowChange::Delete)));
        assert_eq!(
            db.count_members(room.id, MemberFilter::default())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn subscriptions_only_see_their_room() {
        let db = MemoryDatabase::new();
        let (first, _) = room_with_host(&db).await;
        let (second, _) = room_with_host(&db).await;
        let mut feed = db.subscribe(first.id).await.unwrap();

        db.update_room(second.id, RoomPatch::playback(10., true))
            .await
            .unwrap();
        db.update_room(first.id, RoomPatch::playback(20., false))
            .await
            .unwrap();

        match feed.try_next() {
            Some(ChangeEvent::Room(RowChange::Update(room))) => {
                assert_eq!(room.id, first.id);
                assert_eq!(room.video_timestamp, 20.);
            }
            other => panic!("unexpected change {:?}", other),
        }
        assert_eq!(feed.try_next(), None);
    }

    #[tokio::test]
    async fn dropped_feeds_are_forgotten() {
        let db = MemoryDatabase::new();
        let (room, _) = room_with_host(&db).await;

        let feed = db.subscribe(room.id).await.unwrap();
        assert_eq!(db.subscriber_count(), 1);

        drop(feed);
        assert_eq!(db.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let db = MemoryDatabase::new();
        let (room, _) = room_with_host(&db).await;

        db.set_offline(true);
        assert!(matches!(
            db.room_by_id(room.id).await,
            Err(DatabaseError::Internal(_))
        ));

        db.set_offline(false);
        assert!(db.room_by_id(room.id).await.is_ok());
    }

    #[tokio::test]
    async fn member_filters_narrow_counts() {
        let db = MemoryDatabase::new();
        let (room, host) = room_with_host(&db).await;

        db.create_member(NewMember {
            room_id: room.id,
            user_id: 2,
            status: MemberStatus::Invited,
            is_connected: false,
            joined_at: None,
        })
        .await
        .unwrap();

        let count = |filter| db.count_members(room.id, filter);

        assert_eq!(count(MemberFilter::default()).await.unwrap(), 2);
        assert_eq!(count(MemberFilter::joined()).await.unwrap(), 1);
        assert_eq!(
            count(MemberFilter::joined().excluding(host.user_id))
                .await
                .unwrap(),
            0
        );
    }
}
