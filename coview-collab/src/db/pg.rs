use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::Deserialize;
use sqlx::{
    postgres::{PgListener, PgPoolOptions},
    query, query_as, query_scalar, Error as SqlxError, FromRow, PgPool,
};

use crate::{
    ChangeEvent, ChangeFeed, ChangeSender, Database, DatabaseError, IntoDatabaseError,
    MemberData, MemberFilter, MemberPatch, NewMember, NewRoom, PrimaryKey, Result, RoomData,
    RoomPatch, RowChange, UserId,
};

/// The channel the row triggers in `migrations/` notify on.
const CHANGE_CHANNEL: &str = "coview_changes";

/// Open change feeds by room
type Feeds = DashMap<PrimaryKey, Vec<ChangeSender>>;

/// A postgres database implementation for coview
pub struct PgDatabase {
    pool: PgPool,
    /// Fed by a single listener connection that lives outside the pool
    feeds: Arc<Feeds>,
}

#[derive(FromRow)]
struct RoomRow {
    id: i64,
    name: String,
    host_id: i64,
    current_video_url: Option<String>,
    video_timestamp: f64,
    is_playing: bool,
    playback_control: String,
    load_movies: String,
    invite_users: String,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct MemberRow {
    id: i64,
    room_id: i64,
    user_id: i64,
    status: String,
    is_connected: bool,
    needs_sync: bool,
    joined_at: Option<DateTime<Utc>>,
    last_disconnected: Option<DateTime<Utc>>,
}

/// The payload of a change notification
#[derive(Debug, Deserialize)]
struct Notification {
    table: String,
    op: String,
    room_id: PrimaryKey,
    row: Option<serde_json::Value>,
}

impl IntoDatabaseError for SqlxError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError {
        match self {
            SqlxError::RowNotFound => DatabaseError::NotFound {
                resource,
                identifier,
            },
            e => e.any(),
        }
    }

    fn conflict_or(
        self,
        resource: &'static str,
        field: &'static str,
        value: &str,
    ) -> DatabaseError {
        match self {
            SqlxError::Database(ref e) if e.is_unique_violation() => DatabaseError::Conflict {
                resource,
                field,
                value: value.to_string(),
            },
            e => e.any(),
        }
    }

    fn any(self) -> DatabaseError {
        DatabaseError::Internal(Box::new(self))
    }
}

impl TryFrom<RoomRow> for RoomData {
    type Error = DatabaseError;

    fn try_from(row: RoomRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            host_id: row.host_id,
            current_video_url: row.current_video_url,
            video_timestamp: row.video_timestamp,
            is_playing: row.is_playing,
            playback_control: row.playback_control.parse()?,
            load_movies: row.load_movies.parse()?,
            invite_users: row.invite_users.parse()?,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<MemberRow> for MemberData {
    type Error = DatabaseError;

    fn try_from(row: MemberRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            room_id: row.room_id,
            user_id: row.user_id,
            status: row.status.parse()?,
            is_connected: row.is_connected,
            needs_sync: row.needs_sync,
            joined_at: row.joined_at,
            last_disconnected: row.last_disconnected,
        })
    }
}

impl Notification {
    fn into_change(self) -> Result<ChangeEvent> {
        fn row<T: for<'de> Deserialize<'de>>(value: Option<serde_json::Value>) -> Result<T> {
            let value = value.ok_or(DatabaseError::Internal(
                "notification is missing its row".into(),
            ))?;

            serde_json::from_value(value).map_err(|e| DatabaseError::Internal(Box::new(e)))
        }

        let change = match (self.table.as_str(), self.op.as_str()) {
            ("rooms", "INSERT") => ChangeEvent::Room(RowChange::Insert(row(self.row)?)),
            ("rooms", "UPDATE") => ChangeEvent::Room(RowChange::Update(row(self.row)?)),
            ("rooms", "DELETE") => ChangeEvent::Room(RowChange::Delete),
            ("room_members", "INSERT") => ChangeEvent::Member(RowChange::Insert(row(self.row)?)),
            ("room_members", "UPDATE") => ChangeEvent::Member(RowChange::Update(row(self.row)?)),
            ("room_members", "DELETE") => ChangeEvent::Member(RowChange::Delete),
            (table, op) => {
                return Err(DatabaseError::Internal(
                    format!("Unknown change {} on {}", op, table).into(),
                ))
            }
        };

        Ok(change)
    }
}

impl PgDatabase {
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| e.any())?;

        let mut listener = PgListener::connect(url).await.map_err(|e| e.any())?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| e.any())?;

        let feeds = Arc::new(Feeds::new());
        tokio::spawn(route_changes(listener, Arc::downgrade(&feeds)));

        Ok(Self { pool, feeds })
    }

    /// Brings the schema up to date, including the change notification triggers.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        query_as::<_, RoomRow>("SELECT * FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room", "id"))?
            .try_into()
    }

    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        query_as::<_, RoomRow>(
            "INSERT INTO rooms (name, host_id, playback_control, load_movies, invite_users)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *",
        )
        .bind(&new_room.name)
        .bind(new_room.host_id)
        .bind(new_room.permissions.playback_control.as_str())
        .bind(new_room.permissions.load_movies.as_str())
        .bind(new_room.permissions.invite_users.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())?
        .try_into()
    }

    async fn update_room(&self, room_id: PrimaryKey, patch: RoomPatch) -> Result<RoomData> {
        query_as::<_, RoomRow>(
            "UPDATE rooms SET
                host_id = COALESCE($2, host_id),
                current_video_url = COALESCE($3, current_video_url),
                video_timestamp = COALESCE($4, video_timestamp),
                is_playing = COALESCE($5, is_playing),
                playback_control = COALESCE($6, playback_control),
                load_movies = COALESCE($7, load_movies),
                invite_users = COALESCE($8, invite_users)
            WHERE id = $1
            RETURNING *",
        )
        .bind(room_id)
        .bind(patch.host_id)
        .bind(patch.current_video_url)
        .bind(patch.video_timestamp)
        .bind(patch.is_playing)
        .bind(patch.playback_control.map(|p| p.as_str()))
        .bind(patch.load_movies.map(|p| p.as_str()))
        .bind(patch.invite_users.map(|p| p.as_str()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("room", "id"))?
        .try_into()
    }

    async fn delete_room(&self, room_id: PrimaryKey) -> Result<()> {
        // Members are removed by the cascading foreign key
        let result = query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            });
        }

        Ok(())
    }

    async fn member_by_user(&self, room_id: PrimaryKey, user_id: UserId) -> Result<MemberData> {
        query_as::<_, MemberRow>("SELECT * FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("member", "user_id"))?
            .try_into()
    }

    async fn list_members(
        &self,
        room_id: PrimaryKey,
        filter: MemberFilter,
    ) -> Result<Vec<MemberData>> {
        query_as::<_, MemberRow>(
            "SELECT * FROM room_members
            WHERE room_id = $1
                AND ($2::text IS NULL OR status = $2)
                AND ($3::boolean IS NULL OR is_connected = $3)
                AND ($4::bigint IS NULL OR user_id <> $4)
            ORDER BY id",
        )
        .bind(room_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.is_connected)
        .bind(filter.excluding)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?
        .into_iter()
        .map(MemberData::try_from)
        .collect()
    }

    async fn memberships_by_user(&self, user_id: UserId) -> Result<Vec<MemberData>> {
        query_as::<_, MemberRow>("SELECT * FROM room_members WHERE user_id = $1 ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())?
            .into_iter()
            .map(MemberData::try_from)
            .collect()
    }

    async fn count_members(&self, room_id: PrimaryKey, filter: MemberFilter) -> Result<usize> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM room_members
            WHERE room_id = $1
                AND ($2::text IS NULL OR status = $2)
                AND ($3::boolean IS NULL OR is_connected = $3)
                AND ($4::bigint IS NULL OR user_id <> $4)",
        )
        .bind(room_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.is_connected)
        .bind(filter.excluding)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())?;

        Ok(count as usize)
    }

    async fn create_member(&self, new_member: NewMember) -> Result<MemberData> {
        // The unique (room_id, user_id) constraint decides between concurrent inserts
        query_as::<_, MemberRow>(
            "INSERT INTO room_members (room_id, user_id, status, is_connected, joined_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *",
        )
        .bind(new_member.room_id)
        .bind(new_member.user_id)
        .bind(new_member.status.as_str())
        .bind(new_member.is_connected)
        .bind(new_member.joined_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.conflict_or("member", "user_id", &new_member.user_id.to_string()))?
        .try_into()
    }

    async fn update_member(
        &self,
        member_id: PrimaryKey,
        patch: MemberPatch,
    ) -> Result<MemberData> {
        query_as::<_, MemberRow>(
            "UPDATE room_members SET
                status = COALESCE($2, status),
                is_connected = COALESCE($3, is_connected),
                needs_sync = COALESCE($4, needs_sync),
                joined_at = COALESCE($5, joined_at),
                last_disconnected = COALESCE($6, last_disconnected)
            WHERE id = $1
            RETURNING *",
        )
        .bind(member_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.is_connected)
        .bind(patch.needs_sync)
        .bind(patch.joined_at)
        .bind(patch.last_disconnected)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("member", "id"))?
        .try_into()
    }

    async fn delete_member(&self, member_id: PrimaryKey) -> Result<()> {
        let result = query("DELETE FROM room_members WHERE id = $1")
            .bind(member_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                resource: "member",
                identifier: "id",
            });
        }

        Ok(())
    }

    async fn subscribe(&self, room_id: PrimaryKey) -> Result<ChangeFeed> {
        let (sender, feed) = ChangeFeed::channel();

        let mut senders = self.feeds.entry(room_id).or_default();
        senders.retain(|sender| !sender.is_closed());
        senders.push(sender);

        Ok(feed)
    }
}

/// Forwards every notification on the change channel to the feeds of its room.
async fn route_changes(mut listener: PgListener, feeds: Weak<Feeds>) {
    loop {
        let notification = listener.recv().await;

        let Some(feeds) = feeds.upgrade() else {
            break;
        };

        match notification {
            Ok(notification) => dispatch(&feeds, notification.payload()),
            Err(e) => {
                // Closing every feed detaches the clients instead of leaving them deaf
                warn!("Change listener failed, closing all feeds: {}", e);
                feeds.clear();
                break;
            }
        }
    }

    debug!("Change listener stopped");
}

fn dispatch(feeds: &Feeds, payload: &str) {
    let notification = match serde_json::from_str::<Notification>(payload) {
        Ok(n) => n,
        Err(e) => {
            warn!("Dropped malformed change notification: {}", e);
            return;
        }
    };

    let room_id = notification.room_id;

    let Some(mut senders) = feeds.get_mut(&room_id) else {
        return;
    };

    match notification.into_change() {
        Ok(change) => senders.retain(|sender| sender.send(change.clone()).is_ok()),
        Err(e) => warn!("Dropped change notification for room {}: {}", room_id, e),
    }

    drop(senders);
    feeds.remove_if(&room_id, |_, senders| senders.is_empty());
}
