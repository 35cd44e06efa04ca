use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DatabaseError;

/// The type used for primary keys in the database.
pub type PrimaryKey = i64;

/// Users are owned by the external identity provider, we only store their id.
pub type UserId = PrimaryKey;

/// Who is allowed to perform a class of actions in a room
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[default]
    HostOnly,
    Everyone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Invited,
    Joined,
    Left,
}

/// A watch party room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomData {
    pub id: PrimaryKey,
    pub name: String,
    /// The current authority of the room, always a joined member
    pub host_id: UserId,
    pub current_video_url: Option<String>,
    /// The shared position in seconds, as of the last write
    pub video_timestamp: f64,
    pub is_playing: bool,
    /// Who may play, pause and seek
    pub playback_control: Permission,
    /// Who may load a new video
    pub load_movies: Permission,
    /// Who may invite users
    pub invite_users: Permission,
    pub created_at: DateTime<Utc>,
}

/// A user's relationship to a room
/// Note: `room_id` and `user_id` are unique together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberData {
    pub id: PrimaryKey,
    pub room_id: PrimaryKey,
    pub user_id: UserId,
    pub status: MemberStatus,
    /// Whether the member currently has a client attached, independent of `status`
    pub is_connected: bool,
    /// Set when the member must run the join handshake
    pub needs_sync: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

/// The three permission fields of a room
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub playback_control: Permission,
    pub load_movies: Permission,
    pub invite_users: Permission,
}

#[derive(Debug)]
pub struct NewRoom {
    pub name: String,
    /// The creator of the room, who becomes its host
    pub host_id: UserId,
    pub permissions: Permissions,
}

#[derive(Debug)]
pub struct NewMember {
    pub room_id: PrimaryKey,
    pub user_id: UserId,
    pub status: MemberStatus,
    pub is_connected: bool,
    pub joined_at: Option<DateTime<Utc>>,
}

/// A partial update of a room. Fields left as `None` are not touched.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoomPatch {
    pub host_id: Option<UserId>,
    pub current_video_url: Option<String>,
    pub video_timestamp: Option<f64>,
    pub is_playing: Option<bool>,
    pub playback_control: Option<Permission>,
    pub load_movies: Option<Permission>,
    pub invite_users: Option<Permission>,
}

/// A partial update of a member. Fields left as `None` are not touched.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemberPatch {
    pub status: Option<MemberStatus>,
    pub is_connected: Option<bool>,
    pub needs_sync: Option<bool>,
    pub joined_at: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

/// Narrows down member queries. An empty filter matches every member.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MemberFilter {
    pub status: Option<MemberStatus>,
    pub is_connected: Option<bool>,
    /// Leaves out the given user
    pub excluding: Option<UserId>,
}

impl Permission {
    /// Returns true if a user with the given role may act.
    pub fn allows(&self, is_host: bool) -> bool {
        is_host || *self == Self::Everyone
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostOnly => "host_only",
            Self::Everyone => "everyone",
        }
    }
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invited => "invited",
            Self::Joined => "joined",
            Self::Left => "left",
        }
    }
}

impl FromStr for Permission {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host_only" => Ok(Self::HostOnly),
            "everyone" => Ok(Self::Everyone),
            other => Err(DatabaseError::Internal(
                format!("Unknown permission {}", other).into(),
            )),
        }
    }
}

impl FromStr for MemberStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invited" => Ok(Self::Invited),
            "joined" => Ok(Self::Joined),
            "left" => Ok(Self::Left),
            other => Err(DatabaseError::Internal(
                format!("Unknown member status {}", other).into(),
            )),
        }
    }
}

impl Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RoomData {
    pub fn is_host(&self, user_id: UserId) -> bool {
        self.host_id == user_id
    }

    pub fn permissions(&self) -> Permissions {
        Permissions {
            playback_control: self.playback_control,
            load_movies: self.load_movies,
            invite_users: self.invite_users,
        }
    }
}

impl RoomPatch {
    /// Publishes a playback position and state.
    pub fn playback(video_timestamp: f64, is_playing: bool) -> Self {
        Self {
            video_timestamp: Some(video_timestamp),
            is_playing: Some(is_playing),
            ..Default::default()
        }
    }

    /// Switches the room to a new video, paused at the start.
    pub fn load(url: &str) -> Self {
        Self {
            current_video_url: Some(url.to_string()),
            video_timestamp: Some(0.),
            is_playing: Some(false),
            ..Default::default()
        }
    }

    pub fn host(host_id: UserId) -> Self {
        Self {
            host_id: Some(host_id),
            ..Default::default()
        }
    }

    pub fn apply(&self, room: &mut RoomData) {
        if let Some(host_id) = self.host_id {
            room.host_id = host_id;
        }
        if let Some(url) = &self.current_video_url {
            room.current_video_url = Some(url.clone());
        }
        if let Some(timestamp) = self.video_timestamp {
            room.video_timestamp = timestamp;
        }
        if let Some(is_playing) = self.is_playing {
            room.is_playing = is_playing;
        }
        if let Some(permission) = self.playback_control {
            room.playback_control = permission;
        }
        if let Some(permission) = self.load_movies {
            room.load_movies = permission;
        }
        if let Some(permission) = self.invite_users {
            room.invite_users = permission;
        }
    }
}

impl MemberPatch {
    pub fn apply(&self, member: &mut MemberData) {
        if let Some(status) = self.status {
            member.status = status;
        }
        if let Some(is_connected) = self.is_connected {
            member.is_connected = is_connected;
        }
        if let Some(needs_sync) = self.needs_sync {
            member.needs_sync = needs_sync;
        }
        if let Some(joined_at) = self.joined_at {
            member.joined_at = Some(joined_at);
        }
        if let Some(last_disconnected) = self.last_disconnected {
            member.last_disconnected = Some(last_disconnected);
        }
    }
}

impl MemberFilter {
    pub fn joined() -> Self {
        Self {
            status: Some(MemberStatus::Joined),
            ..Default::default()
        }
    }

    /// Members who are joined and have a client attached right now.
    pub fn present() -> Self {
        Self {
            status: Some(MemberStatus::Joined),
            is_connected: Some(true),
            ..Default::default()
        }
    }

    pub fn excluding(mut self, user_id: UserId) -> Self {
        self.excluding = Some(user_id);
        self
    }

    pub fn matches(&self, member: &MemberData) -> bool {
        self.status.map_or(true, |s| member.status == s)
            && self.is_connected.map_or(true, |c| member.is_connected == c)
            && self.excluding.map_or(true, |u| member.user_id != u)
    }
}
