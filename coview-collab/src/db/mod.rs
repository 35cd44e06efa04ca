use async_trait::async_trait;
use thiserror::Error;

mod changes;
mod data;
mod memory;
mod pg;

pub use changes::*;
pub use data::*;
pub use memory::*;
pub use pg::*;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// An unknown or internal error happened with the database
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        /// The resource in question
        resource: &'static str,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A resource in the database doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: &'static str,
    },
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Helper trait to reduce boilerplate
pub trait IntoDatabaseError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError;
    /// Turns a unique constraint violation into a conflict
    fn conflict_or(self, resource: &'static str, field: &'static str, value: &str)
        -> DatabaseError;
    fn any(self) -> DatabaseError;
}

/// Helper trait to reduce boilerplate
pub trait DatabaseResult<T> {
    /// Turns a not found error into `None`
    fn found(self) -> Result<Option<T>>;
}

impl<T> DatabaseResult<T> for Result<T> {
    fn found(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The shared state store every client of a room reads, writes and subscribes to.
///
/// Writes to a single row are delivered to subscribers in commit order.
/// Nothing is promised about the order of changes to different rows.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData>;
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData>;
    async fn update_room(&self, room_id: PrimaryKey, patch: RoomPatch) -> Result<RoomData>;
    /// Deletes the room along with all of its members.
    async fn delete_room(&self, room_id: PrimaryKey) -> Result<()>;

    async fn member_by_user(&self, room_id: PrimaryKey, user_id: UserId) -> Result<MemberData>;
    async fn list_members(
        &self,
        room_id: PrimaryKey,
        filter: MemberFilter,
    ) -> Result<Vec<MemberData>>;
    async fn memberships_by_user(&self, user_id: UserId) -> Result<Vec<MemberData>>;
    async fn count_members(&self, room_id: PrimaryKey, filter: MemberFilter) -> Result<usize>;
    async fn create_member(&self, new_member: NewMember) -> Result<MemberData>;
    async fn update_member(&self, member_id: PrimaryKey, patch: MemberPatch)
        -> Result<MemberData>;
    async fn delete_member(&self, member_id: PrimaryKey) -> Result<()>;

    /// Subscribes to changes of the room and its members.
    async fn subscribe(&self, room_id: PrimaryKey) -> Result<ChangeFeed>;
}
