use crossbeam::channel::{Receiver, Sender};

use crate::{rooms::Action, MemberData, PrimaryKey, UserId};

pub type EventSender = Sender<CollabEvent>;
pub type EventReceiver = Receiver<CollabEvent>;

/// Notices a room client emits for its user interface
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    /// The members who are joined and connected changed
    RosterUpdate {
        room_id: PrimaryKey,
        members: Vec<MemberData>,
    },
    /// Hosting of the room moved to another user
    HostChanged {
        room_id: PrimaryKey,
        host_id: UserId,
        /// Whether the local user is now the host
        is_local_host: bool,
    },
    /// A local action was rejected by the room's permissions
    PermissionDenied { room_id: PrimaryKey, action: Action },
    /// The playback engine failed to load or initialize a source.
    PlaybackError { room_id: PrimaryKey, error: String },
    /// The client is catching up to the room after joining.
    JoinSyncStarted {
        room_id: PrimaryKey,
        /// The room position the engine was moved to, in seconds
        position: f64,
    },
    /// The client caught up and follows the room again.
    JoinSyncCompleted { room_id: PrimaryKey },
    /// The local user was removed from a room that still exists
    Kicked { room_id: PrimaryKey },
    /// The room was deleted
    RoomClosed { room_id: PrimaryKey },
}
