use std::fmt::Display;

use crate::{RoomData, UserId};

/// Something a user can try to do in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Play, pause or seek
    ControlPlayback,
    LoadVideo,
    Invite,
    Kick,
    TransferHost,
    UpdatePermissions,
}

impl RoomData {
    /// Returns true if the user may perform the action, judged by this snapshot of the room.
    pub fn allows(&self, user_id: UserId, action: Action) -> bool {
        let is_host = self.is_host(user_id);

        match action {
            Action::ControlPlayback => self.playback_control.allows(is_host),
            Action::LoadVideo => self.load_movies.allows(is_host),
            Action::Invite => self.invite_users.allows(is_host),
            Action::Kick | Action::TransferHost | Action::UpdatePermissions => is_host,
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            Action::ControlPlayback => "control playback",
            Action::LoadVideo => "load videos",
            Action::Invite => "invite users",
            Action::Kick => "kick members",
            Action::TransferHost => "transfer hosting",
            Action::UpdatePermissions => "change permissions",
        };

        f.write_str(str)
    }
}
