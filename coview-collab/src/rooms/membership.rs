use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use log::{info, warn};
use thiserror::Error;

use crate::{
    Database, DatabaseError, DatabaseResult, MemberData, MemberFilter, MemberPatch, MemberStatus,
    NewMember, NewRoom, Permissions, PrimaryKey, RoomData, RoomPatch, UserId,
};

use super::Action;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Not allowed to {0}")]
    PermissionDenied(Action),
    #[error("The host has to transfer hosting before leaving")]
    HostMustTransfer,
    #[error("User is already a member of this room")]
    AlreadyMember,
    #[error("User is not a member of this room")]
    NotMember,
    #[error("Invalid target: {0}")]
    InvalidTarget(&'static str),
    #[error("Room name cannot be blank")]
    BlankName,
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl MembershipError {
    /// Returns true if the error means the room or member no longer exists.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_not_found())
    }
}

/// What is left of the local user's membership after a member row was deleted
#[derive(Debug, Clone, PartialEq)]
pub enum Removal {
    /// The user is still a member, somebody else was removed
    Present(MemberData),
    /// The room exists but the user's row is gone
    Kicked,
    /// The room itself is gone
    RoomClosed,
}

/// A room as listed for one of its members
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSummary {
    pub room: RoomData,
    pub membership: MemberData,
    pub member_count: usize,
    /// Members who are joined and connected right now
    pub present_count: usize,
}

/// Owns the member state machine and the room lifecycle that follows from it.
///
/// Permissions are judged against the caller's snapshot of the room.
pub struct MembershipCoordinator<Db> {
    database: Arc<Db>,
}

impl<Db> MembershipCoordinator<Db>
where
    Db: Database,
{
    pub fn new(database: Arc<Db>) -> Self {
        Self { database }
    }

    /// Creates a room hosted by `host_id` and invites the given users.
    pub async fn create_room(
        &self,
        name: &str,
        host_id: UserId,
        permissions: Permissions,
        invitees: &[UserId],
    ) -> Result<(RoomData, MemberData), MembershipError> {
        let name = name.trim();

        if name.is_empty() {
            return Err(MembershipError::BlankName);
        }

        let room = self
            .database
            .create_room(NewRoom {
                name: name.to_string(),
                host_id,
                permissions,
            })
            .await?;

        let host = self
            .database
            .create_member(NewMember {
                room_id: room.id,
                user_id: host_id,
                status: MemberStatus::Joined,
                is_connected: true,
                joined_at: Some(Utc::now()),
            })
            .await?;

        let mut seen = HashSet::from([host_id]);

        for &user_id in invitees {
            if !seen.insert(user_id) {
                continue;
            }

            self.database
                .create_member(NewMember {
                    room_id: room.id,
                    user_id,
                    status: MemberStatus::Invited,
                    is_connected: false,
                    joined_at: None,
                })
                .await?;
        }

        info!(
            "Room {} ({}) created by user {} with {} invitees",
            room.name,
            room.id,
            host_id,
            seen.len() - 1
        );

        Ok((room, host))
    }

    pub async fn invite(
        &self,
        room: &RoomData,
        actor: UserId,
        user_id: UserId,
    ) -> Result<MemberData, MembershipError> {
        if !room.allows(actor, Action::Invite) {
            return Err(MembershipError::PermissionDenied(Action::Invite));
        }

        let existing = self.database.member_by_user(room.id, user_id).await.found()?;

        if existing.is_some() {
            return Err(MembershipError::AlreadyMember);
        }

        let member = self
            .database
            .create_member(NewMember {
                room_id: room.id,
                user_id,
                status: MemberStatus::Invited,
                is_connected: false,
                joined_at: None,
            })
            .await
            .map_err(|e| match e {
                DatabaseError::Conflict { .. } => MembershipError::AlreadyMember,
                e => e.into(),
            })?;

        info!("User {} invited user {} to room {}", actor, user_id, room.id);
        Ok(member)
    }

    /// Joins with an existing row, whatever its status. Joining again is harmless.
    pub async fn join(&self, member: &MemberData) -> Result<MemberData, MembershipError> {
        let member = self
            .database
            .update_member(
                member.id,
                MemberPatch {
                    status: Some(MemberStatus::Joined),
                    is_connected: Some(true),
                    needs_sync: Some(true),
                    joined_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        info!("User {} joined room {}", member.user_id, member.room_id);
        Ok(member)
    }

    /// Joins the room the user has a row in.
    pub async fn enter(
        &self,
        room_id: PrimaryKey,
        user_id: UserId,
    ) -> Result<MemberData, MembershipError> {
        let member = self
            .database
            .member_by_user(room_id, user_id)
            .await
            .found()?
            .ok_or(MembershipError::NotMember)?;

        self.join(&member).await
    }

    pub async fn disconnect(&self, member: &MemberData) -> Result<MemberData, MembershipError> {
        let member = self
            .database
            .update_member(
                member.id,
                MemberPatch {
                    is_connected: Some(false),
                    last_disconnected: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        info!("User {} disconnected from room {}", member.user_id, member.room_id);
        Ok(member)
    }

    /// Leaves the room. Returns true if the room was torn down as a result.
    pub async fn leave(
        &self,
        room: &RoomData,
        member: &MemberData,
    ) -> Result<bool, MembershipError> {
        if room.is_host(member.user_id) {
            let others = self
                .database
                .count_members(room.id, MemberFilter::joined().excluding(member.user_id))
                .await?;

            if others > 0 {
                return Err(MembershipError::HostMustTransfer);
            }
        }

        self.database
            .update_member(
                member.id,
                MemberPatch {
                    status: Some(MemberStatus::Left),
                    is_connected: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        info!("User {} left room {}", member.user_id, room.id);
        self.teardown_if_empty(room.id).await
    }

    /// Removes a member for good. Returns true if the room was torn down as a result.
    pub async fn kick(
        &self,
        room: &RoomData,
        actor: UserId,
        user_id: UserId,
    ) -> Result<bool, MembershipError> {
        if !room.allows(actor, Action::Kick) {
            return Err(MembershipError::PermissionDenied(Action::Kick));
        }

        if user_id == actor {
            return Err(MembershipError::InvalidTarget("cannot kick yourself"));
        }

        if room.is_host(user_id) {
            return Err(MembershipError::InvalidTarget("cannot kick the host"));
        }

        let member = self
            .database
            .member_by_user(room.id, user_id)
            .await
            .found()?
            .ok_or(MembershipError::NotMember)?;

        self.database.delete_member(member.id).await?;

        info!("User {} kicked user {} from room {}", actor, user_id, room.id);
        self.teardown_if_empty(room.id).await
    }

    pub async fn transfer_host(
        &self,
        room: &RoomData,
        actor: UserId,
        new_host_id: UserId,
    ) -> Result<RoomData, MembershipError> {
        if !room.allows(actor, Action::TransferHost) {
            return Err(MembershipError::PermissionDenied(Action::TransferHost));
        }

        if new_host_id == actor {
            return Err(MembershipError::InvalidTarget("already the host"));
        }

        let target = self
            .database
            .member_by_user(room.id, new_host_id)
            .await
            .found()?;

        if target.map(|m| m.status) != Some(MemberStatus::Joined) {
            return Err(MembershipError::InvalidTarget(
                "the new host must be a joined member",
            ));
        }

        let room = self
            .database
            .update_room(room.id, RoomPatch::host(new_host_id))
            .await?;

        info!("Room {} is now hosted by user {}", room.id, new_host_id);
        Ok(room)
    }

    pub async fn update_permissions(
        &self,
        room: &RoomData,
        actor: UserId,
        permissions: Permissions,
    ) -> Result<RoomData, MembershipError> {
        if !room.allows(actor, Action::UpdatePermissions) {
            return Err(MembershipError::PermissionDenied(
                Action::UpdatePermissions,
            ));
        }

        let room = self
            .database
            .update_room(
                room.id,
                RoomPatch {
                    playback_control: Some(permissions.playback_control),
                    load_movies: Some(permissions.load_movies),
                    invite_users: Some(permissions.invite_users),
                    ..Default::default()
                },
            )
            .await?;

        Ok(room)
    }

    /// Tells a kick apart from a room teardown after a member row was deleted.
    ///
    /// Deletes carry no row, so both the membership and the room are queried.
    pub async fn check_removal(
        &self,
        room_id: PrimaryKey,
        user_id: UserId,
    ) -> Result<Removal, MembershipError> {
        if let Some(member) = self
            .database
            .member_by_user(room_id, user_id)
            .await
            .found()?
        {
            return Ok(Removal::Present(member));
        }

        let room = self.database.room_by_id(room_id).await.found()?;

        Ok(match room {
            Some(_) => Removal::Kicked,
            None => Removal::RoomClosed,
        })
    }

    /// Deletes the room if nobody is joined anymore. Must run after the member write commits.
    pub async fn teardown_if_empty(&self, room_id: PrimaryKey) -> Result<bool, MembershipError> {
        let joined = self
            .database
            .count_members(room_id, MemberFilter::joined())
            .await?;

        if joined > 0 {
            return Ok(false);
        }

        match self.database.delete_room(room_id).await {
            Ok(()) => info!("Room {} is empty and was deleted", room_id),
            // Another client got there first
            Err(e) if e.is_not_found() => warn!("Room {} was already deleted", room_id),
            Err(e) => return Err(e.into()),
        }

        Ok(true)
    }

    /// Leaves any other room the user is currently present in.
    ///
    /// Returns the ids of the rooms that were left.
    pub async fn switch_room(
        &self,
        user_id: UserId,
        target_room_id: PrimaryKey,
    ) -> Result<Vec<PrimaryKey>, MembershipError> {
        let memberships = self.database.memberships_by_user(user_id).await?;
        let mut left = vec![];

        for member in memberships {
            let present = member.status == MemberStatus::Joined && member.is_connected;

            if member.room_id == target_room_id || !present {
                continue;
            }

            let Some(room) = self.database.room_by_id(member.room_id).await.found()? else {
                continue;
            };

            self.leave(&room, &member).await?;
            left.push(room.id);
        }

        Ok(left)
    }

    /// Lists the rooms a user is invited to or joined, newest membership first.
    pub async fn rooms_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<RoomSummary>, MembershipError> {
        let memberships = self.database.memberships_by_user(user_id).await?;
        let mut summaries = vec![];

        for membership in memberships.into_iter().rev() {
            if membership.status == MemberStatus::Left {
                continue;
            }

            let Some(room) = self
                .database
                .room_by_id(membership.room_id)
                .await
                .found()?
            else {
                continue;
            };

            let member_count = self
                .database
                .count_members(room.id, MemberFilter::default())
                .await?;
            let present_count = self
                .database
                .count_members(room.id, MemberFilter::present())
                .await?;

            summaries.push(RoomSummary {
                room,
                membership,
                member_count,
                present_count,
            });
        }

        Ok(summaries)
    }

    /// The members who are joined and connected
    pub async fn roster(&self, room_id: PrimaryKey) -> Result<Vec<MemberData>, MembershipError> {
        let members = self
            .database
            .list_members(room_id, MemberFilter::present())
            .await?;

        Ok(members)
    }
}
