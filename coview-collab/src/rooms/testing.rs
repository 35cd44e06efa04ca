use std::sync::Arc;

use chrono::Utc;
use coview_core::{engine_channel, EngineEventReceiver};
use coview_impls::ClockEngine;

use crate::{
    Database, MemberData, MemberStatus, MemoryDatabase, NewMember, NewRoom, Permissions,
    RoomData, UserId,
};

pub const HOST: UserId = 1;
pub const GUEST: UserId = 2;
pub const VIDEO: &str = "https://example.com/movie.mp4";

/// A room hosted by [HOST] with [GUEST] joined, neither needing a sync.
pub async fn seeded_room(database: &MemoryDatabase) -> (RoomData, MemberData, MemberData) {
    let room = database
        .create_room(NewRoom {
            name: "Movie night".to_string(),
            host_id: HOST,
            permissions: Permissions::default(),
        })
        .await
        .unwrap();

    let mut members = vec![];

    for user_id in [HOST, GUEST] {
        let member = database
            .create_member(NewMember {
                room_id: room.id,
                user_id,
                status: MemberStatus::Joined,
                is_connected: true,
                joined_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        members.push(member);
    }

    let guest = members.remove(1);
    let host = members.remove(0);

    (room, host, guest)
}

pub fn clock_engine() -> (Arc<ClockEngine>, EngineEventReceiver) {
    let (sender, receiver) = engine_channel();
    (Arc::new(ClockEngine::new(sender)), receiver)
}

