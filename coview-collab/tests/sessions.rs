use std::{sync::Arc, time::Duration};

use coview_collab::{
    ChangeEvent, ClientError, Collab, CollabEvent, Database, MemberStatus, MembershipError,
    MemoryDatabase, Permission, Permissions, PrimaryKey, RoomHandle, RowChange, SessionEnd, UserId,
};
use coview_core::{engine_channel, Introspect, PlaybackEngine, SyncConfig};
use coview_impls::ClockEngine;
use tokio::time::{sleep, timeout};

const HOST: UserId = 1;
const GUEST: UserId = 2;
const VIDEO: &str = "https://example.com/movie.mp4";

struct Client {
    engine: Arc<ClockEngine>,
    handle: RoomHandle,
}

fn collab() -> Collab<MemoryDatabase> {
    Collab::new(MemoryDatabase::new(), SyncConfig::default())
}

async fn room(collab: &Collab<MemoryDatabase>) -> PrimaryKey {
    collab
        .create_room("Movie night", HOST, Permissions::default(), &[GUEST])
        .await
        .unwrap()
        .id
}

async fn attach(
    collab: &Collab<MemoryDatabase>,
    room_id: PrimaryKey,
    user_id: UserId,
    rate: f64,
) -> Client {
    let (sender, receiver) = engine_channel();
    let engine = Arc::new(ClockEngine::new(sender).with_rate(rate));

    let handle = collab
        .enter(room_id, user_id, engine.clone(), receiver)
        .await
        .unwrap();

    Client { engine, handle }
}

/// Lets every client catch up, past the damping window.
async fn settle() {
    sleep(Duration::from_secs(1)).await;
}

fn drain(handle: &RoomHandle) -> Vec<CollabEvent> {
    handle.events().try_iter().collect()
}

#[tokio::test(start_paused = true)]
async fn seek_reaches_a_drifted_member() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    // Runs slow enough to fall more than a second behind over two minutes
    let guest = attach(&collab, room_id, GUEST, 0.98).await;
    settle().await;

    host.handle.load_video(VIDEO).await.unwrap();
    settle().await;
    assert_eq!(guest.engine.source().as_deref(), Some(VIDEO));

    host.engine.play();
    settle().await;
    assert!(!guest.engine.is_paused());

    sleep(Duration::from_secs(120)).await;
    let behind = host.engine.current_time() - guest.engine.current_time();
    assert!(behind > 1.0);

    let guest_seeks = guest.engine.introspect().seeks;
    host.engine.seek(200.);
    settle().await;

    let introspection = guest.engine.introspect();
    assert_eq!(introspection.seeks, guest_seeks + 1);
    assert!(!introspection.paused);
    assert!((introspection.position - 200.).abs() < 1.5);

    let room = collab.database().room_by_id(room_id).await.unwrap();
    assert_eq!(room.video_timestamp, 200.);
    assert!(room.is_playing);

    // The host only ever seeked once, its own echo was ignored
    assert_eq!(host.engine.introspect().seeks, 1);
}

#[tokio::test(start_paused = true)]
async fn member_seek_reaches_the_host() {
    let collab = collab();
    let permissions = Permissions {
        playback_control: Permission::Everyone,
        ..Default::default()
    };
    let room_id = collab
        .create_room("Open controls", HOST, permissions, &[GUEST])
        .await
        .unwrap()
        .id;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    host.handle.load_video(VIDEO).await.unwrap();
    settle().await;
    host.engine.play();
    settle().await;
    assert!(!guest.engine.is_paused());

    guest.engine.seek(200.);
    settle().await;

    let room = collab.database().room_by_id(room_id).await.unwrap();
    assert_eq!(room.video_timestamp, 200.);
    assert!(room.is_playing);

    assert!(!guest.engine.is_paused());
    assert!(!host.engine.is_paused());
    assert!((host.engine.current_time() - 200.).abs() < 1.5);
}

#[tokio::test(start_paused = true)]
async fn kick_is_noticed_after_a_store_blip() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    let room = collab.database().room_by_id(room_id).await.unwrap();
    collab.membership.kick(&room, HOST, GUEST).await.unwrap();

    // Both clients check their membership while the store is unreachable
    collab.database().set_offline(true);
    sleep(Duration::from_millis(10)).await;
    collab.database().set_offline(false);

    let end = timeout(Duration::from_secs(60), guest.handle.closed()).await;
    assert_eq!(end.unwrap(), SessionEnd::Kicked);

    settle().await;
    assert!(collab
        .database()
        .member_by_user(room_id, HOST)
        .await
        .is_ok());
    assert!(drain(&host.handle)
        .iter()
        .all(|e| !matches!(e, CollabEvent::Kicked { .. } | CollabEvent::RoomClosed { .. })));
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_detaches_after_removal() {
    let collab = collab();
    let room_id = room(&collab).await;

    let _host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    let room = collab.database().room_by_id(room_id).await.unwrap();
    collab.membership.kick(&room, HOST, GUEST).await.unwrap();
    collab.database().set_offline(true);

    let end = timeout(Duration::from_secs(60), guest.handle.closed()).await;
    assert_eq!(end.unwrap(), SessionEnd::Detached);

    collab.database().set_offline(false);
}

#[tokio::test(start_paused = true)]
async fn kicked_member_is_told_and_room_survives() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    let guest_events = guest.handle.events().clone();
    host.handle.kick(GUEST).await.unwrap();

    assert_eq!(guest.handle.closed().await, SessionEnd::Kicked);
    assert!(guest_events
        .try_iter()
        .any(|e| matches!(e, CollabEvent::Kicked { .. })));

    settle().await;
    assert!(collab.database().room_by_id(room_id).await.is_ok());

    let roster = drain(&host.handle)
        .into_iter()
        .filter_map(|e| match e {
            CollabEvent::RosterUpdate { members, .. } => Some(members),
            _ => None,
        })
        .last()
        .unwrap();

    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].user_id, HOST);
}

#[tokio::test(start_paused = true)]
async fn host_leaves_last() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    let result = host.handle.leave().await;
    assert!(matches!(
        result,
        Err(ClientError::Membership(MembershipError::HostMustTransfer))
    ));

    guest.handle.leave().await.unwrap();
    assert_eq!(guest.handle.closed().await, SessionEnd::Left);
    assert!(collab.database().room_by_id(room_id).await.is_ok());
    settle().await;

    host.handle.leave().await.unwrap();
    assert_eq!(host.handle.closed().await, SessionEnd::Left);

    let room = collab.database().room_by_id(room_id).await;
    assert!(room.unwrap_err().is_not_found());
}

#[tokio::test(start_paused = true)]
async fn transferred_host_can_be_left_behind() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    host.handle.transfer_host(GUEST).await.unwrap();
    settle().await;

    assert!(drain(&guest.handle).contains(&CollabEvent::HostChanged {
        room_id,
        host_id: GUEST,
        is_local_host: true,
    }));

    host.handle.leave().await.unwrap();
    assert_eq!(host.handle.closed().await, SessionEnd::Left);

    let room = collab.database().room_by_id(room_id).await.unwrap();
    assert_eq!(room.host_id, GUEST);
}

#[tokio::test(start_paused = true)]
async fn local_play_is_written_once() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    settle().await;
    host.handle.load_video(VIDEO).await.unwrap();
    settle().await;

    let mut observer = collab.database().subscribe(room_id).await.unwrap();

    host.engine.play();
    settle().await;

    let mut room_writes = 0;
    while let Some(change) = observer.try_next() {
        if matches!(change, ChangeEvent::Room(RowChange::Update(_))) {
            room_writes += 1;
        }
    }

    assert_eq!(room_writes, 1);
    assert_eq!(host.engine.introspect().plays, 1);
    assert!(!host.engine.is_paused());
}

#[tokio::test(start_paused = true)]
async fn deleted_room_is_not_a_kick() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    let guest_events = guest.handle.events().clone();
    collab.database().delete_room(room_id).await.unwrap();

    assert_eq!(guest.handle.closed().await, SessionEnd::RoomClosed);
    assert_eq!(host.handle.closed().await, SessionEnd::RoomClosed);

    let events: Vec<_> = guest_events.try_iter().collect();
    assert!(events.contains(&CollabEvent::RoomClosed { room_id }));
    assert!(!events.contains(&CollabEvent::Kicked { room_id }));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_handle_disconnects() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    drop(guest);
    settle().await;

    let member = collab
        .database()
        .member_by_user(room_id, GUEST)
        .await
        .unwrap();
    assert_eq!(member.status, MemberStatus::Joined);
    assert!(!member.is_connected);
    assert!(member.last_disconnected.is_some());

    let summaries = collab.rooms_for_user(HOST).await.unwrap();
    assert_eq!(summaries[0].present_count, 1);
    assert_eq!(summaries[0].member_count, 2);

    drop(host);
}

#[tokio::test(start_paused = true)]
async fn late_joiner_buffers_then_pauses_the_room() {
    let collab = collab();
    let room_id = room(&collab).await;

    let host = attach(&collab, room_id, HOST, 1.0).await;
    settle().await;
    host.handle.load_video(VIDEO).await.unwrap();
    settle().await;
    host.engine.play();
    settle().await;

    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    assert!(guest.engine.is_paused());
    assert!(drain(&guest.handle)
        .iter()
        .any(|e| matches!(e, CollabEvent::JoinSyncStarted { .. })));

    sleep(Duration::from_secs(5)).await;
    settle().await;

    assert!(!guest.engine.is_paused());
    assert!(drain(&guest.handle).contains(&CollabEvent::JoinSyncCompleted { room_id }));

    let room = collab.database().room_by_id(room_id).await.unwrap();
    assert!(!room.is_playing);
    assert!(host.engine.is_paused());
}

#[tokio::test(start_paused = true)]
async fn members_need_permission_to_load() {
    let collab = collab();
    let room_id = room(&collab).await;

    let _host = attach(&collab, room_id, HOST, 1.0).await;
    let guest = attach(&collab, room_id, GUEST, 1.0).await;
    settle().await;

    let result = guest.handle.load_video(VIDEO).await;

    assert!(matches!(result, Err(ClientError::Sync(_))));
    assert_eq!(
        collab
            .database()
            .room_by_id(room_id)
            .await
            .unwrap()
            .current_video_url,
        None
    );
}
