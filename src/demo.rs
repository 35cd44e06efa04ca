use std::{sync::Arc, time::Duration};

use colored::Colorize;
use coview_collab::{Collab, Database, Permissions, PrimaryKey, RoomHandle, UserId};
use coview_core::{engine_channel, Introspect, PlaybackEngine};
use coview_impls::ClockEngine;
use log::info;
use tokio::time::sleep;

use crate::events::watch_events;

const HOST: UserId = 1;
const GUEST: UserId = 2;
const LATECOMER: UserId = 3;

const VIDEO: &str = "https://media.example.com/big-buck-bunny.mp4";

struct Viewer {
    name: &'static str,
    engine: Arc<ClockEngine>,
    handle: RoomHandle,
}

/// Plays out a watch party between three users on clock engines.
pub async fn run<Db>(collab: Collab<Db>) -> anyhow::Result<()>
where
    Db: Database,
{
    let room = collab
        .create_room("Movie night", HOST, Permissions::default(), &[GUEST])
        .await?;

    info!("Created room {} ({})", room.name.bold(), room.id);

    let host = attach(&collab, room.id, HOST, "host", 1.0).await?;
    // Slightly slow, so drift shows up after a while
    let guest = attach(&collab, room.id, GUEST, "guest", 0.99).await?;
    settle(&collab).await;

    host.handle.load_video(VIDEO).await?;
    settle(&collab).await;

    info!("Host presses play");
    host.engine.play();
    sleep(Duration::from_secs(3)).await;
    report(&[&host, &guest]);

    info!("Host seeks to one minute");
    host.engine.seek(60.);
    settle(&collab).await;
    report(&[&host, &guest]);

    host.handle.invite(LATECOMER).await?;
    let late = attach(&collab, room.id, LATECOMER, "latecomer", 1.0).await?;
    settle(&collab).await;
    report(&[&host, &guest, &late]);

    sleep(collab.config().join_grace_period).await;
    settle(&collab).await;
    report(&[&host, &guest, &late]);

    host.handle.kick(LATECOMER).await?;
    info!("Latecomer session ended: {:?}", late.handle.closed().await);

    guest.handle.leave().await?;
    info!("Guest session ended: {:?}", guest.handle.closed().await);
    settle(&collab).await;

    host.handle.leave().await?;
    info!("Host session ended: {:?}", host.handle.closed().await);

    let remaining = collab.rooms_for_user(HOST).await?;
    info!(
        "Host is a member of {} room(s) after everyone left",
        remaining.len()
    );

    Ok(())
}

async fn attach<Db>(
    collab: &Collab<Db>,
    room_id: PrimaryKey,
    user_id: UserId,
    name: &'static str,
    rate: f64,
) -> anyhow::Result<Viewer>
where
    Db: Database,
{
    let (sender, receiver) = engine_channel();
    let engine = Arc::new(ClockEngine::new(sender).with_rate(rate));

    let handle = collab
        .enter(room_id, user_id, engine.clone(), receiver)
        .await?;

    tokio::spawn(watch_events(name, handle.events().clone()));
    info!("{} entered room {}", name.bold(), room_id);

    Ok(Viewer {
        name,
        engine,
        handle,
    })
}

/// Waits for every client to apply the last change and release its lock.
async fn settle<Db>(collab: &Collab<Db>)
where
    Db: Database,
{
    sleep(collab.config().damping_window * 2).await;
}

fn report(viewers: &[&Viewer]) {
    for viewer in viewers {
        let state = viewer.engine.introspect();
        let status = if state.paused {
            "paused".yellow()
        } else {
            "playing".green()
        };

        info!(
            "{:>10} {:>7} {} ({} seeks)",
            viewer.name,
            format!("{:.1}s", state.position),
            status,
            state.seeks
        );
    }
}
