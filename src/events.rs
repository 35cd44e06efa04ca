use colored::Colorize;
use coview_collab::{CollabEvent, EventReceiver};
use log::{info, warn};
use tokio::task::spawn_blocking;

/// Logs the events of a room client until its session ends.
pub async fn watch_events(name: &'static str, receiver: EventReceiver) {
    loop {
        let receiver = receiver.clone();

        let event = match spawn_blocking(move || receiver.recv()).await {
            Ok(Ok(event)) => event,
            // The client dropped its sender, nothing more will arrive
            Ok(Err(_)) => break,
            Err(error) => {
                warn!("Event watcher for {} stopped: {}", name, error);
                break;
            }
        };

        log_event(name, &event);
    }
}

fn log_event(name: &str, event: &CollabEvent) {
    let name = name.bold();

    match event {
        CollabEvent::RosterUpdate { members, .. } => {
            let users: Vec<_> = members.iter().map(|m| m.user_id).collect();
            info!("{} sees {} present: {:?}", name, users.len(), users);
        }
        CollabEvent::HostChanged {
            host_id,
            is_local_host,
            ..
        } => {
            if *is_local_host {
                info!("{} is now {}", name, "the host".bright_yellow());
            } else {
                info!("{} sees user {} become host", name, host_id);
            }
        }
        CollabEvent::PermissionDenied { action, .. } => {
            warn!("{} may not {}", name, action.to_string().red());
        }
        CollabEvent::PlaybackError { error, .. } => {
            warn!("{} could not play: {}", name, error.red());
        }
        CollabEvent::JoinSyncStarted { position, .. } => {
            info!(
                "{} is catching up at {}",
                name,
                format!("{:.1}s", position).cyan()
            );
        }
        CollabEvent::JoinSyncCompleted { .. } => {
            info!("{} {}", name, "caught up".bright_green());
        }
        CollabEvent::Kicked { room_id } => {
            info!("{} was {} from room {}", name, "kicked".red(), room_id);
        }
        CollabEvent::RoomClosed { room_id } => {
            info!("{} saw room {} close", name, room_id);
        }
    }
}
