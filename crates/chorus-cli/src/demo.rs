//! A whole room in one process: memory directory, local signaling hub and
//! loopback media.

use std::sync::Arc;
use std::time::Duration;

use chorus_common::{ChorusError, RoomError};
use chorus_live::{
    Identity, LocalSignalingHub, LoopbackTransport, MemoryDirectory, ParticipantDirectory, Role,
    Room, RoomConfig, RoomHandle, RoomServices, RoomStatus,
};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::events;

const ROOM_ID: &str = "demo-room";

struct Backends {
    directory: Arc<MemoryDirectory>,
    hub: LocalSignalingHub,
    transport: LoopbackTransport,
}

impl Backends {
    fn services(&self) -> RoomServices {
        RoomServices {
            directory: self.directory.clone(),
            signaling: Arc::new(self.hub.endpoint()),
            transport: Arc::new(self.transport.clone()),
        }
    }

    async fn open(&self, profile: &str, config: &RoomConfig) -> Result<RoomHandle, RoomError> {
        let (handle, room_events) = RoomHandle::open(
            ROOM_ID,
            Identity::local(profile, profile),
            self.services(),
            config.clone(),
        )
        .await?;
        tokio::spawn(events::print(profile.to_string(), room_events));
        Ok(handle)
    }
}

pub async fn run(
    config: RoomConfig,
    speakers: usize,
    listeners: usize,
    duration: Duration,
) -> Result<(), ChorusError> {
    let backends = Backends {
        directory: Arc::new(MemoryDirectory::new()),
        hub: LocalSignalingHub::new(),
        transport: LoopbackTransport::new(),
    };
    let mut room = Room::new(ROOM_ID, "Chorus demo", speakers.max(1) as u32);
    room.status = RoomStatus::Live;
    backends.directory.create_room(room).await;
    backends
        .directory
        .write_join(ROOM_ID, "host", Role::Host)
        .await?;

    let host = backends.open("host", &config).await?;
    let host_track = loop {
        if host.view().await?.muted.is_some() {
            break backends.transport.last_track();
        }
        time::sleep(Duration::from_millis(50)).await;
    };

    let mut members = Vec::new();
    for n in 1..=speakers {
        let handle = backends.open(&format!("speaker-{n}"), &config).await?;
        let role = handle.join(Role::Speaker).await?;
        info!(profile = %format!("speaker-{n}"), %role, "Demo member joined");
        members.push(handle);
    }
    for n in 1..=listeners {
        let handle = backends.open(&format!("listener-{n}"), &config).await?;
        handle.join(Role::Listener).await?;
        members.push(handle);
    }

    // Allow for one full retry round.
    let deadline = Instant::now() + config.negotiation_timeout * (config.max_retries + 1);
    let view = loop {
        let view = host.view().await?;
        if view.connected_links() >= speakers || Instant::now() >= deadline {
            break view;
        }
        time::sleep(Duration::from_millis(100)).await;
    };
    events::print_links("host", &view);
    if view.connected_links() < speakers {
        warn!(
            connected = view.connected_links(),
            expected = speakers,
            "Mesh incomplete"
        );
    }

    if let Some(track) = &host_track {
        track.set_level(0.3);
        time::sleep(duration).await;
        track.set_level(0.0);
        time::sleep(Duration::from_secs(1)).await;
    }

    for member in &members {
        member.leave().await?;
        member.shutdown().await?;
    }
    host.leave().await?;
    host.shutdown().await?;
    println!(
        "{} connections still open",
        backends.transport.open_connections()
    );
    Ok(())
}
