use chorus_common::RoomError;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::actor::{Command, Reply, RoomActor};
use super::state::RoomState;
use super::types::{RoomConfig, RoomEvent, RoomView};
use super::RoomServices;
use crate::directory::Role;
use crate::identity::Identity;
use crate::media::RemoteStream;

/// Cloneable handle to a room actor.
///
/// Every method is a message round-trip; the actor answers once the
/// operation is accepted or rejected. Dropping the last handle shuts the
/// actor down.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    commands: mpsc::Sender<Command>,
}

impl RoomHandle {
    /// Subscribe to `room_id`, wait for its first snapshot and start the
    /// actor. Returns the handle and the room's event stream.
    ///
    /// A live row the local profile already holds is adopted as the current
    /// membership.
    pub async fn open(
        room_id: &str,
        identity: Identity,
        services: RoomServices,
        config: RoomConfig,
    ) -> Result<(Self, mpsc::Receiver<RoomEvent>), RoomError> {
        let mut snapshots = services.directory.subscribe_room(room_id).await?;
        let first = snapshots.recv().await.ok_or_else(|| {
            RoomError::DirectoryReadFailed(format!("no snapshot for room {room_id}"))
        })?;
        let (state, initial) = RoomState::new(&identity.profile_id, first);
        info!(room_id, profile_id = %identity.profile_id, "Opening room");

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let actor = RoomActor::new(
            room_id, identity, config, services, state, snapshots, command_rx, event_tx,
        );
        tokio::spawn(actor.run(initial));

        Ok((
            Self {
                room_id: room_id.to_string(),
                commands: command_tx,
            },
            event_rx,
        ))
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RoomError::ActorStopped)?;
        rx.await.map_err(|_| RoomError::ActorStopped)?
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RoomError::ActorStopped)?;
        rx.await.map_err(|_| RoomError::ActorStopped)
    }

    /// Join as listener, speaker or viewer. Resolves with the role written,
    /// which is `Listener` when a speaker's microphone was denied. A second
    /// join while one is in flight resolves with the first.
    pub async fn join(&self, role: Role) -> Result<Role, RoomError> {
        self.call(|reply| Command::Join { role, reply }).await
    }

    /// Leave the room. Local media and peer links are released before the
    /// directory write; leaving while absent succeeds without a write.
    pub async fn leave(&self) -> Result<(), RoomError> {
        self.call(|reply| Command::Leave { reply }).await
    }

    /// Returns the requested state once it is persisted. On failure the
    /// track is restored unless a newer request superseded this one.
    pub async fn set_muted(&self, muted: bool) -> Result<bool, RoomError> {
        self.call(|reply| Command::SetMuted {
            muted: Some(muted),
            reply,
        })
        .await
    }

    pub async fn toggle_mute(&self) -> Result<bool, RoomError> {
        self.call(|reply| Command::SetMuted { muted: None, reply })
            .await
    }

    pub async fn request_to_speak(&self) -> Result<(), RoomError> {
        self.call(|reply| Command::RequestToSpeak { reply }).await
    }

    /// Host only: grant a viewer's pending request to speak.
    pub async fn promote(&self, profile_id: &str) -> Result<(), RoomError> {
        let profile_id = profile_id.to_string();
        self.call(|reply| Command::Promote { profile_id, reply })
            .await
    }

    /// Host only: make a viewer a speaker without a request.
    pub async fn invite(&self, profile_id: &str) -> Result<(), RoomError> {
        let profile_id = profile_id.to_string();
        self.call(|reply| Command::Invite { profile_id, reply })
            .await
    }

    pub async fn remote_stream(&self, participant_id: &str) -> Result<Option<RemoteStream>, RoomError> {
        let participant_id = participant_id.to_string();
        self.query(|reply| Command::RemoteStream {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn view(&self) -> Result<RoomView, RoomError> {
        self.query(|reply| Command::View { reply }).await
    }

    /// Stop the actor, releasing media and links. No leave is written, so
    /// a later `open` for the same profile resumes the membership.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.query(|reply| Command::Shutdown { reply }).await
    }
}
