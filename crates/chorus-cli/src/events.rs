use chorus_live::{RoomEvent, RoomView};
use tokio::sync::mpsc;

/// One line per event.
pub fn describe(event: &RoomEvent) -> String {
    match event {
        RoomEvent::RoomUpdated {
            room,
            participants,
            speak_requests,
        } => format!(
            "room {} ({}): {} present, {} speakers, {} listeners, {} viewers, {} requests",
            room.title,
            room.status,
            participants.len(),
            room.speaker_count,
            room.listener_count,
            room.viewer_count,
            speak_requests.len()
        ),
        RoomEvent::RemoteStream {
            participant_id,
            stream,
        } => format!("audio from {participant_id} ({})", stream.stream_id),
        RoomEvent::RemoteStreamRemoved { participant_id } => {
            format!("audio from {participant_id} stopped")
        }
        RoomEvent::SpeakingChanged {
            participant_id,
            speaking: true,
        } => format!("{participant_id} is speaking"),
        RoomEvent::SpeakingChanged { participant_id, .. } => {
            format!("{participant_id} went quiet")
        }
        RoomEvent::ConnectionDegraded {
            participant_id,
            error,
        } => format!("link to {participant_id} degraded: {error}"),
        RoomEvent::LocalRoleChanged { role: Some(role) } => format!("now {role}"),
        RoomEvent::LocalRoleChanged { role: None } => "left the room".into(),
        RoomEvent::SignalingUnavailable { reason } => format!("signaling lost: {reason}"),
        RoomEvent::SignalingRestored => "signaling restored".into(),
        RoomEvent::RoomEnded => "room ended".into(),
        RoomEvent::Error(error) => format!("error: {error}"),
    }
}

/// Print a room's events prefixed with `name` until the stream closes.
pub async fn print(name: String, mut events: mpsc::Receiver<RoomEvent>) {
    while let Some(event) = events.recv().await {
        println!("[{name}] {}", describe(&event));
    }
}

/// Mesh table of one client's view.
pub fn print_links(name: &str, view: &RoomView) {
    println!(
        "[{name}] session {}: {} links, {} connected",
        view.session_tag.as_deref().unwrap_or("-"),
        view.links.len(),
        view.connected_links()
    );
    for link in &view.links {
        println!(
            "    {:<12} {:<36} {:?} attempt {} as {:?}{}",
            link.profile_id,
            link.participant_id,
            link.state,
            link.attempt,
            link.role,
            if link.has_stream { ", receiving" } else { "" }
        );
    }
}
