//! Observe a Supabase-backed room without transmitting.

use std::sync::Arc;

use chorus_common::{ChorusError, ConfigError};
use chorus_config::ChorusConfig;
use chorus_live::{
    Identity, LoopbackTransport, RealtimeSignaling, Role, RoomConfig, RoomHandle, RoomServices,
    SupabaseDirectory,
};
use tracing::info;

use crate::{events, settings};

pub async fn run(
    config: &ChorusConfig,
    room_config: RoomConfig,
    room_id: &str,
    profile_id: &str,
    role: Role,
) -> Result<(), ChorusError> {
    if !config.supabase.is_configured() {
        return Err(ConfigError::ValidationError(
            "supabase.project_ref and supabase.api_key are required for monitor".into(),
        )
        .into());
    }

    // No capture device here; any speaker intent is demoted to listener.
    let transport = LoopbackTransport::new();
    transport.deny_microphone(true);
    let services = RoomServices {
        directory: Arc::new(SupabaseDirectory::new(settings::directory_config(config))),
        signaling: Arc::new(RealtimeSignaling::new(settings::realtime_config(config))),
        transport: Arc::new(transport),
    };
    let identity = match &config.supabase.access_token {
        Some(token) => Identity::from_supabase_auth(profile_id.into(), profile_id.into(), token.clone()),
        None => Identity::local(profile_id, profile_id),
    };

    let (handle, room_events) = RoomHandle::open(room_id, identity, services, room_config).await?;
    let printer = tokio::spawn(events::print(profile_id.to_string(), room_events));
    let joined = handle.join(role).await?;
    info!(room_id, profile_id, role = %joined, "Monitoring room, Ctrl-C to leave");

    tokio::signal::ctrl_c().await?;
    info!(room_id, "Leaving");
    handle.leave().await?;
    handle.shutdown().await?;
    drop(handle);
    let _ = printer.await;
    Ok(())
}
