//! Conversions from the TOML schema to the runtime configs of `chorus-live`.

use std::time::Duration;

use chorus_config::ChorusConfig;
use chorus_live::realtime::RealtimeConfig;
use chorus_live::{RoomConfig, SupabaseDirectoryConfig};

pub fn room_config(config: &ChorusConfig) -> RoomConfig {
    let ms = Duration::from_millis;
    RoomConfig {
        negotiation_timeout: ms(config.negotiation.timeout_ms),
        max_retries: config.negotiation.max_retries,
        sample_interval: ms(config.speaking.sample_interval_ms),
        speaking_threshold: config.speaking.threshold as f32,
        attack_samples: config.speaking.attack_samples,
        release_samples: config.speaking.release_samples,
        heartbeat_interval: ms(config.speaking.heartbeat_interval_ms),
        persist_interval: ms(config.speaking.persist_interval_ms),
        stale_after: ms(config.speaking.stale_after_ms),
        resubscribe_base: ms(config.signaling.resubscribe_base_ms),
        resubscribe_max: ms(config.signaling.resubscribe_max_ms),
        ..RoomConfig::default()
    }
}

pub fn realtime_config(config: &ChorusConfig) -> RealtimeConfig {
    let supabase = &config.supabase;
    RealtimeConfig {
        project_ref: supabase.project_ref.clone(),
        api_key: supabase.api_key.clone(),
        access_token: supabase.access_token.clone(),
        heartbeat_interval_secs: supabase.heartbeat_interval,
        reconnect_delay_secs: supabase.reconnect_delay,
        max_reconnect_delay_secs: supabase.max_reconnect_delay,
    }
}

pub fn directory_config(config: &ChorusConfig) -> SupabaseDirectoryConfig {
    let directory = &config.directory;
    SupabaseDirectoryConfig {
        realtime: realtime_config(config),
        schema: directory.schema.clone(),
        rooms_table: directory.rooms_table.clone(),
        participants_table: directory.participants_table.clone(),
        speak_requests_table: directory.speak_requests_table.clone(),
    }
}
