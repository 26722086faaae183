//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# chorus configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[supabase]
# project_ref = ""           # <ref>.supabase.co
# api_key = ""               # publishable anon key
# access_token = ""          # optional user JWT
# heartbeat_interval = 25    # seconds, 5-60
# reconnect_delay = 1        # seconds
# max_reconnect_delay = 30   # seconds

[directory]
# schema = "public"
# rooms_table = "live_rooms"
# participants_table = "live_room_participants"
# speak_requests_table = "live_room_speak_requests"

[negotiation]
# timeout_ms = 15000         # 1000-120000, per attempt
# max_retries = 1            # 0-5, retries swap the offerer

[speaking]
# sample_interval_ms = 100   # 10-1000
# threshold = 0.02           # 0.0-1.0 audio level
# attack_samples = 2         # loud samples before speaking starts
# release_samples = 8        # quiet samples before speaking stops (> attack)
# heartbeat_interval_ms = 2000
# persist_interval_ms = 1000
# stale_after_ms = 6000      # > heartbeat_interval_ms

[signaling]
# resubscribe_base_ms = 500
# resubscribe_max_ms = 30000

[logging]
# level = "info"             # debug, info, warn, error
"##
    .to_string()
}
