//! Validation for the room core sections: negotiation, speaking,
//! signaling and supabase.

use std::fmt::Display;
use std::ops::RangeInclusive;

use crate::schema::ChorusConfig;

/// Record `key` when `value` falls outside `allowed`.
fn check_range<T: PartialOrd + Display>(
    errors: &mut Vec<String>,
    key: &str,
    value: T,
    allowed: RangeInclusive<T>,
) {
    if !allowed.contains(&value) {
        errors.push(format!(
            "{key} must be between {} and {}, got {value}",
            allowed.start(),
            allowed.end()
        ));
    }
}

/// Record `later` when it is not strictly greater than `earlier`.
fn check_after(errors: &mut Vec<String>, later: (&str, u64), earlier: (&str, u64)) {
    if later.1 <= earlier.1 {
        errors.push(format!(
            "{} = {} must be greater than {} = {}",
            later.0, later.1, earlier.0, earlier.1
        ));
    }
}

pub(crate) fn validate_negotiation(errors: &mut Vec<String>, config: &ChorusConfig) {
    let negotiation = &config.negotiation;
    check_range(
        errors,
        "negotiation.timeout_ms",
        negotiation.timeout_ms,
        1_000..=120_000,
    );
    check_range(errors, "negotiation.max_retries", negotiation.max_retries, 0..=5);
}

/// Detector bounds plus the hysteresis rule: speech must take longer to
/// end than to start.
pub(crate) fn validate_speaking(errors: &mut Vec<String>, config: &ChorusConfig) {
    let speaking = &config.speaking;
    check_range(
        errors,
        "speaking.sample_interval_ms",
        speaking.sample_interval_ms,
        10..=1_000,
    );
    check_range(errors, "speaking.threshold", speaking.threshold, 0.0..=1.0);
    check_range(errors, "speaking.attack_samples", speaking.attack_samples, 1..=50);
    check_range(errors, "speaking.release_samples", speaking.release_samples, 1..=100);
    check_after(
        errors,
        ("speaking.release_samples", u64::from(speaking.release_samples)),
        ("speaking.attack_samples", u64::from(speaking.attack_samples)),
    );
    check_range(
        errors,
        "speaking.heartbeat_interval_ms",
        speaking.heartbeat_interval_ms,
        250..=30_000,
    );
    check_range(
        errors,
        "speaking.persist_interval_ms",
        speaking.persist_interval_ms,
        100..=60_000,
    );
    check_after(
        errors,
        ("speaking.stale_after_ms", speaking.stale_after_ms),
        ("speaking.heartbeat_interval_ms", speaking.heartbeat_interval_ms),
    );
}

pub(crate) fn validate_signaling(errors: &mut Vec<String>, config: &ChorusConfig) {
    let signaling = &config.signaling;
    check_range(
        errors,
        "signaling.resubscribe_base_ms",
        signaling.resubscribe_base_ms,
        50..=10_000,
    );
    if signaling.resubscribe_max_ms < signaling.resubscribe_base_ms {
        errors.push(format!(
            "signaling.resubscribe_max_ms = {} is below signaling.resubscribe_base_ms = {}",
            signaling.resubscribe_max_ms, signaling.resubscribe_base_ms
        ));
    }
}

pub(crate) fn validate_supabase(errors: &mut Vec<String>, config: &ChorusConfig) {
    let supabase = &config.supabase;
    check_range(
        errors,
        "supabase.heartbeat_interval",
        supabase.heartbeat_interval,
        5..=60,
    );
    if supabase.max_reconnect_delay < supabase.reconnect_delay {
        errors.push(format!(
            "supabase.max_reconnect_delay = {} is below supabase.reconnect_delay = {}",
            supabase.max_reconnect_delay, supabase.reconnect_delay
        ));
    }
}
