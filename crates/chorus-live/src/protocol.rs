//! Signaling wire format for live rooms.
//!
//! Every message rides inside a Supabase Realtime broadcast (event
//! [`events::SIGNAL`]) as a JSON envelope:
//!
//! ```json
//! {"type": "offer", "from": "<participant>", "to": "<participant>|null",
//!  "payload": {...}, "ts": 1700000000000}
//! ```
//!
//! Offer and answer payloads carry the session description plus the
//! negotiation attempt it belongs to; ICE candidates carry the candidate,
//! its media-line index and the attempt; speaking status carries
//! `isSpeaking`. The transport envelope (Phoenix Channels protocol) is
//! handled by `realtime`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Broadcast event names
// ---------------------------------------------------------------------------

/// Event names used in Supabase Realtime broadcasts.
pub mod events {
    pub const SIGNAL: &str = "signal";
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown signal type: {0}")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Shared media types
// ---------------------------------------------------------------------------

/// An ICE candidate as produced by the media transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

// ---------------------------------------------------------------------------
// Typed messages
// ---------------------------------------------------------------------------

/// Message body, one variant per signal type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer { sdp: String, attempt: u32 },
    Answer { sdp: String, attempt: u32 },
    IceCandidate { candidate: IceCandidate, attempt: u32 },
    SpeakingStatus { is_speaking: bool },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
            SignalPayload::SpeakingStatus { .. } => "speaking-status",
        }
    }
}

/// A signaling message between the members of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    /// Sending participant id.
    pub from: String,
    /// Recipient participant id; `None` broadcasts to the whole room.
    pub to: Option<String>,
    pub payload: SignalPayload,
    /// Unix milliseconds at send time.
    pub ts: i64,
}

impl SignalingMessage {
    pub fn new(from: &str, to: Option<&str>, payload: SignalPayload) -> Self {
        Self {
            from: from.to_string(),
            to: to.map(str::to_string),
            payload,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn offer(from: &str, to: &str, sdp: String, attempt: u32) -> Self {
        Self::new(from, Some(to), SignalPayload::Offer { sdp, attempt })
    }

    pub fn answer(from: &str, to: &str, sdp: String, attempt: u32) -> Self {
        Self::new(from, Some(to), SignalPayload::Answer { sdp, attempt })
    }

    pub fn ice_candidate(from: &str, to: &str, candidate: IceCandidate, attempt: u32) -> Self {
        Self::new(
            from,
            Some(to),
            SignalPayload::IceCandidate { candidate, attempt },
        )
    }

    pub fn speaking_status(from: &str, is_speaking: bool) -> Self {
        Self::new(from, None, SignalPayload::SpeakingStatus { is_speaking })
    }

    /// Whether `participant_id` should act on this message.
    pub fn is_addressed_to(&self, participant_id: &str) -> bool {
        self.to.as_deref().map_or(true, |to| to == participant_id)
    }

    /// Encode into the JSON envelope.
    pub fn to_value(&self) -> serde_json::Value {
        let payload = match &self.payload {
            SignalPayload::Offer { sdp, attempt } | SignalPayload::Answer { sdp, attempt } => {
                serde_json::to_value(DescriptionPayload {
                    sdp: sdp.clone(),
                    attempt: *attempt,
                })
            }
            SignalPayload::IceCandidate { candidate, attempt } => {
                serde_json::to_value(CandidatePayload {
                    candidate: candidate.candidate.clone(),
                    sdp_mid: candidate.sdp_mid.clone(),
                    sdp_m_line_index: candidate.sdp_m_line_index,
                    attempt: *attempt,
                })
            }
            SignalPayload::SpeakingStatus { is_speaking } => {
                serde_json::to_value(SpeakingPayload {
                    is_speaking: *is_speaking,
                })
            }
        }
        .unwrap_or(serde_json::Value::Null);

        serde_json::json!({
            "type": self.payload.kind(),
            "from": self.from,
            "to": self.to,
            "payload": payload,
            "ts": self.ts,
        })
    }

    /// Decode a JSON envelope.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProtocolError> {
        let envelope: SignalEnvelope = serde_json::from_value(value)?;
        let payload = match envelope.kind.as_str() {
            "offer" => {
                let p: DescriptionPayload = decode("offer", envelope.payload)?;
                SignalPayload::Offer {
                    sdp: p.sdp,
                    attempt: p.attempt,
                }
            }
            "answer" => {
                let p: DescriptionPayload = decode("answer", envelope.payload)?;
                SignalPayload::Answer {
                    sdp: p.sdp,
                    attempt: p.attempt,
                }
            }
            "ice-candidate" => {
                let p: CandidatePayload = decode("ice-candidate", envelope.payload)?;
                SignalPayload::IceCandidate {
                    candidate: IceCandidate {
                        candidate: p.candidate,
                        sdp_mid: p.sdp_mid,
                        sdp_m_line_index: p.sdp_m_line_index,
                    },
                    attempt: p.attempt,
                }
            }
            "speaking-status" => {
                let p: SpeakingPayload = decode("speaking-status", envelope.payload)?;
                SignalPayload::SpeakingStatus {
                    is_speaking: p.is_speaking,
                }
            }
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };

        Ok(Self {
            from: envelope.from,
            to: envelope.to,
            payload,
            ts: envelope.ts,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SignalEnvelope {
    #[serde(rename = "type")]
    kind: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    ts: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DescriptionPayload {
    sdp: String,
    #[serde(default)]
    attempt: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePayload {
    candidate: String,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    sdp_m_line_index: Option<u32>,
    #[serde(default)]
    attempt: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeakingPayload {
    is_speaking: bool,
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    payload: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::MalformedPayload { kind, source })
}
