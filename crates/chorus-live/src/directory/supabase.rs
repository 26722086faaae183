//! Directory backed by a Supabase project.
//!
//! Reads and writes go through PostgREST. The change feed is a Realtime
//! channel subscribed to `postgres_changes` on the three directory tables,
//! filtered to one room; every change (or burst of changes) triggers a
//! refetch of the full snapshot, so subscribers always see whole, ordered
//! states rather than row deltas.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_common::RoomError;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::{Participant, Role, Room, RoomSnapshot};
use super::ParticipantDirectory;
use crate::realtime::{ChannelConfig, PostgresChangeFilter, RealtimeClient, RealtimeConfig, RealtimeEvent};

#[derive(Debug, Clone)]
pub struct SupabaseDirectoryConfig {
    pub realtime: RealtimeConfig,
    pub schema: String,
    pub rooms_table: String,
    pub participants_table: String,
    pub speak_requests_table: String,
}

impl Default for SupabaseDirectoryConfig {
    fn default() -> Self {
        Self {
            realtime: RealtimeConfig::default(),
            schema: "public".into(),
            rooms_table: "live_rooms".into(),
            participants_table: "live_room_participants".into(),
            speak_requests_table: "live_room_speak_requests".into(),
        }
    }
}

impl SupabaseDirectoryConfig {
    fn change_filters(&self, room_id: &str) -> Vec<PostgresChangeFilter> {
        let filter = |table: &str, column: &str| PostgresChangeFilter {
            schema: self.schema.clone(),
            table: table.to_string(),
            filter: Some(format!("{column}=eq.{room_id}")),
        };
        vec![
            filter(&self.rooms_table, "id"),
            filter(&self.participants_table, "room_id"),
            filter(&self.speak_requests_table, "room_id"),
        ]
    }
}

#[derive(Deserialize)]
struct SpeakRequestRow {
    profile_id: String,
}

#[derive(Clone)]
pub struct SupabaseDirectory {
    config: Arc<SupabaseDirectoryConfig>,
    http: reqwest::Client,
}

impl SupabaseDirectory {
    pub fn new(config: SupabaseDirectoryConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config: Arc::new(config),
            http,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.config.realtime.rest_url(), table)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        let realtime = &self.config.realtime;
        self.http
            .request(method, self.table_url(table))
            .header("apikey", &realtime.api_key)
            .header("Authorization", format!("Bearer {}", realtime.bearer()))
            .header("Accept-Profile", &self.config.schema)
            .header("Content-Profile", &self.config.schema)
    }

    /// Send and map transport or HTTP failures to a message.
    async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, String> {
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.chars().take(200).collect::<String>();
            return Err(format!("HTTP {status}: {text}"));
        }
        Ok(response)
    }

    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, RoomError> {
        let response = Self::send(self.request(reqwest::Method::GET, table).query(query))
            .await
            .map_err(RoomError::DirectoryReadFailed)?;
        response
            .json()
            .await
            .map_err(|e| RoomError::DirectoryReadFailed(e.to_string()))
    }

    /// Fetch the whole room state.
    pub async fn fetch_snapshot(&self, room_id: &str) -> Result<RoomSnapshot, RoomError> {
        let config = &self.config;
        let room_filter = format!("eq.{room_id}");

        let rooms: Vec<Room> = self
            .read(&config.rooms_table, &[("id", room_filter.clone())])
            .await?;
        let mut room = rooms
            .into_iter()
            .next()
            .ok_or_else(|| RoomError::DirectoryReadFailed(format!("no such room: {room_id}")))?;

        let participants: Vec<Participant> = self
            .read(
                &config.participants_table,
                &[
                    ("room_id", room_filter.clone()),
                    ("left_at", "is.null".to_string()),
                    ("order", "joined_at.asc".to_string()),
                ],
            )
            .await?;

        let requests: Vec<SpeakRequestRow> = self
            .read(
                &config.speak_requests_table,
                &[
                    ("room_id", room_filter),
                    ("select", "profile_id".to_string()),
                ],
            )
            .await?;

        room.recount(&participants);
        Ok(RoomSnapshot {
            room,
            participants,
            speak_requests: requests.into_iter().map(|r| r.profile_id).collect::<BTreeSet<_>>(),
        })
    }

    async fn patch_participant(
        &self,
        participant_id: &str,
        body: serde_json::Value,
    ) -> Result<(), RoomError> {
        let request = self
            .request(reqwest::Method::PATCH, &self.config.participants_table)
            .query(&[("id", format!("eq.{participant_id}"))])
            .json(&body);
        Self::send(request)
            .await
            .map(|_| ())
            .map_err(RoomError::DirectoryWriteFailed)
    }

    /// Forward refetched snapshots until the subscriber goes away.
    async fn feed_task(
        self,
        room_id: String,
        client: RealtimeClient,
        mut events: mpsc::Receiver<RealtimeEvent>,
        tx: mpsc::Sender<RoomSnapshot>,
    ) {
        loop {
            let event = tokio::select! {
                _ = tx.closed() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                warn!(room_id = %room_id, "Directory feed connection ended");
                break;
            };
            match event {
                RealtimeEvent::PostgresChange { .. } | RealtimeEvent::ChannelJoined { .. } => {
                    // Coalesce a burst of row changes into one refetch.
                    while let Ok(extra) = events.try_recv() {
                        debug!(?extra, "Coalesced directory event");
                    }
                    match self.fetch_snapshot(&room_id).await {
                        Ok(snapshot) => {
                            if tx.send(snapshot).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(room_id = %room_id, error = %e, "Snapshot refetch failed"),
                    }
                }
                RealtimeEvent::ChannelError { message, .. } => {
                    warn!(room_id = %room_id, message = %message, "Directory channel error");
                }
                RealtimeEvent::Error(message) => {
                    warn!(room_id = %room_id, message = %message, "Directory realtime error");
                }
                _ => {}
            }
        }

        client.disconnect().await;
        info!(room_id = %room_id, "Directory subscription closed");
    }
}

#[async_trait]
impl ParticipantDirectory for SupabaseDirectory {
    async fn subscribe_room(
        &self,
        room_id: &str,
    ) -> Result<mpsc::Receiver<RoomSnapshot>, RoomError> {
        let first = self.fetch_snapshot(room_id).await?;
        let (tx, rx) = mpsc::channel(16);
        let _ = tx.send(first).await;

        let (client, events) = RealtimeClient::connect(self.config.realtime.clone());
        let channel = ChannelConfig {
            postgres_changes: self.config.change_filters(room_id),
            access_token: self.config.realtime.access_token.clone(),
            ..Default::default()
        };
        client
            .join_channel(&format!("room-directory:{room_id}"), channel)
            .await;

        tokio::spawn(self.clone().feed_task(room_id.to_string(), client, events, tx));
        Ok(rx)
    }

    async fn write_join(
        &self,
        room_id: &str,
        profile_id: &str,
        role: Role,
    ) -> Result<Participant, RoomError> {
        let request = self
            .request(reqwest::Method::POST, &self.config.participants_table)
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({
                "room_id": room_id,
                "profile_id": profile_id,
                "role": role,
            }));
        let response = Self::send(request)
            .await
            .map_err(RoomError::DirectoryWriteFailed)?;
        let rows: Vec<Participant> = response
            .json()
            .await
            .map_err(|e| RoomError::DirectoryWriteFailed(e.to_string()))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RoomError::DirectoryWriteFailed("insert returned no row".into()))
    }

    async fn write_leave(&self, participant_id: &str) -> Result<(), RoomError> {
        self.patch_participant(
            participant_id,
            serde_json::json!({ "left_at": Utc::now(), "is_speaking": false }),
        )
        .await
    }

    async fn write_role_change(&self, participant_id: &str, role: Role) -> Result<(), RoomError> {
        self.patch_participant(participant_id, serde_json::json!({ "role": role }))
            .await
    }

    async fn write_muted(&self, participant_id: &str, muted: bool) -> Result<(), RoomError> {
        self.patch_participant(participant_id, serde_json::json!({ "is_muted": muted }))
            .await
    }

    async fn write_speaking(&self, participant_id: &str, speaking: bool) -> Result<(), RoomError> {
        self.patch_participant(participant_id, serde_json::json!({ "is_speaking": speaking }))
            .await
    }

    async fn write_speak_request(&self, room_id: &str, profile_id: &str) -> Result<(), RoomError> {
        let request = self
            .request(reqwest::Method::POST, &self.config.speak_requests_table)
            .header("Prefer", "resolution=ignore-duplicates")
            .json(&serde_json::json!({ "room_id": room_id, "profile_id": profile_id }));
        Self::send(request)
            .await
            .map(|_| ())
            .map_err(RoomError::DirectoryWriteFailed)
    }

    async fn clear_speak_request(&self, room_id: &str, profile_id: &str) -> Result<(), RoomError> {
        let request = self
            .request(reqwest::Method::DELETE, &self.config.speak_requests_table)
            .query(&[
                ("room_id", format!("eq.{room_id}")),
                ("profile_id", format!("eq.{profile_id}")),
            ]);
        Self::send(request)
            .await
            .map(|_| ())
            .map_err(RoomError::DirectoryWriteFailed)
    }
}
