//! JSON wire protocol for the group channel.
//!
//! Every frame is a UTF-8 text frame holding one JSON object tagged by `type`:
//! ```text
//! client → server                      server → client
//! ─────────────────────────────        ──────────────────────────────────
//! join_group     {userId, groupId}     location_update {userId, location}
//! location_update{location}            beacon_signal   {userId, signal}
//! beacon_signal  {signal}              sitrep          {sitrep}
//! sitrep         {text}                member_update   {userId, status}
//! status_update  {status}              status_update   {userId, status}
//! ```
//!
//! Decoding is a two-step affair: a frame that is not JSON at all is noise
//! (`ProtocolError::Malformed`), while JSON that does not fit a variant or
//! fails the field checks is `ProtocolError::Invalid`. Callers treat the two
//! differently when logging, never when deciding whether to keep the socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric user identity resolved from the session.
pub type UserId = i64;
/// Group (squad) identifier; the only fan-out scope.
pub type GroupId = i64;
/// Waypoint identifier.
pub type WaypointId = i64;

/// Longest sitrep body accepted over the wire, in characters.
pub const MAX_SITREP_CHARS: usize = 1000;
/// Longest free-form status accepted over the wire, in characters.
pub const MAX_STATUS_CHARS: usize = 64;

/// A position fix reported by a member.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    /// Epoch milliseconds at which the fix was taken.
    pub timestamp: i64,
}

impl Location {
    pub fn new(lat: f64, lng: f64, timestamp: i64) -> Self {
        Self { lat, lng, timestamp }
    }

    /// Finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Coarse status signal broadcast to the whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Beacon {
    Sos,
    Regroup,
    Moving,
}

impl Beacon {
    /// Stored member status implied by this beacon.
    pub fn member_status(self) -> MemberStatus {
        match self {
            Beacon::Sos => MemberStatus::Sos,
            Beacon::Regroup => MemberStatus::Regroup,
            Beacon::Moving => MemberStatus::Ok,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Beacon::Sos => "SOS",
            Beacon::Regroup => "REGROUP",
            Beacon::Moving => "MOVING",
        }
    }
}

impl std::fmt::Display for Beacon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted member status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Ok,
    Sos,
    Regroup,
}

/// Presence carried by `member_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// Category of a sitrep on the group timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SitrepKind {
    Info,
    Warning,
    Status,
}

/// A stored sitrep as returned by the sitrep store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitrepRecord {
    pub id: i64,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub content: String,
    pub kind: SitrepKind,
    pub created_at: DateTime<Utc>,
}

/// Messages a client sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// The claimed `user_id` is informational; the hub uses the session identity.
    JoinGroup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        group_id: GroupId,
    },
    LocationUpdate { location: Location },
    BeaconSignal { signal: Beacon },
    Sitrep { text: String },
    StatusUpdate { status: String },
}

impl ClientMessage {
    /// Field-level checks on top of the shape serde already enforced.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::JoinGroup { .. } | ClientMessage::BeaconSignal { .. } => Ok(()),
            ClientMessage::LocationUpdate { location } => {
                if location.is_valid() {
                    Ok(())
                } else {
                    Err(ProtocolError::Invalid(format!(
                        "location out of range: ({}, {})",
                        location.lat, location.lng
                    )))
                }
            }
            ClientMessage::Sitrep { text } => check_text("sitrep text", text, MAX_SITREP_CHARS),
            ClientMessage::StatusUpdate { status } => {
                check_text("status", status, MAX_STATUS_CHARS)
            }
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = decode_tagged(text)?;
        msg.validate()?;
        Ok(msg)
    }
}

fn check_text(field: &str, text: &str, max_chars: usize) -> Result<(), ProtocolError> {
    let len = text.trim().chars().count();
    if len == 0 {
        return Err(ProtocolError::Invalid(format!("{field} is empty")));
    }
    if len > max_chars {
        return Err(ProtocolError::Invalid(format!(
            "{field} exceeds {max_chars} characters"
        )));
    }
    Ok(())
}

/// Messages the hub sends to group members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    LocationUpdate { user_id: UserId, location: Location },
    BeaconSignal { user_id: UserId, signal: Beacon },
    Sitrep { sitrep: SitrepRecord },
    MemberUpdate { user_id: UserId, status: Presence },
    StatusUpdate { user_id: UserId, status: String },
}

/// Discriminant of [`ServerMessage`], used as the listener key on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMessageKind {
    LocationUpdate,
    BeaconSignal,
    Sitrep,
    MemberUpdate,
    StatusUpdate,
}

impl ServerMessage {
    pub fn kind(&self) -> ServerMessageKind {
        match self {
            ServerMessage::LocationUpdate { .. } => ServerMessageKind::LocationUpdate,
            ServerMessage::BeaconSignal { .. } => ServerMessageKind::BeaconSignal,
            ServerMessage::Sitrep { .. } => ServerMessageKind::Sitrep,
            ServerMessage::MemberUpdate { .. } => ServerMessageKind::MemberUpdate,
            ServerMessage::StatusUpdate { .. } => ServerMessageKind::StatusUpdate,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ServerMessage::LocationUpdate { location, .. } if !location.is_valid() => Err(
                ProtocolError::Invalid("location out of range".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = decode_tagged(text)?;
        msg.validate()?;
        Ok(msg)
    }
}

fn decode_tagged<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is not JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// JSON that does not match the message schema.
    #[error("invalid message: {0}")]
    Invalid(String),
}
