use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::frame::{snippet, FrameError, RawFrame};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: u64,
    pub screen_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub id: u64,
    #[serde(default)]
    pub text: String,
    /// Untruncated text of extended statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_status_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retweeted_status: Option<Box<Status>>,
}

impl Status {
    /// Full text when the status carries one, otherwise `text`.
    pub fn display_text(&self) -> &str {
        self.full_text.as_deref().unwrap_or(&self.text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusDeletionNotice {
    #[serde(rename = "id")]
    pub status_id: u64,
    pub user_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrubGeoNotice {
    pub user_id: u64,
    pub up_to_status_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StallWarning {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub percent_full: u8,
}

#[derive(Debug, Deserialize)]
struct DeleteEnvelope {
    status: StatusDeletionNotice,
}

#[derive(Debug, Deserialize)]
struct LimitEnvelope {
    track: u64,
}

/// Typed event decoded from one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status(Status),
    Deletion(StatusDeletionNotice),
    /// Number of matching statuses withheld because of rate limits.
    TrackLimitation { undelivered: u64 },
    ScrubGeo(ScrubGeoNotice),
    StallWarning(StallWarning),
    /// Valid frame of a kind without a structured callback.
    Unknown,
}

impl StreamEvent {
    /// Classifies a frame by its top-level key.
    pub fn decode(frame: &RawFrame) -> Result<Self, FrameError> {
        let Some(object) = frame.value.as_object() else {
            return Err(FrameError::NotAnObject {
                snippet: snippet(&frame.text),
            });
        };

        if let Some(delete) = object.get("delete") {
            let envelope: DeleteEnvelope = typed(delete, frame)?;
            return Ok(Self::Deletion(envelope.status));
        }
        if let Some(limit) = object.get("limit") {
            let envelope: LimitEnvelope = typed(limit, frame)?;
            return Ok(Self::TrackLimitation {
                undelivered: envelope.track,
            });
        }
        if let Some(scrub) = object.get("scrub_geo") {
            return Ok(Self::ScrubGeo(typed(scrub, frame)?));
        }
        if let Some(warning) = object.get("warning") {
            return Ok(Self::StallWarning(typed(warning, frame)?));
        }
        if object.contains_key("id")
            && (object.contains_key("text") || object.contains_key("full_text"))
        {
            return Ok(Self::Status(typed(&frame.value, frame)?));
        }

        Ok(Self::Unknown)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Deletion(_) => "delete",
            Self::TrackLimitation { .. } => "limit",
            Self::ScrubGeo(_) => "scrub_geo",
            Self::StallWarning(_) => "warning",
            Self::Unknown => "unknown",
        }
    }
}

fn typed<T: DeserializeOwned>(value: &Value, frame: &RawFrame) -> Result<T, FrameError> {
    T::deserialize(value).map_err(|source| FrameError::Decode {
        snippet: snippet(&frame.text),
        source,
    })
}
