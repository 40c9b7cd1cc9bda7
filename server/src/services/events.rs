//! Operator-facing event stream.
//!
//! The listener publishes protocol milestones on a broadcast channel; the
//! admin plane (out of scope here) subscribes for console output and user
//! notifications. Lagging or absent subscribers never affect request
//! handling.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::badrequest::BadRequestReason;

/// Broadcast capacity before slow subscribers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Direction of a file transfer, from the listener's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferDirection {
    #[serde(rename = "UPLOAD")]
    Upload,
    #[serde(rename = "DOWNLOAD")]
    Download,
}

impl TransferDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "UPLOAD",
            Self::Download => "DOWNLOAD",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ImplantActivated {
        implant_id: String,
        hostname: Option<String>,
        username: Option<String>,
        ip_external: Option<String>,
        workspace_uuid: Option<String>,
        at: DateTime<Utc>,
    },
    ExternalIpChanged {
        implant_id: String,
        previous: Option<String>,
        current: String,
        at: DateTime<Utc>,
    },
    BadRequest {
        source: IpAddr,
        reason: BadRequestReason,
        implant_id: Option<String>,
        at: DateTime<Utc>,
    },
    FileTransferred {
        implant_id: String,
        filename: String,
        size: u64,
        direction: TransferDirection,
        task_guid: Option<String>,
        at: DateTime<Utc>,
    },
    TaskResultStored {
        implant_id: String,
        task_guid: String,
        at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = Event::TaskResultStored {
            implant_id: "abcd1234".into(),
            task_guid: "task42".into(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_result_stored");
        assert_eq!(json["task_guid"], "task42");
    }

    #[test]
    fn test_transfer_direction_strings() {
        assert_eq!(TransferDirection::Upload.as_str(), "UPLOAD");
        assert_eq!(TransferDirection::Download.as_str(), "DOWNLOAD");
    }
}
