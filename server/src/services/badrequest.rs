//! Internal classification of rejected implant-facing requests.
//!
//! Reasons are for the operator only. The implant always sees the opaque
//! not-found response, whichever check failed.

use std::net::IpAddr;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use super::events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BadRequestReason {
    BadKey,
    UserAgentMismatch,
    IdNotFound,
    NoTaskGuid,
    NotHostingFile,
    IncorrectFileId,
    NotReceivingFile,
}

impl BadRequestReason {
    #[must_use]
    pub fn explanation(self) -> &'static str {
        match self {
            Self::BadKey => "payload could not be decrypted or parsed with the implant key",
            Self::UserAgentMismatch => "User-Agent header did not match the configured value",
            Self::IdNotFound => "X-Request-ID does not match any registered implant",
            Self::NoTaskGuid => "file transfer request is missing the Content-MD5 task id",
            Self::NotHostingFile => "implant requested a file but none is being hosted",
            Self::IncorrectFileId => "requested file id does not match any hosted file",
            Self::NotReceivingFile => "implant pushed a file but none is expected",
        }
    }
}

/// Counts rejected requests per source address and reports them to the
/// operator event stream.
pub struct BadRequestMonitor {
    counts: DashMap<(IpAddr, BadRequestReason), u64>,
    event_tx: broadcast::Sender<Event>,
}

impl BadRequestMonitor {
    #[must_use]
    pub fn new(event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            counts: DashMap::new(),
            event_tx,
        }
    }

    /// Record a rejected request. Never visible to the implant.
    pub fn notify(&self, source: IpAddr, reason: BadRequestReason, implant_id: Option<&str>) {
        *self.counts.entry((source, reason)).or_insert(0) += 1;

        warn!(
            %source,
            ?reason,
            implant = implant_id.unwrap_or("-"),
            "rejected implant request: {}",
            reason.explanation()
        );

        let _ = self.event_tx.send(Event::BadRequest {
            source,
            reason,
            implant_id: implant_id.map(str::to_string),
            at: Utc::now(),
        });
    }

    /// Rejections seen from one source for one reason.
    #[must_use]
    pub fn count(&self, source: IpAddr, reason: BadRequestReason) -> u64 {
        self.counts
            .get(&(source, reason))
            .map(|entry| *entry)
            .unwrap_or(0)
    }
}
