//! Live group registry — jid ⇄ folder binding and per-group session state.
//!
//! Groups are registered as transports learn about them. The scheduler
//! resolves task rows to live groups through this registry; a task whose
//! folder has no registered group logs an error run and waits for
//! re-registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a conversational tenant (e.g. `tg:12345` or
/// `xyz@g.us`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupJid(String);

impl GroupJid {
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupJid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A group known to the orchestrator.
#[derive(Debug, Clone)]
pub struct RegisteredGroup {
    pub jid: GroupJid,
    /// Filesystem folder name backing the group's IPC area.
    pub folder: String,
    /// Human-readable group name.
    pub name: String,
    /// Container session id carried across runs in `group` context mode.
    pub session_id: Option<String>,
    /// Timestamp of the newest message already folded into a prompt.
    pub last_processed: Option<DateTime<Utc>>,
}

impl RegisteredGroup {
    pub fn new(jid: GroupJid, folder: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            jid,
            folder: folder.into(),
            name: name.into(),
            session_id: None,
            last_processed: None,
        }
    }
}

/// Registry of live groups, keyed by jid with a folder index.
///
/// Created once at process start and shared by reference; groups live until
/// process exit (no eviction).
#[derive(Default)]
pub struct GroupRegistry {
    inner: Mutex<HashMap<GroupJid, RegisteredGroup>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a group. Replacement keeps nothing from the old
    /// entry; callers re-registering should pass the full current state.
    pub fn register(&self, group: RegisteredGroup) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.insert(group.jid.clone(), group);
    }

    pub fn get(&self, jid: &GroupJid) -> Option<RegisteredGroup> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.get(jid).cloned()
    }

    pub fn find_by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.values().find(|g| g.folder == folder).cloned()
    }

    pub fn set_session_id(&self, jid: &GroupJid, session_id: Option<String>) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(group) = inner.get_mut(jid) {
            group.session_id = session_id;
        }
    }

    /// Advance the message watermark, keeping the newest value.
    pub fn advance_watermark(&self, jid: &GroupJid, processed_up_to: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(group) = inner.get_mut(jid)
            && group.last_processed.is_none_or(|w| w < processed_up_to)
        {
            group.last_processed = Some(processed_up_to);
        }
    }

    pub fn all(&self) -> Vec<RegisteredGroup> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = GroupRegistry::new();
        registry.register(RegisteredGroup::new("tg:1".into(), "family", "Family"));

        let by_jid = registry.get(&"tg:1".into()).unwrap();
        assert_eq!(by_jid.folder, "family");

        let by_folder = registry.find_by_folder("family").unwrap();
        assert_eq!(by_folder.jid, GroupJid::new("tg:1"));

        assert!(registry.find_by_folder("nope").is_none());
    }

    #[test]
    fn session_id_update() {
        let registry = GroupRegistry::new();
        let jid = GroupJid::new("a@g.us");
        registry.register(RegisteredGroup::new(jid.clone(), "a", "A"));

        registry.set_session_id(&jid, Some("sess-1".to_string()));
        assert_eq!(
            registry.get(&jid).unwrap().session_id.as_deref(),
            Some("sess-1")
        );
    }

    #[test]
    fn watermark_only_advances() {
        let registry = GroupRegistry::new();
        let jid = GroupJid::new("a@g.us");
        registry.register(RegisteredGroup::new(jid.clone(), "a", "A"));

        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(60);

        registry.advance_watermark(&jid, later);
        registry.advance_watermark(&jid, earlier);
        assert_eq!(registry.get(&jid).unwrap().last_processed, Some(later));
    }
}
