use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::persist::StateStore;

/// Storage key for the persisted session collection blob.
const SESSIONS_KEY: &str = "sessions";

/// Who produced a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Provider failure surfaced into the transcript.
    Error,
    System,
}

/// One entry in a session's conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    pub text: String,
}

/// One entry in a session's task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub text: String,
    pub done: bool,
}

/// One unit of independent work: a conversation, a task list and a working
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique token, generated at creation, immutable, never reused.
    pub id: String,
    /// User-editable label.
    pub name: String,
    /// Working directory for this session's terminal and file browsing.
    /// May be empty.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Next task id to assign. Never decreases, never reused after deletion.
    #[serde(default)]
    pub task_counter: u64,
}

/// The persisted, process-wide collection of sessions plus the active pointer.
///
/// `sessions` keeps insertion order; the UI display order and the
/// "first remaining" fallback on delete both depend on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCollection {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub active_id: Option<String>,
}

/// Authoritative owner of all session content data.
///
/// Every mutation rewrites the full collection blob through the backing
/// [`StateStore`].
#[derive(Debug)]
pub struct SessionStore {
    collection: SessionCollection,
    store: StateStore,
}

fn generate_session_id(existing: &[Session]) -> String {
    loop {
        let id = format!("{:016x}", rand::random::<u64>());
        if !existing.iter().any(|s| s.id == id) {
            return id;
        }
    }
}

impl SessionStore {
    /// Load the persisted collection, or start empty if none exists yet.
    ///
    /// A dangling active pointer (session deleted out from under a stale
    /// blob) is cleared rather than kept unresolvable.
    pub fn load(store: StateStore) -> Result<Self> {
        let mut collection: SessionCollection = store.load(SESSIONS_KEY)?.unwrap_or_default();
        if let Some(active) = &collection.active_id {
            if !collection.sessions.iter().any(|s| &s.id == active) {
                debug!(%active, "Persisted active session no longer exists, clearing");
                collection.active_id = None;
            }
        }
        Ok(Self { collection, store })
    }

    fn persist(&self) -> Result<()> {
        self.store.save(SESSIONS_KEY, &self.collection)
    }

    pub fn sessions(&self) -> &[Session] {
        &self.collection.sessions
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.collection.sessions.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.session(id).is_some()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.collection.active_id.as_deref()
    }

    /// First session in list order, the fallback target when the active
    /// session is deleted.
    pub fn first_id(&self) -> Option<String> {
        self.collection.sessions.first().map(|s| s.id.clone())
    }

    /// Move the active pointer. Pointing at an id that does not resolve to a
    /// member session is a silent no-op (benign UI races).
    pub fn set_active(&mut self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) if !self.contains(id) => {
                debug!(%id, "Ignoring activation of unknown session");
                return Ok(());
            }
            _ => {}
        }
        self.collection.active_id = id.map(str::to_string);
        self.persist()
    }

    /// Create a new empty session and return its id. The caller decides
    /// whether it becomes active.
    pub fn add(&mut self, name: &str, path: &str) -> Result<String> {
        let id = generate_session_id(&self.collection.sessions);
        self.collection.sessions.push(Session {
            id: id.clone(),
            name: name.to_string(),
            path: path.to_string(),
            messages: Vec::new(),
            tasks: Vec::new(),
            task_counter: 0,
        });
        self.persist()?;
        debug!(%id, name, "Session created");
        Ok(id)
    }

    /// Remove a session. Returns whether it existed. Does not touch the
    /// active pointer; the orchestrator owns the fallback decision.
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.collection.sessions.len();
        self.collection.sessions.retain(|s| s.id != id);
        let removed = self.collection.sessions.len() != before;
        if removed {
            self.persist()?;
            debug!(%id, "Session removed");
        }
        Ok(removed)
    }

    /// Replace a session's stored name. Unknown ids are ignored.
    pub fn rename(&mut self, id: &str, name: &str) -> Result<()> {
        let Some(session) = self.collection.sessions.iter_mut().find(|s| s.id == id) else {
            return Ok(());
        };
        session.name = name.to_string();
        self.persist()
    }

    /// Bulk-replace a session's live content (messages, tasks, task counter
    /// and working directory). This is the snapshot-save performed when a
    /// session is backgrounded.
    pub fn snapshot(
        &mut self,
        id: &str,
        messages: Vec<ChatMessage>,
        tasks: Vec<Task>,
        task_counter: u64,
        path: String,
    ) -> Result<()> {
        let Some(session) = self.collection.sessions.iter_mut().find(|s| s.id == id) else {
            debug!(%id, "Snapshot for unknown session ignored");
            return Ok(());
        };
        session.messages = messages;
        session.tasks = tasks;
        session.task_counter = task_counter;
        session.path = path;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(StateStore::open(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn sessions_keep_insertion_order() {
        let (_dir, mut store) = empty_store();
        let a = store.add("a", "").unwrap();
        let b = store.add("b", "").unwrap();
        let c = store.add("c", "").unwrap();
        let order: Vec<&str> = store.sessions().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec![a.as_str(), b.as_str(), c.as_str()]);
        assert_eq!(store.first_id(), Some(a));
    }

    #[test]
    fn ids_are_unique() {
        let (_dir, mut store) = empty_store();
        let a = store.add("a", "").unwrap();
        let b = store.add("a", "").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn set_active_to_unknown_id_is_a_no_op() {
        let (_dir, mut store) = empty_store();
        let a = store.add("a", "").unwrap();
        store.set_active(Some(&a)).unwrap();
        store.set_active(Some("does-not-exist")).unwrap();
        assert_eq!(store.active_id(), Some(a.as_str()));
    }

    #[test]
    fn remove_reports_presence() {
        let (_dir, mut store) = empty_store();
        let a = store.add("a", "").unwrap();
        assert!(store.remove(&a).unwrap());
        assert!(!store.remove(&a).unwrap());
    }

    #[test]
    fn snapshot_replaces_content_in_full() {
        let (_dir, mut store) = empty_store();
        let a = store.add("a", "/old").unwrap();
        store
            .snapshot(
                &a,
                vec![ChatMessage {
                    id: 1,
                    role: Role::User,
                    text: "hello".into(),
                }],
                vec![Task {
                    id: 0,
                    text: "task".into(),
                    done: false,
                }],
                1,
                "/new".into(),
            )
            .unwrap();
        let session = store.session(&a).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.tasks.len(), 1);
        assert_eq!(session.task_counter, 1);
        assert_eq!(session.path, "/new");

        // A later snapshot fully overwrites, it never merges.
        store.snapshot(&a, Vec::new(), Vec::new(), 1, "/new".into()).unwrap();
        let session = store.session(&a).unwrap();
        assert!(session.messages.is_empty());
        assert!(session.tasks.is_empty());
    }

    #[test]
    fn collection_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let backing = StateStore::open(dir.path());

        let mut store = SessionStore::load(backing.clone()).unwrap();
        let a = store.add("persisted", "/work").unwrap();
        store.set_active(Some(&a)).unwrap();

        let reloaded = SessionStore::load(backing).unwrap();
        assert_eq!(reloaded.sessions().len(), 1);
        assert_eq!(reloaded.active_id(), Some(a.as_str()));
        assert_eq!(reloaded.session(&a).unwrap().name, "persisted");
    }

    #[test]
    fn dangling_active_pointer_is_cleared_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let backing = StateStore::open(dir.path());
        backing
            .save(
                "sessions",
                &SessionCollection {
                    sessions: Vec::new(),
                    active_id: Some("ghost".into()),
                },
            )
            .unwrap();
        let store = SessionStore::load(backing).unwrap();
        assert_eq!(store.active_id(), None);
    }
}
