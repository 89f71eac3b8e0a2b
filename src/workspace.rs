use std::path::Path;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::debug;

use crate::chat::{ChatClient, ProviderError, StreamEvent, TurnContent};
use crate::connection::{ConnectionTracker, Provider};
use crate::files::{self, DirEntryInfo};
use crate::persist::StateStore;
use crate::pty::{ConnectOutcome, PtyEvent, PtyRegistry};
use crate::session::{ChatMessage, Role, SessionStore, Task};

/// Results of background work owned by the workspace, tagged with the
/// session they belong to. The host filters by the foregrounded session.
#[derive(Debug)]
pub enum WorkspaceEvent {
    DirListed {
        session_id: String,
        path: String,
        entries: Vec<DirEntryInfo>,
    },
}

/// The foregrounded session's working state: the chat transcript and task
/// list being edited, plus the file-browser cursor.
///
/// Exactly one live view exists; switching sessions snapshots it into the
/// store and reloads it from the target.
#[derive(Debug, Default)]
pub struct LiveView {
    pub messages: Vec<ChatMessage>,
    pub tasks: Vec<Task>,
    /// Next task id to assign. Monotonic, survives task deletion.
    pub task_counter: u64,
    /// Next chat message id to assign: one greater than the largest id in
    /// the transcript.
    pub next_message_id: u64,
    /// Where the file browser currently points.
    pub browse_path: String,
}

impl LiveView {
    fn reset(&mut self, path: String) {
        self.messages.clear();
        self.tasks.clear();
        self.task_counter = 0;
        self.next_message_id = 1;
        self.browse_path = path;
    }
}

/// The coordinator that owns every core component and sequences session
/// switches.
///
/// All cross-component coordination runs through here: the session store
/// never talks to the PTY registry, the connection tracker never touches
/// session content. One workspace exists per running application.
pub struct Workspace {
    sessions: SessionStore,
    connection: ConnectionTracker,
    ptys: PtyRegistry,
    chat: ChatClient,
    live: LiveView,
    events: mpsc::UnboundedSender<WorkspaceEvent>,
}

impl Workspace {
    /// Load persisted state and assemble the core. If a persisted active
    /// session exists its content is loaded into the live view.
    pub fn new(
        store: StateStore,
        events: mpsc::UnboundedSender<WorkspaceEvent>,
        pty_events: mpsc::UnboundedSender<PtyEvent>,
    ) -> Result<Self> {
        let sessions = SessionStore::load(store.clone())?;
        let connection = ConnectionTracker::load(store)?;
        let mut workspace = Self {
            sessions,
            connection,
            ptys: PtyRegistry::new(pty_events),
            chat: ChatClient::new(),
            live: LiveView::default(),
            events,
        };
        workspace.live.reset(String::new());
        if let Some(active) = workspace.sessions.active_id().map(str::to_string) {
            workspace.load_live(&active);
        }
        Ok(workspace)
    }

    pub fn live(&self) -> &LiveView {
        &self.live
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.sessions.active_id()
    }

    pub fn connection(&self) -> &ConnectionTracker {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionTracker {
        &mut self.connection
    }

    /// The PTY registry, for the terminal widget to write/resize through.
    pub fn ptys(&self) -> &PtyRegistry {
        &self.ptys
    }

    pub fn set_browse_path(&mut self, path: impl Into<String>) {
        self.live.browse_path = path.into();
    }

    // ── Live-view content ───────────────────────────────────────────────

    /// Append a chat message to the live transcript, assigning the next id.
    pub fn push_message(&mut self, role: Role, text: impl Into<String>) -> u64 {
        let id = self.live.next_message_id;
        self.live.next_message_id += 1;
        self.live.messages.push(ChatMessage {
            id,
            role,
            text: text.into(),
        });
        id
    }

    /// Add a task, consuming the next counter value. Task ids are never
    /// reused, also not after deletion.
    pub fn add_task(&mut self, text: impl Into<String>) -> u64 {
        let id = self.live.task_counter;
        self.live.task_counter += 1;
        self.live.tasks.push(Task {
            id,
            text: text.into(),
            done: false,
        });
        id
    }

    pub fn toggle_task(&mut self, id: u64) {
        if let Some(task) = self.live.tasks.iter_mut().find(|t| t.id == id) {
            task.done = !task.done;
        }
    }

    pub fn remove_task(&mut self, id: u64) {
        self.live.tasks.retain(|t| t.id != id);
    }

    // ── Session transitions ─────────────────────────────────────────────

    /// Snapshot the live view into the active session's stored record and
    /// preserve its connection state. With no active session this is a
    /// silent no-op.
    pub fn snapshot_active(&mut self) -> Result<()> {
        self.snapshot_active_inner(false)
    }

    fn snapshot_active_inner(&mut self, keep_stored_path: bool) -> Result<()> {
        let Some(active) = self.sessions.active_id().map(str::to_string) else {
            return Ok(());
        };
        let path = if keep_stored_path {
            self.sessions
                .session(&active)
                .map(|s| s.path.clone())
                .unwrap_or_default()
        } else {
            self.live.browse_path.clone()
        };
        self.sessions.snapshot(
            &active,
            self.live.messages.clone(),
            self.live.tasks.clone(),
            self.live.task_counter,
            path,
        )?;
        self.connection.save_session_connected(&active)?;
        Ok(())
    }

    /// Switch the foregrounded session.
    ///
    /// The outgoing session is snapshotted, the target's transcript, tasks
    /// and connection state are restored, and its directory is re-listed in
    /// the background. Switching to the already-active session or to an
    /// unknown id changes nothing. No PTY is spawned here; the restored
    /// connection state only records the intent; the host calls the
    /// idempotent [`PtyRegistry::connect`] to reattach.
    pub fn switch_session(&mut self, target: &str) -> Result<()> {
        if self.sessions.active_id() == Some(target) {
            return Ok(());
        }
        self.snapshot_active_inner(false)?;
        if !self.sessions.contains(target) {
            debug!(%target, "Ignoring switch to unknown session");
            return Ok(());
        }
        self.activate(target)
    }

    /// Create a new session and make it active.
    ///
    /// A blank name is rejected without any state change. The outgoing
    /// session keeps its own stored path (the new session takes over the
    /// browser's current position instead). New sessions always start
    /// disconnected. Returns the new session id, or `None` if rejected.
    pub fn add_session(&mut self, name: &str, path: &str) -> Result<Option<String>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        self.snapshot_active_inner(true)?;
        let id = self.sessions.add(name, path)?;
        self.sessions.set_active(Some(&id))?;
        self.live.reset(path.to_string());
        self.chat.reset_history();
        self.connection.disconnect()?;
        debug!(%id, name, "Session added and activated");
        Ok(Some(id))
    }

    /// Delete a session, killing any PTY it owns and dropping its connection
    /// snapshot. Deleting the active session activates the first remaining
    /// one, or clears the workspace if none remain.
    pub fn delete_session(&mut self, id: &str) -> Result<()> {
        self.ptys.disconnect(id);
        self.connection.remove_session_connected(id)?;

        let was_active = self.sessions.active_id() == Some(id);
        let removed = self.sessions.remove(id)?;
        if !removed || !was_active {
            return Ok(());
        }

        match self.sessions.first_id() {
            Some(first) => self.activate(&first),
            None => {
                self.sessions.set_active(None)?;
                self.live.reset(String::new());
                self.chat.reset_history();
                self.connection.disconnect()
            }
        }
    }

    /// Rename a session. A name that is empty after trimming, or an unknown
    /// id, is silently ignored.
    pub fn rename_session(&mut self, id: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }
        self.sessions.rename(id, name)
    }

    fn activate(&mut self, target: &str) -> Result<()> {
        self.sessions.set_active(Some(target))?;
        self.load_live(target);
        let path = self.live.browse_path.clone();
        self.spawn_dir_relist(target, path);
        self.connection.restore_session_connected(target)?;
        Ok(())
    }

    fn load_live(&mut self, id: &str) {
        let Some(session) = self.sessions.session(id) else {
            return;
        };
        self.live.messages = session.messages.clone();
        self.live.tasks = session.tasks.clone();
        self.live.task_counter = session.task_counter;
        self.live.next_message_id = session
            .messages
            .iter()
            .map(|m| m.id)
            .max()
            .map_or(1, |max| max + 1);
        self.live.browse_path = session.path.clone();
        self.chat.load_history(&session.messages);
    }

    /// Refresh the file browser for a session's directory in the background.
    /// The directory may be gone (deleted, unmounted), so failures are
    /// swallowed, a switch never fails because of them.
    fn spawn_dir_relist(&self, session_id: &str, path: String) {
        if path.is_empty() {
            return;
        }
        let events = self.events.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match files::read_dir(&path).await {
                Ok(entries) => {
                    let _ = events.send(WorkspaceEvent::DirListed {
                        session_id,
                        path,
                        entries,
                    });
                }
                Err(e) => {
                    debug!(%path, error = %e, "Directory re-list failed, ignoring");
                }
            }
        });
    }

    // ── Connection plumbing ─────────────────────────────────────────────

    /// Validate a provider/model/key combination with a one-shot probe and,
    /// only on success, persist it as the active config. A failed probe
    /// leaves the current config untouched.
    pub async fn configure_connection(
        &mut self,
        provider: Provider,
        model: &str,
        api_key: &str,
    ) -> Result<(), ProviderError> {
        self.chat.verify_config(provider, model, api_key).await?;

        let wrap = |e: anyhow::Error| ProviderError::Other(e.to_string());
        if !provider.is_cli() {
            self.connection
                .set_api_key(provider, api_key)
                .map_err(wrap)?;
        }
        self.connection.set_provider(provider).map_err(wrap)?;
        if !model.is_empty() && !provider.is_cli() {
            self.connection.set_model(model).map_err(wrap)?;
        }
        if provider.is_cli() {
            // A CLI provider only counts as connected once its PTY runs.
            self.connection.disconnect().map_err(wrap)?;
        } else {
            self.connection.set_connected(true).map_err(wrap)?;
        }
        Ok(())
    }

    /// Ensure a terminal is running for the active session's CLI provider,
    /// reattaching if one is already alive, and record the connection.
    pub fn connect_terminal(&mut self) -> Result<ConnectOutcome> {
        let Some(active) = self.sessions.active_id().map(str::to_string) else {
            return Ok(ConnectOutcome::Failed("no active session".into()));
        };
        let provider = self.connection.provider();
        let cwd = if self.live.browse_path.is_empty() {
            None
        } else {
            Some(Path::new(self.live.browse_path.as_str()).to_path_buf())
        };
        let outcome = self.ptys.connect(&active, provider, cwd.as_deref());
        if outcome.is_ok() {
            self.connection.set_connected(true)?;
        }
        Ok(outcome)
    }

    /// Kill the active session's terminal and mark it disconnected.
    pub fn disconnect_terminal(&mut self) -> Result<()> {
        if let Some(active) = self.sessions.active_id().map(str::to_string) {
            self.ptys.disconnect(&active);
        }
        self.connection.disconnect()
    }

    // ── Chat plumbing ───────────────────────────────────────────────────

    /// Send one chat turn through the active API provider.
    ///
    /// The user message lands in the transcript immediately; the streamed
    /// reply is appended as one assistant message once complete. A failed
    /// turn appends an error-role message instead. Partial chunks the host
    /// already rendered are its own to keep or drop, and no empty assistant
    /// message is ever recorded.
    pub async fn send_chat_turn(
        &mut self,
        content: TurnContent,
        stream: &mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let provider = self.connection.provider();
        if provider.is_cli() {
            anyhow::bail!("active provider is a CLI agent; its turns go through the terminal");
        }
        let model = self.connection.model().to_string();
        let api_key = self
            .connection
            .api_key(provider)
            .unwrap_or_default()
            .to_string();

        self.push_message(Role::User, content.as_text());

        match self
            .chat
            .send_turn(provider, &model, &api_key, content, stream)
            .await
        {
            Ok(text) => {
                if !text.is_empty() {
                    self.push_message(Role::Assistant, text);
                }
            }
            Err(e) => {
                self.push_message(Role::Error, e.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyEvent;

    struct Fixture {
        _dir: tempfile::TempDir,
        workspace: Workspace,
        _events: mpsc::UnboundedReceiver<WorkspaceEvent>,
        _pty_events: mpsc::UnboundedReceiver<PtyEvent>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (pty_tx, pty_rx) = mpsc::unbounded_channel();
        let workspace = Workspace::new(StateStore::open(dir.path()), tx, pty_tx).unwrap();
        Fixture {
            _dir: dir,
            workspace,
            _events: rx,
            _pty_events: pty_rx,
        }
    }

    #[tokio::test]
    async fn switch_round_trips_messages_tasks_and_ids() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "").unwrap().unwrap();
        ws.push_message(Role::User, "m1");
        ws.push_message(Role::Assistant, "m2");
        ws.add_task("t1");
        let messages_before = ws.live().messages.clone();
        let tasks_before = ws.live().tasks.clone();

        let b = ws.add_session("B", "").unwrap().unwrap();
        assert_eq!(ws.active_session_id(), Some(b.as_str()));
        assert!(ws.live().messages.is_empty());
        assert!(ws.live().tasks.is_empty());

        ws.switch_session(&a).unwrap();
        assert_eq!(ws.active_session_id(), Some(a.as_str()));
        assert_eq!(ws.live().messages, messages_before);
        assert_eq!(ws.live().tasks, tasks_before);
        assert_eq!(ws.live().next_message_id, 3);
    }

    #[tokio::test]
    async fn switch_to_active_or_unknown_session_changes_nothing() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "").unwrap().unwrap();
        ws.push_message(Role::User, "kept");

        ws.switch_session(&a).unwrap();
        assert_eq!(ws.live().messages.len(), 1);

        ws.switch_session("no-such-session").unwrap();
        assert_eq!(ws.active_session_id(), Some(a.as_str()));
        assert_eq!(ws.live().messages.len(), 1);
    }

    #[tokio::test]
    async fn add_session_rejects_blank_names() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        assert_eq!(ws.add_session("   ", "/tmp").unwrap(), None);
        assert!(ws.sessions().sessions().is_empty());
        assert_eq!(ws.active_session_id(), None);
    }

    #[tokio::test]
    async fn new_session_is_isolated_and_preserves_outgoing_path() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "/home/a").unwrap().unwrap();
        ws.push_message(Role::User, "hello");
        ws.add_task("task");
        // The browser wandered somewhere else while A was foregrounded.
        ws.set_browse_path("/somewhere/else");

        let b = ws.add_session("x", "/somewhere/else").unwrap().unwrap();
        assert_eq!(ws.active_session_id(), Some(b.as_str()));
        assert!(ws.live().messages.is_empty());
        assert!(ws.live().tasks.is_empty());
        assert_eq!(ws.live().task_counter, 0);
        assert_eq!(ws.live().browse_path, "/somewhere/else");
        assert!(!ws.connection().connected());

        // A's own stored path was preserved, not overwritten by the browser.
        assert_eq!(ws.sessions().session(&a).unwrap().path, "/home/a");
        // A's content was snapshotted before the switch.
        assert_eq!(ws.sessions().session(&a).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn plain_switch_saves_the_browser_path() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "/home/a").unwrap().unwrap();
        let b = ws.add_session("B", "").unwrap().unwrap();
        ws.switch_session(&a).unwrap();

        ws.set_browse_path("/home/a/subdir");
        ws.switch_session(&b).unwrap();
        assert_eq!(ws.sessions().session(&a).unwrap().path, "/home/a/subdir");
    }

    #[tokio::test]
    async fn delete_active_falls_back_to_first_remaining() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "").unwrap().unwrap();
        let b = ws.add_session("B", "").unwrap().unwrap();
        let c = ws.add_session("C", "").unwrap().unwrap();

        ws.switch_session(&a).unwrap();
        ws.delete_session(&a).unwrap();
        assert_eq!(ws.active_session_id(), Some(b.as_str()));

        ws.delete_session(&b).unwrap();
        assert_eq!(ws.active_session_id(), Some(c.as_str()));

        ws.delete_session(&c).unwrap();
        assert_eq!(ws.active_session_id(), None);
        assert!(ws.live().messages.is_empty());
        assert!(ws.live().tasks.is_empty());
        assert!(!ws.connection().connected());
    }

    #[tokio::test]
    async fn delete_of_background_session_leaves_the_foreground_alone() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "").unwrap().unwrap();
        let b = ws.add_session("B", "").unwrap().unwrap();
        ws.push_message(Role::User, "working in b");

        ws.delete_session(&a).unwrap();
        assert_eq!(ws.active_session_id(), Some(b.as_str()));
        assert_eq!(ws.live().messages.len(), 1);
    }

    #[tokio::test]
    async fn rename_rejects_whitespace_only_names() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("original", "").unwrap().unwrap();
        ws.rename_session(&a, "   ").unwrap();
        assert_eq!(ws.sessions().session(&a).unwrap().name, "original");

        ws.rename_session(&a, "  renamed  ").unwrap();
        assert_eq!(ws.sessions().session(&a).unwrap().name, "renamed");

        // Renaming an unknown id is a silent no-op.
        ws.rename_session("ghost", "whatever").unwrap();
    }

    #[tokio::test]
    async fn snapshot_with_no_active_session_is_a_no_op() {
        let mut f = fixture();
        f.workspace.snapshot_active().unwrap();
        assert!(f.workspace.sessions().sessions().is_empty());
    }

    #[tokio::test]
    async fn task_ids_are_never_reused() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        ws.add_session("A", "").unwrap().unwrap();
        let t0 = ws.add_task("first");
        let t1 = ws.add_task("second");
        assert_eq!((t0, t1), (0, 1));

        ws.remove_task(t0);
        ws.remove_task(t1);
        let t2 = ws.add_task("third");
        assert_eq!(t2, 2);
        assert_eq!(ws.live().task_counter, 3);
    }

    #[tokio::test]
    async fn message_ids_continue_after_round_trip() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "").unwrap().unwrap();
        ws.push_message(Role::User, "one");
        ws.push_message(Role::Assistant, "two");

        let b = ws.add_session("B", "").unwrap().unwrap();
        ws.switch_session(&a).unwrap();
        let id = ws.push_message(Role::User, "three");
        assert_eq!(id, 3);

        ws.switch_session(&b).unwrap();
        assert_eq!(ws.live().next_message_id, 1);
    }

    #[tokio::test]
    async fn connection_state_follows_the_session() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let a = ws.add_session("A", "").unwrap().unwrap();
        ws.connection_mut().set_provider(Provider::OpenAi).unwrap();
        ws.connection_mut().set_connected(true).unwrap();

        // New sessions always start disconnected, whatever was connected
        // before.
        let b = ws.add_session("B", "").unwrap().unwrap();
        assert!(!ws.connection().connected());
        ws.connection_mut().set_provider(Provider::Gemini).unwrap();

        ws.switch_session(&a).unwrap();
        assert!(ws.connection().connected());
        assert_eq!(ws.connection().provider(), Provider::OpenAi);

        ws.switch_session(&b).unwrap();
        assert!(!ws.connection().connected());
        assert_eq!(ws.connection().provider(), Provider::Gemini);
    }

    #[tokio::test]
    async fn workspace_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path());
        let a;
        {
            let (tx, _rx) = mpsc::unbounded_channel();
            let (pty_tx, _pty_rx) = mpsc::unbounded_channel();
            let mut ws = Workspace::new(store.clone(), tx, pty_tx).unwrap();
            a = ws.add_session("A", "/work").unwrap().unwrap();
            ws.push_message(Role::User, "persisted?");
            ws.add_task("todo");
            ws.snapshot_active().unwrap();
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let (pty_tx, _pty_rx) = mpsc::unbounded_channel();
        let ws = Workspace::new(store, tx, pty_tx).unwrap();
        assert_eq!(ws.active_session_id(), Some(a.as_str()));
        assert_eq!(ws.live().messages.len(), 1);
        assert_eq!(ws.live().tasks.len(), 1);
        assert_eq!(ws.live().next_message_id, 2);
    }

    /// Two sessions, one CLI-connected with a live PTY, one API-disconnected.
    /// Switching away and back must keep exactly one process alive the whole
    /// time and reattach to it rather than spawning a second one.
    #[tokio::test]
    async fn background_pty_survives_switching_and_reattaches() {
        let mut f = fixture();
        let ws = &mut f.workspace;

        let s1 = ws.add_session("S1", "").unwrap().unwrap();
        ws.connection_mut()
            .set_provider(Provider::ClaudeCli)
            .unwrap();
        ws.ptys().spawn_for_test(&s1, Provider::ClaudeCli, "cat");
        ws.connection_mut().set_connected(true).unwrap();
        assert_eq!(ws.ptys().len(), 1);

        ws.ptys().write(&s1, b"scrollback-marker\n");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if let Some(sb) = ws.ptys().scrollback(&s1) {
                if sb.contains("scrollback-marker") {
                    break;
                }
            }
            assert!(
                std::time::Instant::now() < deadline,
                "marker never reached scrollback"
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let s2 = ws.add_session("S2", "").unwrap().unwrap();
        ws.connection_mut().set_provider(Provider::OpenAi).unwrap();
        assert!(!ws.connection().connected());
        assert!(ws.live().messages.is_empty());
        // S1's process keeps running in the background.
        assert_eq!(ws.ptys().len(), 1);
        assert!(ws.ptys().exists(&s1));

        ws.switch_session(&s1).unwrap();
        assert!(ws.connection().connected());
        assert_eq!(ws.connection().provider(), Provider::ClaudeCli);

        // Reattach: same process, no second spawn, scrollback intact.
        let outcome = ws.connect_terminal().unwrap();
        assert_eq!(outcome, ConnectOutcome::ReattachedExisting);
        assert_eq!(ws.ptys().len(), 1);
        assert!(ws
            .ptys()
            .scrollback(&s1)
            .unwrap()
            .contains("scrollback-marker"));

        ws.switch_session(&s2).unwrap();
        assert!(!ws.connection().connected());
        assert_eq!(ws.ptys().len(), 1);
    }
}
