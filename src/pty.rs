use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::Provider;

/// Byte budget for per-session scrollback. Oldest bytes are evicted first;
/// the retained data is always the most recent suffix.
pub const SCROLLBACK_MAX_BYTES: usize = 256 * 1024;

/// Fixed initial terminal size; the UI resizes to fit once attached.
const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

/// Events forwarded from live PTY processes, tagged with the owning session
/// id. The registry performs no filtering; the host decides which session is
/// foregrounded and renders only matching events.
#[derive(Debug)]
pub enum PtyEvent {
    Output { session_id: String, data: String },
    /// The process exited on its own. This is the only case where an entry is
    /// removed without the caller asking for it.
    Exit {
        session_id: String,
        code: Option<u32>,
    },
}

/// Result of an idempotent connect: reattach-vs-spawn is explicit, not a
/// boolean-plus-flag.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    SpawnedNew,
    ReattachedExisting,
    Failed(String),
}

impl ConnectOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, ConnectOutcome::Failed(_))
    }
}

struct PtyEntry {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    provider: Provider,
    scrollback: Arc<Mutex<Vec<u8>>>,
}

impl Drop for PtyEntry {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

/// Owner of all live PTY processes, keyed by session id.
///
/// Exactly one entry may exist per session. Entries outlive
/// foreground/background transitions: switching sessions never touches the
/// registry; only explicit disconnect or the process exiting removes one.
///
/// The map lives behind a mutex because reader and exit handling run on
/// dedicated OS threads (portable-pty readers are blocking). Connect holds
/// the lock across the presence check and the spawn, so concurrent connects
/// for one session id cannot double-spawn.
#[derive(Clone)]
pub struct PtyRegistry {
    entries: Arc<Mutex<HashMap<String, PtyEntry>>>,
    events: mpsc::UnboundedSender<PtyEvent>,
}

/// Append to a bounded buffer, evicting from the front once over `cap`.
fn append_capped(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    buf.extend_from_slice(data);
    if buf.len() > cap {
        let excess = buf.len() - cap;
        buf.drain(..excess);
    }
}

/// Blocking reader loop for one PTY. Forwards chunks as tagged output events
/// and accumulates scrollback. On EOF the process is gone (or was
/// disconnected): if the entry is still registered this was a self-exit, so
/// remove it and emit the exit event.
fn read_pty_output(
    mut reader: Box<dyn Read + Send>,
    session_id: String,
    scrollback: Arc<Mutex<Vec<u8>>>,
    entries: Arc<Mutex<HashMap<String, PtyEntry>>>,
    events: mpsc::UnboundedSender<PtyEvent>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut sb) = scrollback.lock() {
                    append_capped(&mut sb, &buf[..n], SCROLLBACK_MAX_BYTES);
                }
                let _ = events.send(PtyEvent::Output {
                    session_id: session_id.clone(),
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                });
            }
            Err(_) => break,
        }
    }

    let exited = entries
        .lock()
        .ok()
        .and_then(|mut map| map.remove(&session_id));
    if let Some(mut entry) = exited {
        let code = entry.child.wait().ok().map(|status| status.exit_code());
        debug!(%session_id, ?code, "PTY process exited");
        let _ = events.send(PtyEvent::Exit { session_id, code });
    }
}

impl PtyRegistry {
    pub fn new(events: mpsc::UnboundedSender<PtyEvent>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Ensure a live PTY exists for `session_id`.
    ///
    /// If one is already registered this reattaches without spawning, and the
    /// caller replays scrollback and resumes. Otherwise the provider's CLI
    /// command is spawned in `cwd` (default: the user's home directory) at a
    /// fixed initial size. Spawn failures are reported once; nothing is
    /// registered and nothing is retried.
    pub fn connect(
        &self,
        session_id: &str,
        provider: Provider,
        cwd: Option<&Path>,
    ) -> ConnectOutcome {
        let Ok(mut entries) = self.entries.lock() else {
            return ConnectOutcome::Failed("PTY registry lock poisoned".into());
        };
        if entries.contains_key(session_id) {
            debug!(session_id, "Reattaching to existing PTY");
            return ConnectOutcome::ReattachedExisting;
        }
        let Some(program) = provider.cli_command() else {
            return ConnectOutcome::Failed(format!("provider {provider:?} is not a CLI provider"));
        };
        let cmd = CommandBuilder::new(program);
        self.spawn_locked(&mut entries, session_id, provider, cmd, cwd)
    }

    /// Spawn with the presence check already done and the map lock held.
    fn spawn_locked(
        &self,
        entries: &mut HashMap<String, PtyEntry>,
        session_id: &str,
        provider: Provider,
        mut cmd: CommandBuilder,
        cwd: Option<&Path>,
    ) -> ConnectOutcome {
        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(PtySize {
            rows: INITIAL_ROWS,
            cols: INITIAL_COLS,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pair) => pair,
            Err(e) => return ConnectOutcome::Failed(format!("failed to open PTY pair: {e}")),
        };

        let dir: Option<PathBuf> = cwd.map(Path::to_path_buf).or_else(dirs::home_dir);
        if let Some(dir) = &dir {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => return ConnectOutcome::Failed(format!("failed to spawn agent process: {e}")),
        };
        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => return ConnectOutcome::Failed(format!("failed to clone PTY reader: {e}")),
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => return ConnectOutcome::Failed(format!("failed to get PTY writer: {e}")),
        };

        let scrollback = Arc::new(Mutex::new(Vec::new()));
        let sid = session_id.to_string();
        let sb = Arc::clone(&scrollback);
        let reader_entries = Arc::clone(&self.entries);
        let reader_events = self.events.clone();
        std::thread::spawn(move || {
            read_pty_output(reader, sid, sb, reader_entries, reader_events);
        });

        entries.insert(
            session_id.to_string(),
            PtyEntry {
                child,
                writer,
                master: pair.master,
                provider,
                scrollback,
            },
        );
        debug!(session_id, ?provider, ?dir, "PTY spawned");
        ConnectOutcome::SpawnedNew
    }

    /// Kill and deregister the PTY for a session. A missing entry is fine:
    /// "already disconnected" is success, not an error.
    pub fn disconnect(&self, session_id: &str) {
        let entry = self
            .entries
            .lock()
            .ok()
            .and_then(|mut map| map.remove(session_id));
        if let Some(mut entry) = entry {
            if let Err(e) = entry.child.kill() {
                debug!(session_id, error = %e, "PTY kill failed (already dead?)");
            }
            let _ = entry.child.wait();
            debug!(session_id, "PTY disconnected");
        }
    }

    /// Forward raw input to the process. Fire-and-forget: a missing entry or
    /// a dying process is a silent no-op.
    pub fn write(&self, session_id: &str, data: &[u8]) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(session_id) {
                let result = entry
                    .writer
                    .write_all(data)
                    .and_then(|()| entry.writer.flush());
                if result.is_err() {
                    debug!(session_id, "PTY write dropped, process not accepting input");
                }
            }
        }
    }

    /// Forward a terminal resize. Some process states reject resize; the
    /// error is swallowed so the caller never crashes over it.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        if let Ok(entries) = self.entries.lock() {
            if let Some(entry) = entries.get(session_id) {
                if let Err(e) = entry.master.resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                }) {
                    debug!(session_id, error = %e, "PTY resize rejected");
                }
            }
        }
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.entries
            .lock()
            .map(|map| map.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Accumulated output for reattachment replay, or `None` if no entry.
    pub fn scrollback(&self, session_id: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(session_id)?;
        let sb = entry.scrollback.lock().ok()?;
        Some(String::from_utf8_lossy(&sb).into_owned())
    }

    /// Which CLI provider was spawned for a session, if any.
    pub fn provider(&self, session_id: &str) -> Option<Provider> {
        let entries = self.entries.lock().ok()?;
        entries.get(session_id).map(|entry| entry.provider)
    }

    /// Number of live PTY processes.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn an arbitrary program for a session, standing in for a real CLI
    /// agent binary in tests. Same idempotence as [`connect`].
    #[cfg(test)]
    pub(crate) fn spawn_for_test(
        &self,
        session_id: &str,
        provider: Provider,
        program: &str,
    ) -> ConnectOutcome {
        let Ok(mut entries) = self.entries.lock() else {
            return ConnectOutcome::Failed("PTY registry lock poisoned".into());
        };
        if entries.contains_key(session_id) {
            return ConnectOutcome::ReattachedExisting;
        }
        let cmd = CommandBuilder::new(program);
        self.spawn_locked(&mut entries, session_id, provider, cmd, None)
    }
}
