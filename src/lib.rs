//! Session-multiplexing core for a multi-session AI desktop workbench.
//!
//! The crate manages N independent work sessions, each owning an AI
//! conversation (streamed over a provider API) or a live terminal bound to a
//! command-line AI agent, plus a task list and a file-browsing cursor.
//! Exactly one session is foregrounded at a time; background PTYs and
//! streams keep running and reattach instantly on switch-back.
//!
//! There is no executable entry point here. A UI shell drives the core
//! through [`Workspace`] and renders the tagged events it emits.

pub mod chat;
pub mod connection;
pub mod files;
pub mod persist;
pub mod pty;
pub mod session;
pub mod workspace;

pub use chat::{ChatClient, ContentBlock, ProviderError, StreamEvent, TurnContent};
pub use connection::{ConnectionTracker, Provider, SessionLink};
pub use files::{read_dir, read_file_for_ai, AiFileContent, DirEntryInfo};
pub use persist::StateStore;
pub use pty::{ConnectOutcome, PtyEvent, PtyRegistry, SCROLLBACK_MAX_BYTES};
pub use session::{ChatMessage, Role, Session, SessionStore, Task};
pub use workspace::{LiveView, Workspace, WorkspaceEvent};
