use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::persist::StateStore;

/// Storage key for the persisted connection config blob.
const CONNECTION_KEY: &str = "connection";

/// An AI integration, reached either over a streaming HTTP API or by
/// spawning an interactive command-line agent in a PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "claude-cli")]
    ClaudeCli,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
}

impl Provider {
    /// Whether this provider runs as a local CLI process rather than an API.
    pub fn is_cli(&self) -> bool {
        matches!(self, Provider::ClaudeCli | Provider::GeminiCli)
    }

    /// Models selectable for this provider, first entry is the default.
    /// CLI providers manage their own models and expose none here.
    pub fn models(&self) -> &'static [&'static str] {
        match self {
            Provider::Anthropic => &[
                "claude-sonnet-4-5",
                "claude-opus-4-1",
                "claude-3-5-haiku-latest",
            ],
            Provider::OpenAi => &["gpt-4o", "gpt-4o-mini", "o3-mini"],
            Provider::Gemini => &["gemini-2.5-flash", "gemini-2.5-pro"],
            Provider::ClaudeCli | Provider::GeminiCli => &[],
        }
    }

    /// Default model auto-selected when the provider is chosen
    /// (empty string for CLI providers).
    pub fn default_model(&self) -> String {
        self.models().first().copied().unwrap_or("").to_string()
    }

    /// The command launched in a PTY for CLI providers.
    pub fn cli_command(&self) -> Option<&'static str> {
        match self {
            Provider::ClaudeCli => Some("claude"),
            Provider::GeminiCli => Some("gemini"),
            _ => None,
        }
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Anthropic
    }
}

/// What "connected" meant for one session the last time it was backgrounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLink {
    pub connected: bool,
    pub provider: Provider,
    #[serde(default)]
    pub model: String,
}

/// The persisted connection config blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConnectionState {
    #[serde(default)]
    provider: Provider,
    #[serde(default)]
    model: String,
    #[serde(default)]
    api_keys: HashMap<Provider, String>,
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    connected_sessions: HashMap<String, SessionLink>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        let provider = Provider::default();
        Self {
            provider,
            model: provider.default_model(),
            api_keys: HashMap::new(),
            connected: false,
            connected_sessions: HashMap::new(),
        }
    }
}

/// Owner of all provider/model/key/connected data, tracked globally and
/// snapshotted per session so background sessions can be resumed on
/// switch-back.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: ConnectionState,
    store: StateStore,
}

impl ConnectionTracker {
    /// Load persisted connection state.
    ///
    /// CLI-provider connections never survive a restart (the spawned
    /// process is gone), so the connected flag is force-reset for them.
    /// Per-session snapshots all referenced live state and are cleared
    /// unconditionally.
    pub fn load(store: StateStore) -> Result<Self> {
        let mut state: ConnectionState = store.load(CONNECTION_KEY)?.unwrap_or_default();
        if state.provider.is_cli() && state.connected {
            debug!(provider = ?state.provider, "CLI provider cannot stay connected across restart");
            state.connected = false;
        }
        state.connected_sessions.clear();
        Ok(Self { state, store })
    }

    fn persist(&self) -> Result<()> {
        self.store.save(CONNECTION_KEY, &self.state)
    }

    pub fn provider(&self) -> Provider {
        self.state.provider
    }

    pub fn model(&self) -> &str {
        &self.state.model
    }

    pub fn connected(&self) -> bool {
        self.state.connected
    }

    pub fn api_key(&self, provider: Provider) -> Option<&str> {
        self.state.api_keys.get(&provider).map(String::as_str)
    }

    /// Switch the selected provider and auto-select its first model.
    pub fn set_provider(&mut self, provider: Provider) -> Result<()> {
        self.state.provider = provider;
        self.state.model = provider.default_model();
        self.persist()
    }

    /// Select a model for the current provider.
    pub fn set_model(&mut self, model: &str) -> Result<()> {
        self.state.model = model.to_string();
        self.persist()
    }

    /// Store a secret for a provider, independent of which one is selected.
    pub fn set_api_key(&mut self, provider: Provider, key: &str) -> Result<()> {
        self.state.api_keys.insert(provider, key.to_string());
        self.persist()
    }

    /// Mark the currently selected provider/model usable (or not).
    pub fn set_connected(&mut self, connected: bool) -> Result<()> {
        self.state.connected = connected;
        self.persist()
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.set_connected(false)
    }

    /// Snapshot `{connected, provider, model}` under a session id. Called by
    /// the orchestrator before switching away from that session.
    pub fn save_session_connected(&mut self, session_id: &str) -> Result<()> {
        self.state.connected_sessions.insert(
            session_id.to_string(),
            SessionLink {
                connected: self.state.connected,
                provider: self.state.provider,
                model: self.state.model.clone(),
            },
        );
        self.persist()
    }

    /// Restore a session's snapshot into the live provider/model/connected
    /// fields. A session with no snapshot (never backgrounded while
    /// connected, or newly created) starts disconnected; the last selected
    /// provider/model are left as they were.
    pub fn restore_session_connected(&mut self, session_id: &str) -> Result<()> {
        match self.state.connected_sessions.get(session_id) {
            Some(link) => {
                self.state.provider = link.provider;
                self.state.model = link.model.clone();
                self.state.connected = link.connected;
            }
            None => {
                self.state.connected = false;
            }
        }
        self.persist()
    }

    /// Drop a session's snapshot (called on session deletion).
    pub fn remove_session_connected(&mut self, session_id: &str) -> Result<()> {
        if self.state.connected_sessions.remove(session_id).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    pub fn session_link(&self, session_id: &str) -> Option<&SessionLink> {
        self.state.connected_sessions.get(session_id)
    }
}
