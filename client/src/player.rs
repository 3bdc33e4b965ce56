use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use tandem_protocol::{unix_millis, MediaInfo};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("player is not available")]
    Unavailable,
    #[error("player command queue is full")]
    CommandQueueFull,
    #[error("player bridge closed")]
    Closed,
}

/// What the local player reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerState {
    pub position_ms: i64,
    pub duration_ms: i64,
    pub paused: bool,
    pub rate: f64,
    pub media: MediaInfo,
    /// Local wall-clock time the state was received, stamped on arrival.
    #[serde(skip)]
    pub updated_at_ms: i64,
}

impl PlayerState {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.updated_at_ms)
    }
}

/// A single correction for the local player. `position_ms: None` leaves the position untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApplyState {
    #[serde(with = "position_sentinel")]
    pub position_ms: Option<i64>,
    pub paused: bool,
    pub rate: f64,
}

impl ApplyState {
    pub fn seek(position_ms: i64, paused: bool, rate: f64) -> Self {
        Self {
            position_ms: Some(position_ms),
            paused,
            rate,
        }
    }

    pub fn rate_only(paused: bool, rate: f64) -> Self {
        Self {
            position_ms: None,
            paused,
            rate,
        }
    }
}

/// `-1` on the JSON boundary means "leave the position alone".
mod position_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.unwrap_or(-1))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok((raw >= 0).then_some(raw))
    }
}

/// Commands a push-fed player bridge has to carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PlayerCommand {
    ApplyState(ApplyState),
    Navigate { url: String },
}

/// Uniform contract over every local playback backend.
#[async_trait]
pub trait PlayerEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Latest known local state, or `None` when the player is not available.
    async fn get_state(&self) -> Option<PlayerState>;

    /// Feeds a state pushed by the player. Polling backends ignore this.
    fn update_player_state(&self, state: PlayerState);

    async fn apply_state(&self, state: ApplyState) -> Result<(), PlayerError>;

    /// Opens `url` in the player. Backends without a navigation concept return `Ok`.
    async fn navigate(&self, url: &str) -> Result<(), PlayerError>;

    fn set_follow_url(&self, enabled: bool);

    /// Whether a stale state means the player went away (as opposed to never reporting).
    fn reports_liveness(&self) -> bool {
        false
    }
}

/// Endpoint fed by an external bridge: states are pushed in, commands are queued out.
pub struct BridgeEndpoint {
    name: String,
    state: Mutex<Option<PlayerState>>,
    follow_url: AtomicBool,
    commands: mpsc::Sender<PlayerCommand>,
}

impl BridgeEndpoint {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<PlayerCommand>) {
        let (commands, rx) = mpsc::channel(capacity);
        let endpoint = Self {
            name: name.into(),
            state: Mutex::new(None),
            follow_url: AtomicBool::new(true),
            commands,
        };
        (endpoint, rx)
    }

    fn push(&self, command: PlayerCommand) -> Result<(), PlayerError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PlayerError::CommandQueueFull,
            mpsc::error::TrySendError::Closed(_) => PlayerError::Closed,
        })
    }
}

#[async_trait]
impl PlayerEndpoint for BridgeEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_state(&self) -> Option<PlayerState> {
        self.state.lock().clone()
    }

    fn update_player_state(&self, mut state: PlayerState) {
        state.updated_at_ms = unix_millis();
        *self.state.lock() = Some(state);
    }

    async fn apply_state(&self, state: ApplyState) -> Result<(), PlayerError> {
        self.push(PlayerCommand::ApplyState(state))
    }

    async fn navigate(&self, url: &str) -> Result<(), PlayerError> {
        if !self.follow_url.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.push(PlayerCommand::Navigate {
            url: url.to_string(),
        })
    }

    fn set_follow_url(&self, enabled: bool) {
        self.follow_url.store(enabled, Ordering::Relaxed);
    }

    fn reports_liveness(&self) -> bool {
        true
    }
}
