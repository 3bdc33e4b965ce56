//! Playback-sync client: a reconnecting relay transport, the room session on top of it and the
//! drift-correction loop that keeps a local player aligned with the room's host.

pub mod config;
pub mod player;
pub mod session;
pub mod syncer;
pub mod transport;

pub use config::ClientConfig;
pub use player::{ApplyState, BridgeEndpoint, PlayerCommand, PlayerEndpoint, PlayerError, PlayerState};
pub use session::{MemberEvent, Role, Session, SessionDriver, SessionStatus};
pub use syncer::{SoftRate, SyncConfig, Syncer};
pub use transport::{
    ConnectionState, Transport, TransportHandle, TransportHooks, TransportTimings,
};
