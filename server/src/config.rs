use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_HOST_IDLE_TIMEOUT_SECS: i64 = 600;

/// Command line / environment surface of the relay binary.
#[derive(Debug, Parser)]
#[command(name = "tandem-server", version, about = "Room relay for synchronized playback")]
pub struct ServerArgs {
    /// Listen address
    #[arg(long, env = "TANDEM_ADDR", default_value = "0.0.0.0:9012")]
    pub addr: SocketAddr,

    /// WebSocket endpoint path
    #[arg(long, env = "TANDEM_WS_PATH", default_value = "/ws")]
    pub path: String,

    /// Close a room when its host has published nothing for this long (seconds, <= 0 disables)
    #[arg(
        long,
        env = "TANDEM_HOST_IDLE_TIMEOUT_SEC",
        default_value_t = DEFAULT_HOST_IDLE_TIMEOUT_SECS,
        allow_negative_numbers = true
    )]
    pub host_idle_timeout_sec: i64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    pub ws_path: String,
    /// `None` disables idle reaping.
    pub host_idle_timeout: Option<Duration>,
}

impl RelayConfig {
    pub fn idle_timeout_from_secs(secs: i64) -> Option<Duration> {
        u64::try_from(secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9012)),
            ws_path: "/ws".to_string(),
            host_idle_timeout: Self::idle_timeout_from_secs(DEFAULT_HOST_IDLE_TIMEOUT_SECS),
        }
    }
}

impl From<ServerArgs> for RelayConfig {
    fn from(args: ServerArgs) -> Self {
        let trimmed = args.path.trim();
        let ws_path = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self {
            addr: args.addr,
            ws_path,
            host_idle_timeout: Self::idle_timeout_from_secs(args.host_idle_timeout_sec),
        }
    }
}
