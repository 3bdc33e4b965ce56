use tandem_protocol::{unix_millis, HostState};

use crate::player::{ApplyState, PlayerEndpoint, PlayerState};

/// Local states older than this are treated as unavailable.
pub const STALE_LOCAL_STATE_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub hard_seek_threshold_ms: i64,
    pub deadzone_ms: i64,
    pub soft_rate_enabled: bool,
    pub soft_rate_threshold_ms: i64,
    pub soft_rate_adjust: f64,
    pub soft_rate_max_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hard_seek_threshold_ms: 1000,
            deadzone_ms: 200,
            soft_rate_enabled: true,
            soft_rate_threshold_ms: 600,
            soft_rate_adjust: 0.02,
            soft_rate_max_ms: 3000,
        }
    }
}

/// Whether a rate nudge is currently standing in for the host's rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SoftRate {
    #[default]
    Idle,
    Correcting { until_ms: i64 },
}

/// Drift-correction core for followers.
///
/// Each tick compares the host's extrapolated position against the local player and picks one
/// of four outcomes: nothing (dead zone), hard seek, a temporary rate nudge, or plain rate/pause
/// propagation.
#[derive(Debug, Default)]
pub struct Syncer {
    config: SyncConfig,
    soft: SoftRate,
}

impl Syncer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            soft: SoftRate::Idle,
        }
    }

    pub fn update_config(&mut self, config: SyncConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn soft_rate(&self) -> SoftRate {
        self.soft
    }

    /// Decides the correction for one tick. `offset_ms` converts local wall-clock time into
    /// server time; `static_offset_ms` is the locally configured position offset.
    pub fn decide(
        &mut self,
        host: Option<&HostState>,
        offset_ms: i64,
        static_offset_ms: i64,
        local: Option<&PlayerState>,
        now_ms: i64,
    ) -> Option<ApplyState> {
        let host = host?;
        if host.is_page_only() {
            return None;
        }
        let local = local.filter(|state| state.age_ms(now_ms) <= STALE_LOCAL_STATE_MS)?;

        let target = target_position(host, static_offset_ms, now_ms.saturating_add(offset_ms));
        let drift = target.saturating_sub(local.position_ms);
        let abs_drift = drift.saturating_abs();

        if abs_drift < self.config.deadzone_ms {
            let correcting = matches!(self.soft, SoftRate::Correcting { until_ms } if until_ms > now_ms);
            self.soft = SoftRate::Idle;
            if correcting {
                tracing::debug!("drift={}ms back in dead zone, restoring rate {}", drift, host.rate);
                return Some(ApplyState::rate_only(host.paused, host.rate));
            }
            return None;
        }

        if abs_drift >= self.config.hard_seek_threshold_ms {
            tracing::info!("drift={}ms seek target={}", drift, target);
            self.soft = SoftRate::Idle;
            return Some(ApplyState::seek(target, host.paused, host.rate));
        }

        if self.config.soft_rate_enabled
            && abs_drift >= self.config.soft_rate_threshold_ms
            && !host.paused
        {
            // Positive drift: the host is ahead of us, so speed up.
            let adjusted = if drift > 0 {
                host.rate + self.config.soft_rate_adjust
            } else {
                host.rate - self.config.soft_rate_adjust
            };
            tracing::debug!("drift={}ms soft-rate={:.3}", drift, adjusted);
            self.soft = SoftRate::Correcting {
                until_ms: now_ms.saturating_add(self.config.soft_rate_max_ms),
            };
            return Some(ApplyState::rate_only(false, adjusted));
        }

        self.soft = SoftRate::Idle;
        Some(ApplyState::rate_only(host.paused, host.rate))
    }

    /// Runs one tick against `endpoint`, applying whatever `decide` returns.
    pub async fn align(
        &mut self,
        endpoint: &dyn PlayerEndpoint,
        host: Option<&HostState>,
        offset_ms: i64,
        static_offset_ms: i64,
    ) -> Option<ApplyState> {
        let host = host?;
        let local = endpoint.get_state().await;
        let decision = self.decide(
            Some(host),
            offset_ms,
            static_offset_ms,
            local.as_ref(),
            unix_millis(),
        )?;
        if let Err(e) = endpoint.apply_state(decision).await {
            tracing::warn!("{}: apply failed: {}", endpoint.name(), e);
        }
        Some(decision)
    }
}

/// Where the host's playback should be at `now_server_ms`. Saturates instead of overflowing on
/// out-of-range wire values.
pub fn target_position(host: &HostState, static_offset_ms: i64, now_server_ms: i64) -> i64 {
    let base = host
        .position_ms
        .saturating_add(host.offset_ms)
        .saturating_add(static_offset_ms);
    if host.paused {
        return base;
    }
    let elapsed = now_server_ms.saturating_sub(host.sample_server_time_ms);
    (base as f64 + elapsed as f64 * host.rate) as i64
}
