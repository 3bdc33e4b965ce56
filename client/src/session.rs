use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use tandem_protocol::{
    best_estimate, unix_millis, ClientHello, ClockEstimate, ClockSample, CreateRoomReq, Envelope,
    HostState, JoinRoomReq, LeaveRoomReq, MediaInfo, Member, MemberStatus, RoomSnapshot,
    TimeSyncReq, TimeSyncResp, PAGE_ONLY_ATTR,
};

use crate::config::ClientConfig;
use crate::player::PlayerEndpoint;
use crate::syncer::{Syncer, STALE_LOCAL_STATE_MS};
use crate::transport::{Transport, TransportHandle, TransportHooks};

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CLOCK_BURST_SAMPLES: usize = 5;
pub const CLOCK_BURST_SPACING: Duration = Duration::from_millis(150);
pub const CLOCK_SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);
pub const PLAYER_CHECK_INTERVAL: Duration = Duration::from_secs(2);
pub const NAVIGATE_DEBOUNCE_MS: i64 = 3_000;
const MAX_MEMBER_EVENTS: usize = 20;

pub const ERR_ALREADY_IN_ROOM: &str = "already in a room";
pub const ERR_ACTION_PENDING: &str = "room action pending";
pub const ERR_PLAYER_IDLE: &str = "player idle, left room";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    None,
    Host,
    Follower,
}

/// Room the user asked for; replayed after every reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Desired {
    #[default]
    None,
    Host,
    Follower(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub display_name: String,
    pub joined: bool,
}

/// Point-in-time view of the session for display.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub room_code: String,
    pub role: Role,
    pub member_count: usize,
    pub host_name: String,
    pub members: Vec<Member>,
    pub member_events: Vec<MemberEvent>,
    pub last_error: Option<String>,
    pub server_connected: bool,
    pub last_server_activity_ms: Option<i64>,
    pub clock_offset_ms: i64,
}

#[derive(Default)]
struct RoomState {
    role: Role,
    room_id: String,
    room_code: String,
    host_id: String,
    members: Vec<Member>,
    latest_state: Option<HostState>,
    desired: Desired,
    pending_action: bool,
    last_error: Option<String>,
    events: VecDeque<MemberEvent>,
    /// Last page the local player reported, used for page-only reports and URL following.
    page_url: String,
    page_site: String,
    last_navigate: Option<(String, i64)>,
    last_page_report_ms: Option<i64>,
    player_fresh: bool,
}

impl RoomState {
    /// Drops everything about the current room and the wish to be in one.
    fn clear(&mut self) {
        *self = RoomState {
            page_url: std::mem::take(&mut self.page_url),
            page_site: std::mem::take(&mut self.page_site),
            ..RoomState::default()
        };
    }

    /// Forgets server-side membership but keeps `desired` so it can be replayed.
    fn detach(&mut self) {
        self.role = Role::None;
        self.room_id.clear();
        self.room_code.clear();
        self.host_id.clear();
        self.members.clear();
        self.latest_state = None;
        self.pending_action = false;
    }

    fn enter(&mut self, role: Role, room_id: String, host_id: String) {
        self.role = role;
        self.room_id = room_id;
        self.host_id = host_id;
        self.members.clear();
        self.latest_state = None;
        self.events.clear();
        self.last_error = None;
        self.pending_action = false;
        self.last_navigate = None;
        self.last_page_report_ms = None;
        self.player_fresh = true;
    }

    fn push_event(&mut self, event: MemberEvent) {
        if self.events.len() == MAX_MEMBER_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn in_room(&self) -> bool {
        self.role != Role::None && !self.room_id.is_empty()
    }
}

/// Connection-level facts shared with the transport loop.
struct Link {
    display_name: Mutex<String>,
    client_id: Mutex<Option<String>>,
    connected: AtomicBool,
    last_activity_ms: AtomicI64,
}

impl Link {
    fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    fn hello(&self) -> Envelope {
        Envelope::ClientHello(ClientHello {
            client_name: self.display_name.lock().clone(),
            client_version: CLIENT_VERSION.to_string(),
        })
    }
}

impl TransportHooks for Link {
    fn on_connect(&self) -> Result<Envelope> {
        Ok(self.hello())
    }

    fn on_status(&self, connected: bool) {
        // A fresh connection gets a fresh id from its ServerHello.
        *self.client_id.lock() = None;
        self.connected.store(connected, Ordering::Relaxed);
        tracing::info!("Server {}", if connected { "connected" } else { "disconnected" });
    }

    fn on_activity(&self) {
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }
}

#[derive(Default)]
struct ClockState {
    offset_ms: i64,
    pending: HashMap<i64, oneshot::Sender<ClockSample>>,
}

struct SessionInner {
    link: Arc<Link>,
    transport: TransportHandle,
    room: Mutex<RoomState>,
    clock: Mutex<ClockState>,
    /// Wakes the clock loop for a fresh burst.
    burst_wanted: Notify,
    endpoint: Mutex<Arc<dyn PlayerEndpoint>>,
    syncer: tokio::sync::Mutex<Syncer>,
    config: Mutex<ClientConfig>,
}

/// Owned pieces that [`Session::run`] drives.
pub struct SessionDriver {
    transport: Transport,
    inbound: mpsc::Receiver<Envelope>,
}

/// Client-side session controller: room membership, host publishing, follower alignment and
/// clock estimation on top of one reconnecting transport.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(config: ClientConfig, endpoint: Arc<dyn PlayerEndpoint>) -> (Self, SessionDriver) {
        let link = Arc::new(Link {
            display_name: Mutex::new(config.display_name.trim().to_string()),
            client_id: Mutex::new(None),
            connected: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(0),
        });
        let (transport, handle, inbound) = Transport::new(config.server_url.clone(), link.clone());
        endpoint.set_follow_url(config.follow_url);

        let session = Self {
            inner: Arc::new(SessionInner {
                link,
                transport: handle,
                room: Mutex::new(RoomState::default()),
                clock: Mutex::new(ClockState::default()),
                burst_wanted: Notify::new(),
                endpoint: Mutex::new(endpoint),
                syncer: tokio::sync::Mutex::new(Syncer::new(config.sync_config())),
                config: Mutex::new(config),
            }),
        };
        (session, SessionDriver { transport, inbound })
    }

    /// Runs the transport, the periodic duties and inbound dispatch until cancelled.
    pub async fn run(&self, driver: SessionDriver, shutdown: CancellationToken) {
        let SessionDriver {
            transport,
            mut inbound,
        } = driver;
        let tasks = [
            tokio::spawn(transport.run(shutdown.clone())),
            tokio::spawn(self.clone().tick_loop(shutdown.clone())),
            tokio::spawn(self.clone().clock_loop(shutdown.clone())),
            tokio::spawn(self.clone().player_check_loop(shutdown.clone())),
        ];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope),
                    None => break,
                },
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Session task failed: {}", e);
            }
        }
    }

    pub fn create_room(&self) -> bool {
        let request = {
            let mut room = self.inner.room.lock();
            if !Self::can_start_room_action(&mut room) {
                return false;
            }
            room.pending_action = true;
            room.desired = Desired::Host;
            self.inner
                .link
                .client_id()
                .map(|client_id| Envelope::CreateRoomReq(CreateRoomReq { client_id }))
        };
        tracing::info!("Creating room");
        if let Some(request) = request {
            self.inner.transport.send(request);
        }
        true
    }

    pub fn join_room(&self, code: &str) -> bool {
        let code = code.trim().to_ascii_uppercase();
        let request = {
            let mut room = self.inner.room.lock();
            if !Self::can_start_room_action(&mut room) {
                return false;
            }
            if code.is_empty() {
                room.last_error = Some("room code required".to_string());
                return false;
            }
            room.pending_action = true;
            room.desired = Desired::Follower(code.clone());
            self.inner.link.client_id().map(|client_id| {
                Envelope::JoinRoomReq(JoinRoomReq {
                    client_id,
                    room_code: code.clone(),
                })
            })
        };
        tracing::info!("Joining room {}", code);
        if let Some(request) = request {
            self.inner.transport.send(request);
        }
        true
    }

    fn can_start_room_action(room: &mut RoomState) -> bool {
        if room.in_room() {
            room.last_error = Some(ERR_ALREADY_IN_ROOM.to_string());
            return false;
        }
        if room.pending_action {
            room.last_error = Some(ERR_ACTION_PENDING.to_string());
            return false;
        }
        room.last_error = None;
        true
    }

    /// Leaves the current room locally and tells the server. Returns false if not in a room.
    pub fn leave_room(&self) -> bool {
        let room_id = {
            let mut room = self.inner.room.lock();
            let room_id = std::mem::take(&mut room.room_id);
            room.clear();
            room_id
        };
        if room_id.is_empty() {
            return false;
        }
        tracing::info!("Leaving room {}", room_id);
        if let Some(client_id) = self.inner.link.client_id() {
            self.inner
                .transport
                .send(Envelope::LeaveRoomReq(LeaveRoomReq { client_id, room_id }));
        }
        true
    }

    /// Updates the name announced in hellos and pushes it to the server right away.
    pub fn set_display_name(&self, name: &str) {
        let name = name.trim().to_string();
        *self.inner.link.display_name.lock() = name.clone();
        self.inner.config.lock().display_name = name;
        if self.inner.link.client_id().is_some() {
            self.inner.transport.send(self.inner.link.hello());
        }
    }

    /// Swaps the local player backend; the next tick uses the new one.
    pub fn set_endpoint(&self, endpoint: Arc<dyn PlayerEndpoint>) {
        endpoint.set_follow_url(self.inner.config.lock().follow_url);
        tracing::info!("Player endpoint set to {}", endpoint.name());
        *self.inner.endpoint.lock() = endpoint;
    }

    pub fn set_follow_url(&self, enabled: bool) {
        self.inner.config.lock().follow_url = enabled;
        self.endpoint().set_follow_url(enabled);
    }

    pub async fn update_config(&self, config: ClientConfig) {
        self.inner.syncer.lock().await.update_config(config.sync_config());
        self.endpoint().set_follow_url(config.follow_url);
        *self.inner.link.display_name.lock() = config.display_name.trim().to_string();
        *self.inner.config.lock() = config;
    }

    pub fn config(&self) -> ClientConfig {
        self.inner.config.lock().clone()
    }

    pub fn endpoint(&self) -> Arc<dyn PlayerEndpoint> {
        self.inner.endpoint.lock().clone()
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.inner.clock.lock().offset_ms
    }

    pub fn status(&self) -> SessionStatus {
        let room = self.inner.room.lock();
        let host_name = room
            .members
            .iter()
            .find(|member| member.is_host || member.member_id == room.host_id)
            .map(|member| member.display_name.trim().to_string())
            .unwrap_or_default();
        let last_activity = self.inner.link.last_activity_ms.load(Ordering::Relaxed);
        SessionStatus {
            room_code: room.room_code.clone(),
            role: room.role,
            member_count: room.members.len(),
            host_name,
            members: room.members.clone(),
            member_events: room.events.iter().cloned().collect(),
            last_error: room.last_error.clone(),
            server_connected: self.inner.link.connected.load(Ordering::Relaxed),
            last_server_activity_ms: (last_activity > 0).then_some(last_activity),
            clock_offset_ms: self.clock_offset_ms(),
        }
    }

    pub fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::ServerHello(hello) => self.on_server_hello(hello.client_id),
            Envelope::CreateRoomResp(resp) => {
                let leave = {
                    let mut room = self.inner.room.lock();
                    let client_id = self.inner.link.client_id().unwrap_or_default();
                    if room.desired != Desired::Host {
                        // Left while the request was in flight.
                        Some(LeaveRoomReq {
                            client_id,
                            room_id: resp.room_id,
                        })
                    } else {
                        room.enter(Role::Host, resp.room_id, client_id);
                        room.room_code = resp.room_code.clone();
                        None
                    }
                };
                match leave {
                    Some(leave) => {
                        self.inner.transport.send(Envelope::LeaveRoomReq(leave));
                    }
                    None => tracing::info!("Room created code={}", resp.room_code),
                }
            }
            Envelope::JoinRoomResp(resp) => {
                let leave = {
                    let mut room = self.inner.room.lock();
                    if matches!(room.desired, Desired::Follower(_)) {
                        tracing::info!("Room joined id={} host={}", resp.room_id, resp.host_id);
                        room.enter(Role::Follower, resp.room_id, resp.host_id);
                        None
                    } else {
                        // Left while the request was in flight.
                        Some(LeaveRoomReq {
                            client_id: self.inner.link.client_id().unwrap_or_default(),
                            room_id: resp.room_id,
                        })
                    }
                };
                if let Some(leave) = leave {
                    self.inner.transport.send(Envelope::LeaveRoomReq(leave));
                }
            }
            Envelope::RoomSnapshot(snapshot) => self.on_room_snapshot(snapshot),
            Envelope::BroadcastState(broadcast) => {
                let mut room = self.inner.room.lock();
                if room.role == Role::None {
                    return;
                }
                if !broadcast.state.host_id.is_empty() {
                    room.host_id = broadcast.state.host_id.clone();
                }
                room.latest_state = Some(broadcast.state);
            }
            Envelope::TimeSyncResp(resp) => self.complete_clock_sample(&resp, unix_millis()),
            Envelope::ErrorResp(err) => self.on_error(err.message),
            other => tracing::debug!("Ignoring {} from server", other.kind()),
        }
    }

    fn on_server_hello(&self, client_id: String) {
        let replay = {
            let mut room = self.inner.room.lock();
            *self.inner.link.client_id.lock() = Some(client_id.clone());
            // The server forgot our membership along with the old connection.
            room.detach();
            let replay = match &room.desired {
                Desired::None => None,
                Desired::Host => Some(Envelope::CreateRoomReq(CreateRoomReq {
                    client_id: client_id.clone(),
                })),
                Desired::Follower(code) => Some(Envelope::JoinRoomReq(JoinRoomReq {
                    client_id: client_id.clone(),
                    room_code: code.clone(),
                })),
            };
            room.pending_action = replay.is_some();
            replay
        };
        tracing::info!("Server hello client_id={}", client_id);
        self.inner.burst_wanted.notify_one();
        if let Some(replay) = replay {
            self.inner.transport.send(replay);
        }
    }

    fn on_room_snapshot(&self, snapshot: RoomSnapshot) {
        let mut room = self.inner.room.lock();
        if room.role == Role::None {
            return;
        }
        let events = member_events(&room.members, &snapshot.members);
        for event in events {
            tracing::info!(
                "{} {} the room",
                event.display_name,
                if event.joined { "joined" } else { "left" }
            );
            room.push_event(event);
        }
        room.room_id = snapshot.room_id;
        room.room_code = snapshot.room_code;
        room.host_id = snapshot.host_id;
        room.members = snapshot.members;
        if let Some(latest) = snapshot.latest_state {
            room.latest_state = Some(latest);
        }
        room.pending_action = false;
    }

    fn on_error(&self, message: String) {
        tracing::warn!("Server error: {}", message);
        let mut room = self.inner.room.lock();
        room.pending_action = false;
        if message.to_lowercase().contains("room closed") {
            room.clear();
        } else if !room.in_room() {
            // A failed join should not be replayed on reconnect.
            room.desired = Desired::None;
        }
        room.last_error = Some(message);
    }

    async fn tick_loop(self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// One publish-or-align step, depending on the current role.
    pub async fn tick(&self) {
        let role = self.inner.room.lock().role;
        match role {
            Role::Host => {
                self.host_tick(unix_millis()).await;
            }
            Role::Follower => {
                self.follower_tick(unix_millis()).await;
            }
            Role::None => {}
        }
    }

    /// Publishes the local player's state, or a rate-limited page-only report when the player
    /// has nothing fresh. Returns what was sent.
    pub async fn host_tick(&self, now_ms: i64) -> Option<HostState> {
        let endpoint = self.endpoint();
        let local = endpoint.get_state().await;
        let offset_ms = self.clock_offset_ms();
        let (static_offset_ms, idle_report) = {
            let config = self.inner.config.lock();
            (config.offset_ms, config.host_idle_report())
        };
        let host_id = self.inner.link.client_id().unwrap_or_default();

        let host_state = {
            let mut room = self.inner.room.lock();
            if room.role != Role::Host || room.room_id.is_empty() {
                return None;
            }
            if let Some(local) = &local {
                if !local.media.url.is_empty() {
                    room.page_url = local.media.url.clone();
                    room.page_site = local.media.site.clone();
                }
            }

            let mut host_state = HostState {
                room_id: room.room_id.clone(),
                host_id,
                seq: unix_nanos(),
                position_ms: 0,
                rate: 1.0,
                paused: true,
                sample_server_time_ms: now_ms + offset_ms,
                offset_ms: static_offset_ms,
                media: None,
            };
            match local.filter(|state| state.age_ms(now_ms) <= STALE_LOCAL_STATE_MS) {
                Some(local) => {
                    host_state.position_ms = local.position_ms;
                    host_state.rate = local.rate;
                    host_state.paused = local.paused;
                    if !local.media.url.is_empty() || !local.media.title.is_empty() {
                        host_state.media = Some(local.media);
                    }
                }
                None => {
                    let interval_ms = idle_report?.as_millis() as i64;
                    if room.page_url.is_empty() {
                        return None;
                    }
                    if let Some(last) = room.last_page_report_ms {
                        if now_ms - last < interval_ms {
                            return None;
                        }
                    }
                    room.last_page_report_ms = Some(now_ms);
                    host_state.media = Some(MediaInfo {
                        url: room.page_url.clone(),
                        title: String::new(),
                        site: room.page_site.clone(),
                        attrs: HashMap::from([(PAGE_ONLY_ATTR.to_string(), "1".to_string())]),
                    });
                }
            }
            host_state
        };

        self.inner
            .transport
            .send(Envelope::HostState(host_state.clone()));
        Some(host_state)
    }

    /// Follows the host's page if needed, then aligns the local player.
    pub async fn follower_tick(&self, now_ms: i64) {
        let host_state = {
            let room = self.inner.room.lock();
            if room.role != Role::Follower {
                return;
            }
            room.latest_state.clone()
        };
        let Some(host_state) = host_state else {
            return;
        };
        let endpoint = self.endpoint();
        self.follow_host_url(endpoint.as_ref(), &host_state, now_ms)
            .await;

        let offset_ms = self.clock_offset_ms();
        let static_offset_ms = self.inner.config.lock().offset_ms;
        let mut syncer = self.inner.syncer.lock().await;
        syncer
            .align(endpoint.as_ref(), Some(&host_state), offset_ms, static_offset_ms)
            .await;
    }

    async fn follow_host_url(
        &self,
        endpoint: &dyn PlayerEndpoint,
        host_state: &HostState,
        now_ms: i64,
    ) {
        if !self.inner.config.lock().follow_url {
            return;
        }
        let Some(host_url) = host_state.media.as_ref().map(|media| media.url.clone()) else {
            return;
        };
        if host_url.is_empty() {
            return;
        }
        let local = endpoint.get_state().await;
        let navigate = {
            let mut room = self.inner.room.lock();
            let current_url = match local {
                Some(local)
                    if local.age_ms(now_ms) < STALE_LOCAL_STATE_MS && !local.media.url.is_empty() =>
                {
                    local.media.url
                }
                _ => room.page_url.clone(),
            };
            should_navigate(&mut room.last_navigate, &host_url, &current_url, now_ms)
        };
        if navigate {
            tracing::info!("Following host to {}", host_url);
            if let Err(e) = endpoint.navigate(&host_url).await {
                tracing::warn!("{}: navigate failed: {}", endpoint.name(), e);
            }
        }
    }

    async fn player_check_loop(self, shutdown: CancellationToken) {
        let mut ticker = time::interval(PLAYER_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check_player(unix_millis()).await,
            }
        }
    }

    /// Leaves the room when the player has been silent too long, and tells the server whether
    /// this follower is actively playing.
    pub async fn check_player(&self, now_ms: i64) {
        let endpoint = self.endpoint();
        if !endpoint.reports_liveness() {
            return;
        }
        let age_ms = endpoint
            .get_state()
            .await
            .map(|state| state.age_ms(now_ms));
        let idle_timeout = self.inner.config.lock().player_idle_timeout();

        let status = {
            let mut room = self.inner.room.lock();
            if !room.in_room() {
                return;
            }
            let idle = match (idle_timeout, age_ms) {
                (Some(timeout), Some(age)) => age >= timeout.as_millis() as i64,
                _ => false,
            };
            if idle {
                None
            } else {
                let fresh = age_ms.is_some_and(|age| age < STALE_LOCAL_STATE_MS);
                if room.role == Role::Follower && room.player_fresh != fresh {
                    room.player_fresh = fresh;
                    Some(MemberStatus {
                        room_id: room.room_id.clone(),
                        member_id: self.inner.link.client_id().unwrap_or_default(),
                        active: fresh,
                    })
                } else {
                    return;
                }
            }
        };

        match status {
            Some(status) => {
                tracing::debug!("Player active={}", status.active);
                self.inner.transport.send(Envelope::MemberStatus(status));
            }
            None => {
                tracing::warn!("Player idle, leaving room");
                self.leave_room();
                self.inner.room.lock().last_error = Some(ERR_PLAYER_IDLE.to_string());
            }
        }
    }

    async fn clock_loop(self, shutdown: CancellationToken) {
        let period = self.config().time_sync_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.burst_wanted.notified() => {
                    self.clock_burst(&shutdown).await;
                }
                _ = ticker.tick() => {
                    if self.inner.link.client_id().is_none() {
                        continue;
                    }
                    let sample = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sample = self.sample_clock() => sample,
                    };
                    if let Some(sample) = sample {
                        let estimate = sample.estimate();
                        self.inner.clock.lock().offset_ms = estimate.offset_ms;
                        tracing::info!(
                            "Clock refresh offset={}ms delay={}ms",
                            estimate.offset_ms,
                            estimate.delay_ms
                        );
                    }
                }
            }
        }
    }

    /// Takes a burst of samples and adopts the one with the lowest delay. Cancellation abandons
    /// the burst and keeps the current offset.
    pub async fn clock_burst(&self, shutdown: &CancellationToken) -> Option<ClockEstimate> {
        let mut samples = Vec::with_capacity(CLOCK_BURST_SAMPLES);
        for i in 0..CLOCK_BURST_SAMPLES {
            let sample = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                sample = async {
                    if i > 0 {
                        time::sleep(CLOCK_BURST_SPACING).await;
                    }
                    self.sample_clock().await
                } => sample,
            };
            if let Some(sample) = sample {
                let estimate = sample.estimate();
                tracing::debug!(
                    "Clock sample offset={}ms delay={}ms",
                    estimate.offset_ms,
                    estimate.delay_ms
                );
                samples.push(sample);
            }
        }
        let Some(best) = best_estimate(samples) else {
            tracing::warn!("Clock burst got no samples, keeping offset");
            return None;
        };
        self.inner.clock.lock().offset_ms = best.offset_ms;
        tracing::info!(
            "Clock offset selected={}ms delay={}ms",
            best.offset_ms,
            best.delay_ms
        );
        Some(best)
    }

    /// Sends one TimeSyncReq and waits for the response carrying the same t1.
    pub async fn sample_clock(&self) -> Option<ClockSample> {
        let (tx, rx) = oneshot::channel();
        let t1 = {
            let mut clock = self.inner.clock.lock();
            // t1 is the only correlation key on the wire, so it must be unique among pending requests.
            let mut t1 = unix_millis();
            while clock.pending.contains_key(&t1) {
                t1 += 1;
            }
            clock.pending.insert(t1, tx);
            t1
        };

        let sent = self
            .inner
            .transport
            .send(Envelope::TimeSyncReq(TimeSyncReq { t1_local_ms: t1 }));
        let sample = if sent {
            time::timeout(CLOCK_SAMPLE_TIMEOUT, rx)
                .await
                .ok()
                .and_then(|received| received.ok())
        } else {
            None
        };
        self.inner.clock.lock().pending.remove(&t1);
        sample
    }

    fn complete_clock_sample(&self, resp: &TimeSyncResp, t4: i64) {
        let Some(tx) = self.inner.clock.lock().pending.remove(&resp.t1_local_ms) else {
            tracing::debug!("Unmatched time sync response t1={}", resp.t1_local_ms);
            return;
        };
        let _ = tx.send(ClockSample {
            t1: resp.t1_local_ms,
            t2: resp.t2_server_ms,
            t3: resp.t3_server_ms,
            t4,
        });
    }
}

/// Join/leave events between two rosters. An empty previous roster yields none.
fn member_events(previous: &[Member], next: &[Member]) -> Vec<MemberEvent> {
    if previous.is_empty() {
        return Vec::new();
    }
    let joined = next
        .iter()
        .filter(|member| !previous.iter().any(|p| p.member_id == member.member_id))
        .map(|member| MemberEvent {
            display_name: member.display_name.trim().to_string(),
            joined: true,
        });
    let left = previous
        .iter()
        .filter(|member| !next.iter().any(|n| n.member_id == member.member_id))
        .map(|member| MemberEvent {
            display_name: member.display_name.trim().to_string(),
            joined: false,
        });
    joined.chain(left).collect()
}

fn is_tracking_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_")
        || key.starts_with("share_")
        || matches!(
            key.as_str(),
            "t" | "start" | "timestamp" | "spm_id_from" | "spm_id" | "from" | "vd_source" | "unique_k"
        )
}

/// Canonical form of a page URL for "same page?" comparisons: no fragment, no tracking or
/// start-time query keys, sorted query, no trailing slash.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    parsed.set_fragment(None);

    let mut kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !is_tracking_key(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    kept.sort();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = parsed.path().to_string();
    if path != "/" && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }
    parsed.to_string()
}

/// Whether to open `host_url` locally. Repeats for the same URL are held back for a few seconds.
pub fn should_navigate(
    last_navigate: &mut Option<(String, i64)>,
    host_url: &str,
    current_url: &str,
    now_ms: i64,
) -> bool {
    let host = normalize_url(host_url);
    if host.is_empty() {
        return false;
    }
    let current = normalize_url(current_url);
    if current == host {
        return false;
    }
    if let Some((url, at_ms)) = last_navigate {
        if *url == host && now_ms - *at_ms < NAVIGATE_DEBOUNCE_MS {
            return false;
        }
    }
    *last_navigate = Some((host, now_ms));
    true
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::{ApplyState, BridgeEndpoint, PlayerCommand, PlayerState};
    use tandem_protocol::{
        BroadcastState, CreateRoomResp, ErrorResp, JoinRoomResp, ServerHello,
    };

    struct Harness {
        session: Session,
        driver: SessionDriver,
        bridge: Arc<BridgeEndpoint>,
        commands: mpsc::Receiver<PlayerCommand>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ClientConfig {
                display_name: "tester".to_string(),
                ..ClientConfig::default()
            })
        }

        fn with_config(config: ClientConfig) -> Self {
            let (bridge, commands) = BridgeEndpoint::new("bridge", 16);
            let bridge = Arc::new(bridge);
            let (session, driver) = Session::new(config, bridge.clone());
            Self {
                session,
                driver,
                bridge,
                commands,
            }
        }

        /// Envelopes queued for the server, minus clock traffic.
        fn sent(&mut self) -> Vec<Envelope> {
            std::iter::from_fn(|| self.driver.transport.try_next_outbound())
                .filter(|env| !matches!(env, Envelope::TimeSyncReq(_)))
                .collect()
        }

        fn hello(&self, client_id: &str) {
            self.session
                .handle_envelope(Envelope::ServerHello(ServerHello {
                    client_id: client_id.to_string(),
                    server_time_ms: unix_millis(),
                }));
        }

        fn become_host(&mut self) {
            self.hello("host-id");
            assert!(self.session.create_room());
            self.session
                .handle_envelope(Envelope::CreateRoomResp(CreateRoomResp {
                    room_id: "room-1".to_string(),
                    room_code: "ABC234".to_string(),
                    server_time_ms: unix_millis(),
                }));
            self.sent();
        }

        fn become_follower(&mut self) {
            self.hello("follower-id");
            assert!(self.session.join_room("abc234"));
            self.session
                .handle_envelope(Envelope::JoinRoomResp(JoinRoomResp {
                    room_id: "room-1".to_string(),
                    host_id: "host-id".to_string(),
                    server_time_ms: unix_millis(),
                }));
            self.sent();
        }
    }

    fn member(id: &str, name: &str, is_host: bool) -> Member {
        Member {
            member_id: id.to_string(),
            display_name: name.to_string(),
            is_host,
        }
    }

    fn snapshot(members: Vec<Member>) -> Envelope {
        Envelope::RoomSnapshot(RoomSnapshot {
            room_id: "room-1".to_string(),
            room_code: "ABC234".to_string(),
            host_id: "host-id".to_string(),
            members,
            latest_state: None,
            server_time_ms: unix_millis(),
        })
    }

    fn host_state(url: &str, position_ms: i64) -> HostState {
        HostState {
            room_id: "room-1".to_string(),
            host_id: "host-id".to_string(),
            seq: 1,
            position_ms,
            rate: 1.0,
            paused: true,
            sample_server_time_ms: unix_millis(),
            offset_ms: 0,
            media: Some(MediaInfo {
                url: url.to_string(),
                ..MediaInfo::default()
            }),
        }
    }

    #[tokio::test]
    async fn create_waits_for_server_hello() {
        let mut h = Harness::new();
        assert!(h.session.create_room());
        assert!(h.sent().is_empty());

        h.hello("c1");
        match h.sent().as_slice() {
            [Envelope::CreateRoomReq(req)] => assert_eq!(req.client_id, "c1"),
            other => panic!("unexpected {other:?}"),
        }

        h.session
            .handle_envelope(Envelope::CreateRoomResp(CreateRoomResp {
                room_id: "room-1".to_string(),
                room_code: "ABC234".to_string(),
                server_time_ms: 0,
            }));
        let status = h.session.status();
        assert_eq!(status.role, Role::Host);
        assert_eq!(status.room_code, "ABC234");
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn room_actions_are_guarded() {
        let mut h = Harness::new();
        h.hello("c1");
        assert!(h.session.join_room(" abc234 "));
        match h.sent().as_slice() {
            [Envelope::JoinRoomReq(req)] => assert_eq!(req.room_code, "ABC234"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(!h.session.create_room());
        assert_eq!(h.session.status().last_error.as_deref(), Some(ERR_ACTION_PENDING));

        h.session
            .handle_envelope(Envelope::JoinRoomResp(JoinRoomResp {
                room_id: "room-1".to_string(),
                host_id: "host-id".to_string(),
                server_time_ms: 0,
            }));
        assert!(!h.session.join_room("XYZ999"));
        assert_eq!(h.session.status().last_error.as_deref(), Some(ERR_ALREADY_IN_ROOM));
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn reconnect_replays_desired_room() {
        let mut h = Harness::new();
        h.become_follower();

        // New connection, new id: the join is sent again.
        h.hello("follower-id-2");
        match h.sent().as_slice() {
            [Envelope::JoinRoomReq(req)] => {
                assert_eq!(req.client_id, "follower-id-2");
                assert_eq!(req.room_code, "ABC234");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.session.status().role, Role::None);
    }

    #[tokio::test]
    async fn room_closed_clears_local_state() {
        let mut h = Harness::new();
        h.become_follower();
        h.session
            .handle_envelope(Envelope::ErrorResp(ErrorResp {
                message: "room closed (host left)".to_string(),
                server_time_ms: 0,
            }));

        let status = h.session.status();
        assert_eq!(status.role, Role::None);
        assert_eq!(status.room_code, "");
        assert_eq!(status.last_error.as_deref(), Some("room closed (host left)"));

        h.hello("follower-id-2");
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_join_is_not_replayed() {
        let mut h = Harness::new();
        h.hello("c1");
        h.session.join_room("NOPE22");
        h.sent();
        h.session
            .handle_envelope(Envelope::ErrorResp(ErrorResp {
                message: "room not found".to_string(),
                server_time_ms: 0,
            }));
        assert_eq!(h.session.status().last_error.as_deref(), Some("room not found"));

        h.hello("c2");
        assert!(h.sent().is_empty());
        assert!(h.session.join_room("ABC234"));
    }

    #[tokio::test]
    async fn create_response_after_leave_is_given_back() {
        let mut h = Harness::new();
        h.hello("c1");
        assert!(h.session.create_room());
        h.sent();
        assert!(!h.session.leave_room());

        h.session
            .handle_envelope(Envelope::CreateRoomResp(CreateRoomResp {
                room_id: "room-1".to_string(),
                room_code: "ABC234".to_string(),
                server_time_ms: 0,
            }));
        assert_eq!(h.session.status().role, Role::None);
        match h.sent().as_slice() {
            [Envelope::LeaveRoomReq(req)] => {
                assert_eq!(req.room_id, "room-1");
                assert_eq!(req.client_id, "c1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_response_after_leave_is_given_back() {
        let mut h = Harness::new();
        h.hello("c1");
        assert!(h.session.join_room("ABC234"));
        h.sent();
        assert!(!h.session.leave_room());

        h.session
            .handle_envelope(Envelope::JoinRoomResp(JoinRoomResp {
                room_id: "room-1".to_string(),
                host_id: "host-id".to_string(),
                server_time_ms: 0,
            }));
        let status = h.session.status();
        assert_eq!(status.role, Role::None);
        assert_eq!(status.room_code, "");
        match h.sent().as_slice() {
            [Envelope::LeaveRoomReq(req)] => {
                assert_eq!(req.room_id, "room-1");
                assert_eq!(req.client_id, "c1");
            }
            other => panic!("unexpected {other:?}"),
        }

        // Nothing to replay on the next connection either.
        h.hello("c2");
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn leave_sends_request_and_clears() {
        let mut h = Harness::new();
        h.become_host();
        assert!(h.session.leave_room());
        match h.sent().as_slice() {
            [Envelope::LeaveRoomReq(req)] => {
                assert_eq!(req.room_id, "room-1");
                assert_eq!(req.client_id, "host-id");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.session.status().role, Role::None);
        assert!(!h.session.leave_room());
    }

    #[tokio::test]
    async fn snapshots_record_member_events() {
        let mut h = Harness::new();
        h.become_host();
        h.session.handle_envelope(snapshot(vec![member("host-id", "tester", true)]));
        h.session.handle_envelope(snapshot(vec![
            member("host-id", "tester", true),
            member("f1", "alice", false),
        ]));
        h.session.handle_envelope(snapshot(vec![member("host-id", "tester", true)]));

        let status = h.session.status();
        assert_eq!(status.member_count, 1);
        assert_eq!(status.host_name, "tester");
        assert_eq!(
            status.member_events,
            vec![
                MemberEvent {
                    display_name: "alice".to_string(),
                    joined: true
                },
                MemberEvent {
                    display_name: "alice".to_string(),
                    joined: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn host_tick_publishes_fresh_state() {
        let mut h = Harness::new();
        h.become_host();
        h.bridge.update_player_state(PlayerState {
            position_ms: 12_345,
            paused: false,
            rate: 1.25,
            media: MediaInfo {
                url: "https://v.example/watch?v=1".to_string(),
                title: "Clip".to_string(),
                ..MediaInfo::default()
            },
            ..PlayerState::default()
        });

        let now = unix_millis();
        let sent = h.session.host_tick(now).await.unwrap();
        assert_eq!(sent.room_id, "room-1");
        assert_eq!(sent.host_id, "host-id");
        assert_eq!(sent.position_ms, 12_345);
        assert_eq!(sent.rate, 1.25);
        assert!(!sent.paused);
        assert_eq!(sent.sample_server_time_ms, now + h.session.clock_offset_ms());
        assert!(!sent.is_page_only());
        assert_eq!(sent.media.unwrap().title, "Clip");
        assert!(matches!(h.sent().as_slice(), [Envelope::HostState(_)]));
    }

    #[tokio::test]
    async fn host_tick_falls_back_to_rate_limited_page_report() {
        let mut h = Harness::new();
        h.become_host();
        h.bridge.update_player_state(PlayerState {
            media: MediaInfo {
                url: "https://v.example/watch?v=2".to_string(),
                ..MediaInfo::default()
            },
            ..PlayerState::default()
        });

        // Player went quiet: only the page is advertised, once per report interval.
        let later = unix_millis() + STALE_LOCAL_STATE_MS + 1_000;
        let report = h.session.host_tick(later).await.unwrap();
        assert!(report.is_page_only());
        assert!(report.paused);
        assert_eq!(report.position_ms, 0);
        assert_eq!(report.media.unwrap().url, "https://v.example/watch?v=2");

        assert!(h.session.host_tick(later + 1_000).await.is_none());
        assert!(h.session.host_tick(later + 5_000).await.is_some());
    }

    #[tokio::test]
    async fn page_report_needs_known_page() {
        let mut h = Harness::with_config(ClientConfig::default());
        h.become_host();
        assert!(h.session.host_tick(unix_millis()).await.is_none());
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn follower_tick_navigates_then_aligns() {
        let mut h = Harness::new();
        h.become_follower();
        h.bridge.update_player_state(PlayerState {
            position_ms: 0,
            paused: true,
            rate: 1.0,
            media: MediaInfo {
                url: "https://v.example/other".to_string(),
                ..MediaInfo::default()
            },
            ..PlayerState::default()
        });
        h.session
            .handle_envelope(Envelope::BroadcastState(BroadcastState {
                state: host_state("https://v.example/watch?v=3", 40_000),
                server_time_ms: 0,
            }));

        h.session.follower_tick(unix_millis()).await;
        assert_eq!(
            h.commands.try_recv().unwrap(),
            PlayerCommand::Navigate {
                url: "https://v.example/watch?v=3".to_string()
            }
        );
        match h.commands.try_recv().unwrap() {
            PlayerCommand::ApplyState(ApplyState {
                position_ms: Some(position),
                paused: true,
                ..
            }) => assert_eq!(position, 40_000),
            other => panic!("unexpected {other:?}"),
        }

        // Debounced on the next tick.
        h.session.follower_tick(unix_millis()).await;
        assert!(matches!(
            h.commands.try_recv().unwrap(),
            PlayerCommand::ApplyState(_)
        ));
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn follow_url_disabled_skips_navigation() {
        let mut h = Harness::new();
        h.become_follower();
        h.session.set_follow_url(false);
        h.bridge.update_player_state(PlayerState::default());
        h.session
            .handle_envelope(Envelope::BroadcastState(BroadcastState {
                state: host_state("https://v.example/watch?v=4", 0),
                server_time_ms: 0,
            }));
        h.session.follower_tick(unix_millis()).await;
        while let Ok(command) = h.commands.try_recv() {
            assert!(!matches!(command, PlayerCommand::Navigate { .. }));
        }
    }

    #[tokio::test]
    async fn idle_player_leaves_room() {
        let mut h = Harness::new();
        h.become_follower();
        h.bridge.update_player_state(PlayerState::default());

        h.session.check_player(unix_millis()).await;
        assert!(h.sent().is_empty());

        h.session.check_player(unix_millis() + 31_000).await;
        assert!(matches!(h.sent().as_slice(), [Envelope::LeaveRoomReq(_)]));
        let status = h.session.status();
        assert_eq!(status.role, Role::None);
        assert_eq!(status.last_error.as_deref(), Some(ERR_PLAYER_IDLE));
    }

    #[tokio::test]
    async fn follower_reports_activity_transitions() {
        let mut h = Harness::new();
        h.become_follower();
        h.bridge.update_player_state(PlayerState::default());

        let stale = unix_millis() + STALE_LOCAL_STATE_MS + 1_000;
        h.session.check_player(stale).await;
        match h.sent().as_slice() {
            [Envelope::MemberStatus(status)] => {
                assert!(!status.active);
                assert_eq!(status.room_id, "room-1");
                assert_eq!(status.member_id, "follower-id");
            }
            other => panic!("unexpected {other:?}"),
        }

        // No repeat while still stale.
        h.session.check_player(stale + 2_000).await;
        assert!(h.sent().is_empty());

        h.bridge.update_player_state(PlayerState::default());
        h.session.check_player(unix_millis()).await;
        match h.sent().as_slice() {
            [Envelope::MemberStatus(status)] => assert!(status.active),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn clock_sample_matches_response_by_t1() {
        let mut h = Harness::new();
        let session = h.session.clone();
        let pending = tokio::spawn(async move { session.sample_clock().await });

        let t1 = loop {
            if let Some(Envelope::TimeSyncReq(req)) = h.driver.transport.try_next_outbound() {
                break req.t1_local_ms;
            }
            tokio::task::yield_now().await;
        };
        h.session
            .handle_envelope(Envelope::TimeSyncResp(TimeSyncResp {
                t1_local_ms: t1 + 1,
                t2_server_ms: 0,
                t3_server_ms: 0,
                server_time_ms: 0,
            }));
        h.session
            .handle_envelope(Envelope::TimeSyncResp(TimeSyncResp {
                t1_local_ms: t1,
                t2_server_ms: t1 + 500,
                t3_server_ms: t1 + 500,
                server_time_ms: t1 + 500,
            }));

        let sample = pending.await.unwrap().unwrap();
        assert_eq!(sample.t1, t1);
        assert_eq!(sample.t2, t1 + 500);
        assert!(sample.t4 >= t1);
    }

    #[tokio::test]
    async fn concurrent_samples_get_distinct_t1() {
        let mut h = Harness::new();
        let first = tokio::spawn({
            let session = h.session.clone();
            async move { session.sample_clock().await }
        });
        let second = tokio::spawn({
            let session = h.session.clone();
            async move { session.sample_clock().await }
        });

        let mut requests = Vec::new();
        while requests.len() < 2 {
            match h.driver.transport.try_next_outbound() {
                Some(Envelope::TimeSyncReq(req)) => requests.push(req.t1_local_ms),
                Some(_) => {}
                None => tokio::task::yield_now().await,
            }
        }
        assert_ne!(requests[0], requests[1]);

        for t1 in requests.iter().rev() {
            h.session
                .handle_envelope(Envelope::TimeSyncResp(TimeSyncResp {
                    t1_local_ms: *t1,
                    t2_server_ms: t1 + 10,
                    t3_server_ms: t1 + 10,
                    server_time_ms: t1 + 10,
                }));
        }
        let mut answered = vec![
            first.await.unwrap().unwrap().t1,
            second.await.unwrap().unwrap().t1,
        ];
        answered.sort();
        requests.sort();
        assert_eq!(answered, requests);
    }

    #[tokio::test]
    async fn cancelled_burst_sends_nothing() {
        let mut h = Harness::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(h.session.clock_burst(&shutdown).await.is_none());
        assert!(h.driver.transport.try_next_outbound().is_none());
        assert_eq!(h.session.clock_offset_ms(), 0);
    }

    #[tokio::test]
    async fn server_hello_bursts_inside_the_clock_loop() {
        let mut h = Harness::new();
        let shutdown = CancellationToken::new();
        let clock = tokio::spawn(h.session.clone().clock_loop(shutdown.clone()));

        h.hello("c1");
        time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(Envelope::TimeSyncReq(_)) = h.driver.transport.try_next_outbound() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // The burst is still waiting on its first answer; shutdown must not wait for it.
        shutdown.cancel();
        time::timeout(Duration::from_secs(1), clock)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_clock_sample_times_out() {
        let h = Harness::new();
        assert!(h.session.sample_clock().await.is_none());
        assert_eq!(h.session.clock_offset_ms(), 0);
    }

    #[test]
    fn normalize_strips_tracking_and_fragment() {
        assert_eq!(
            normalize_url(" https://v.example/watch/?v=9&utm_source=x&t=42#comments "),
            "https://v.example/watch?v=9"
        );
        assert_eq!(
            normalize_url("https://v.example/a?b=2&a=1&share_source=copy"),
            "https://v.example/a?a=1&b=2"
        );
        assert_eq!(normalize_url("https://v.example/"), "https://v.example/");
        assert_eq!(normalize_url("not a url"), "not a url");
        assert_eq!(normalize_url("   "), "");
    }

    #[test]
    fn navigation_is_debounced_per_url() {
        let mut last = None;
        let host = "https://v.example/watch?v=1";
        assert!(!should_navigate(&mut last, host, "https://v.example/watch?v=1&t=30", 0));
        assert!(should_navigate(&mut last, host, "https://v.example/home", 0));
        assert!(!should_navigate(&mut last, host, "https://v.example/home", 2_999));
        assert!(should_navigate(&mut last, host, "https://v.example/home", 3_000));
        assert!(should_navigate(
            &mut last,
            "https://v.example/watch?v=2",
            "https://v.example/home",
            3_001
        ));
        assert!(!should_navigate(&mut last, "", "https://v.example/home", 10_000));
    }

    #[test]
    fn member_events_diff_rosters() {
        let before = vec![member("a", "Ann", true), member("b", "Bo", false)];
        let after = vec![member("a", "Ann", true), member("c", "Cy", false)];
        let events = member_events(&before, &after);
        assert_eq!(events.len(), 2);
        assert!(events.contains(&MemberEvent {
            display_name: "Cy".to_string(),
            joined: true
        }));
        assert!(events.contains(&MemberEvent {
            display_name: "Bo".to_string(),
            joined: false
        }));
        assert!(member_events(&[], &after).is_empty());
    }
}
