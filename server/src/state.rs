use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tandem_protocol::{
    unix_millis, BroadcastState, CreateRoomResp, Envelope, ErrorResp, HostState, JoinRoomResp,
    Member, MemberStatus, RoomSnapshot, TimeSyncReq, TimeSyncResp,
};

use crate::error::RelayError;

const LOG_TAG: &str = "[Tandem Relay]";

/// Room codes avoid characters that are easy to confuse (0/O, 1/I).
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 6;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE: usize = 64;

pub const HOST_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub const ROOM_CLOSED_HOST_LEFT: &str = "room closed (host left)";
pub const ROOM_CLOSED_HOST_IDLE: &str = "room closed (host idle)";

const MAX_DISPLAY_NAME: usize = 32;

/// A pre-serialized envelope waiting in a connection's outbound queue.
pub type Frame = Vec<u8>;
pub type ClientSender = mpsc::Sender<Frame>;

/// Shared relay state: room registry, code index and connected clients behind one lock.
///
/// The lock is never held while encoding or handing frames to connection queues.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<Mutex<Registry>>,
    host_idle_timeout: Option<Duration>,
}

#[derive(Default)]
struct Registry {
    /// All active rooms: room_id -> Room
    rooms: HashMap<String, Room>,
    /// Active room codes: room_code -> room_id
    room_codes: HashMap<String, String>,
    /// All connected clients: client_id -> ClientInfo
    clients: HashMap<String, ClientInfo>,
}

struct Room {
    id: String,
    code: String,
    host_id: String,
    members: HashSet<String>,
    latest_state: Option<HostState>,
    last_host_state_at: Instant,
}

struct ClientInfo {
    display_name: String,
    sender: ClientSender,
    room_id: Option<String>,
    is_host: bool,
    active: bool,
}

/// What happened to a room when a member left it.
enum Departure {
    NotInRoom,
    /// Last member left; the room is gone and nobody needs telling.
    RoomEmptied { room_id: String },
    /// Host left; the room is gone and the remaining members must be told.
    HostLeft {
        room_id: String,
        remaining: Vec<ClientSender>,
    },
    /// A follower left; the others get a fresh snapshot.
    MemberLeft { room_id: String },
}

impl ServerState {
    pub fn new(host_idle_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::default())),
            host_idle_timeout,
        }
    }

    pub fn add_client(&self, client_id: &str, display_name: &str, sender: ClientSender) {
        let display_name = sanitize_display_name(display_name)
            .unwrap_or_else(|| default_display_name(client_id));
        self.inner.lock().clients.insert(
            client_id.to_string(),
            ClientInfo {
                display_name,
                sender,
                room_id: None,
                is_host: false,
                active: true,
            },
        );
        tracing::info!("{LOG_TAG} Client {} connected", client_id);
    }

    /// Leaves the client's room (with full departure semantics) and forgets the client.
    pub fn remove_client(&self, client_id: &str) {
        let _ = self.leave_room(client_id);
        self.inner.lock().clients.remove(client_id);
        tracing::info!("{LOG_TAG} Client {} disconnected", client_id);
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    /// Room id the client currently belongs to.
    pub fn room_of(&self, client_id: &str) -> Option<String> {
        self.inner
            .lock()
            .clients
            .get(client_id)
            .and_then(|client| client.room_id.clone())
    }

    /// Queues an envelope for one client. Returns false if it was dropped.
    pub fn send_to(&self, client_id: &str, envelope: &Envelope) -> bool {
        let sender = self
            .inner
            .lock()
            .clients
            .get(client_id)
            .map(|client| client.sender.clone());
        match (sender, encode(envelope)) {
            (Some(sender), Some(frame)) => deliver(&[sender], &frame) == 1,
            _ => false,
        }
    }

    pub fn send_error(&self, client_id: &str, message: &str) {
        self.send_to(client_id, &error_envelope(message));
    }

    /// Applies a hello received after the handshake: renames the client and refreshes its room.
    pub fn rename_client(&self, client_id: &str, name: &str) {
        let Some(name) = sanitize_display_name(name) else {
            return;
        };
        let room_id = {
            let mut registry = self.inner.lock();
            let Some(client) = registry.clients.get_mut(client_id) else {
                return;
            };
            client.display_name = name;
            client.room_id.clone()
        };
        if let Some(room_id) = room_id {
            self.broadcast_room_snapshot(&room_id);
        }
    }

    /// Creates a room hosted by `client_id`. Returns `(room_id, room_code)`.
    pub fn create_room(&self, client_id: &str) -> Result<(String, String), RelayError> {
        let (room_id, room_code, departure) = {
            let mut guard = self.inner.lock();
            let registry = &mut *guard;
            if !registry.clients.contains_key(client_id) {
                return Err(RelayError::UnknownClient(client_id.to_string()));
            }
            let departure = registry.detach_member(client_id);

            let room_id = random_id();
            let room_code = registry.unique_room_code();
            let mut members = HashSet::new();
            members.insert(client_id.to_string());
            registry.rooms.insert(
                room_id.clone(),
                Room {
                    id: room_id.clone(),
                    code: room_code.clone(),
                    host_id: client_id.to_string(),
                    members,
                    latest_state: None,
                    last_host_state_at: Instant::now(),
                },
            );
            registry
                .room_codes
                .insert(room_code.clone(), room_id.clone());
            if let Some(client) = registry.clients.get_mut(client_id) {
                client.room_id = Some(room_id.clone());
                client.is_host = true;
                client.active = true;
            }
            (room_id, room_code, departure)
        };

        self.finish_departure(departure);
        tracing::info!(
            "{LOG_TAG} Room {} ({}) created by client {}",
            room_id,
            room_code,
            client_id
        );

        self.send_to(
            client_id,
            &Envelope::CreateRoomResp(CreateRoomResp {
                room_id: room_id.clone(),
                room_code: room_code.clone(),
                server_time_ms: unix_millis(),
            }),
        );
        self.broadcast_room_snapshot(&room_id);
        Ok((room_id, room_code))
    }

    /// Adds `client_id` to the room with `room_code` as a follower. Returns the room id.
    pub fn join_room(&self, client_id: &str, room_code: &str) -> Result<String, RelayError> {
        let code = room_code.trim().to_ascii_uppercase();
        let (room_id, host_id, latest_state, departure) = {
            let mut guard = self.inner.lock();
            let registry = &mut *guard;
            let current_room = registry
                .clients
                .get(client_id)
                .ok_or_else(|| RelayError::UnknownClient(client_id.to_string()))?
                .room_id
                .clone();
            let room_id = registry
                .room_codes
                .get(&code)
                .filter(|room_id| registry.rooms.contains_key(*room_id))
                .cloned()
                .ok_or(RelayError::RoomNotFound)?;

            let departure = if current_room.as_deref() == Some(room_id.as_str()) {
                Departure::NotInRoom
            } else {
                let departure = registry.detach_member(client_id);
                if let Some(room) = registry.rooms.get_mut(&room_id) {
                    room.members.insert(client_id.to_string());
                }
                if let Some(client) = registry.clients.get_mut(client_id) {
                    client.room_id = Some(room_id.clone());
                    client.is_host = false;
                    client.active = true;
                }
                departure
            };

            let room = registry.rooms.get(&room_id).ok_or(RelayError::RoomNotFound)?;
            (
                room_id.clone(),
                room.host_id.clone(),
                room.latest_state.clone(),
                departure,
            )
        };

        self.finish_departure(departure);
        tracing::info!(
            "{LOG_TAG} Client {} joined room {} ({})",
            client_id,
            room_id,
            code
        );

        self.send_to(
            client_id,
            &Envelope::JoinRoomResp(JoinRoomResp {
                room_id: room_id.clone(),
                host_id,
                server_time_ms: unix_millis(),
            }),
        );
        self.broadcast_room_snapshot(&room_id);

        // Late joiners get the current state right away instead of waiting for the host's tick.
        if let Some(state) = latest_state {
            let targets = self.inner.lock().follower_senders(&room_id);
            self.broadcast_host_state(&room_id, state, &targets);
        }
        Ok(room_id)
    }

    /// Removes the client from its room. Returns the id of the room it left.
    pub fn leave_room(&self, client_id: &str) -> Option<String> {
        let departure = self.inner.lock().detach_member(client_id);
        self.finish_departure(departure)
    }

    /// Accepts a host update. Returns the number of followers it was queued for, or `None`
    /// when the sender is not the host of the room the update targets.
    pub fn apply_host_state(&self, client_id: &str, state: HostState) -> Option<usize> {
        let (room_id, targets) = {
            let mut guard = self.inner.lock();
            let registry = &mut *guard;
            let room_id = registry.clients.get(client_id)?.room_id.clone()?;
            if !state.room_id.is_empty() && state.room_id != room_id {
                return None;
            }
            let room = registry.rooms.get_mut(&room_id)?;
            if room.host_id != client_id {
                return None;
            }
            room.latest_state = Some(state.clone());
            room.last_host_state_at = Instant::now();
            let targets = registry.follower_senders(&room_id);
            (room_id, targets)
        };
        Some(self.broadcast_host_state(&room_id, state, &targets))
    }

    /// Records a member's liveness hint. Returns false when the status was ignored.
    pub fn update_member_status(&self, client_id: &str, status: &MemberStatus) -> bool {
        if !status.member_id.is_empty() && status.member_id != client_id {
            return false;
        }
        let mut registry = self.inner.lock();
        let Some(client) = registry.clients.get_mut(client_id) else {
            return false;
        };
        if client.room_id.as_deref() != Some(status.room_id.as_str()) {
            return false;
        }
        client.active = status.active;
        tracing::debug!(
            "{LOG_TAG} Member status room={} member={} active={}",
            status.room_id,
            client_id,
            status.active
        );
        true
    }

    pub fn time_sync(&self, client_id: &str, req: &TimeSyncReq) {
        let t2 = unix_millis();
        let t3 = unix_millis();
        self.send_to(
            client_id,
            &Envelope::TimeSyncResp(TimeSyncResp {
                t1_local_ms: req.t1_local_ms,
                t2_server_ms: t2,
                t3_server_ms: t3,
                server_time_ms: t3,
            }),
        );
    }

    pub fn room_snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.inner.lock().snapshot(room_id).map(|(snapshot, _)| snapshot)
    }

    /// Closes every room whose host has been silent for the idle timeout. Returns closed ids.
    pub fn reap_idle_rooms(&self, now: Instant) -> Vec<String> {
        let Some(timeout) = self.host_idle_timeout else {
            return Vec::new();
        };
        let closed: Vec<(String, Vec<ClientSender>)> = {
            let mut guard = self.inner.lock();
            let registry = &mut *guard;
            let idle: Vec<String> = registry
                .rooms
                .values()
                .filter(|room| now.saturating_duration_since(room.last_host_state_at) >= timeout)
                .map(|room| room.id.clone())
                .collect();
            idle.into_iter()
                .filter_map(|room_id| registry.close_room(&room_id).map(|members| (room_id, members)))
                .collect()
        };

        if closed.is_empty() {
            return Vec::new();
        }
        let frame = encode(&error_envelope(ROOM_CLOSED_HOST_IDLE));
        closed
            .into_iter()
            .map(|(room_id, members)| {
                if let Some(frame) = &frame {
                    deliver(&members, frame);
                }
                tracing::info!("{LOG_TAG} Room {} closed (host idle)", room_id);
                room_id
            })
            .collect()
    }

    /// Background duty: runs the idle reaper on a fixed tick until cancelled.
    pub async fn run_idle_reaper(self, shutdown: CancellationToken) {
        if self.host_idle_timeout.is_none() {
            tracing::info!("{LOG_TAG} Host idle reaping disabled");
            return;
        }
        let mut ticker = tokio::time::interval(HOST_IDLE_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_idle_rooms(Instant::now());
                }
            }
        }
    }

    fn finish_departure(&self, departure: Departure) -> Option<String> {
        match departure {
            Departure::NotInRoom => None,
            Departure::RoomEmptied { room_id } => {
                tracing::info!("{LOG_TAG} Room {} deleted (empty)", room_id);
                Some(room_id)
            }
            Departure::HostLeft { room_id, remaining } => {
                if let Some(frame) = encode(&error_envelope(ROOM_CLOSED_HOST_LEFT)) {
                    deliver(&remaining, &frame);
                }
                tracing::info!(
                    "{LOG_TAG} Room {} closed (host left), {} members notified",
                    room_id,
                    remaining.len()
                );
                Some(room_id)
            }
            Departure::MemberLeft { room_id } => {
                tracing::info!("{LOG_TAG} Member left room {}", room_id);
                self.broadcast_room_snapshot(&room_id);
                Some(room_id)
            }
        }
    }

    fn broadcast_room_snapshot(&self, room_id: &str) -> usize {
        let Some((snapshot, targets)) = self.inner.lock().snapshot(room_id) else {
            return 0;
        };
        let Some(frame) = encode(&Envelope::RoomSnapshot(snapshot)) else {
            return 0;
        };
        let count = deliver(&targets, &frame);
        tracing::debug!("{LOG_TAG} Room snapshot room={} members={}", room_id, count);
        count
    }

    fn broadcast_host_state(&self, room_id: &str, state: HostState, targets: &[ClientSender]) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let envelope = Envelope::BroadcastState(BroadcastState {
            state,
            server_time_ms: unix_millis(),
        });
        let Some(frame) = encode(&envelope) else {
            return 0;
        };
        let count = deliver(targets, &frame);
        tracing::debug!("{LOG_TAG} Broadcast state room={} followers={}", room_id, count);
        count
    }
}

impl Registry {
    /// Removes the client from its room under the lock and reports what must happen next.
    fn detach_member(&mut self, client_id: &str) -> Departure {
        let Some(room_id) = self
            .clients
            .get_mut(client_id)
            .and_then(|client| client.room_id.take())
        else {
            return Departure::NotInRoom;
        };
        if let Some(client) = self.clients.get_mut(client_id) {
            client.is_host = false;
        }

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Departure::NotInRoom;
        };
        room.members.remove(client_id);
        let was_host = room.host_id == client_id;

        if room.members.is_empty() {
            self.close_room(&room_id);
            return Departure::RoomEmptied { room_id };
        }
        if was_host {
            let remaining = self.close_room(&room_id).unwrap_or_default();
            return Departure::HostLeft { room_id, remaining };
        }
        Departure::MemberLeft { room_id }
    }

    /// Deletes a room and detaches its members. Returns the members' senders.
    fn close_room(&mut self, room_id: &str) -> Option<Vec<ClientSender>> {
        let room = self.rooms.remove(room_id)?;
        self.room_codes.remove(&room.code);
        let senders = room
            .members
            .iter()
            .filter_map(|member_id| {
                let client = self.clients.get_mut(member_id)?;
                client.room_id = None;
                client.is_host = false;
                Some(client.sender.clone())
            })
            .collect();
        Some(senders)
    }

    /// Active members other than the host.
    fn follower_senders(&self, room_id: &str) -> Vec<ClientSender> {
        let Some(room) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter(|member_id| **member_id != room.host_id)
            .filter_map(|member_id| self.clients.get(member_id))
            .filter(|client| client.active)
            .map(|client| client.sender.clone())
            .collect()
    }

    fn snapshot(&self, room_id: &str) -> Option<(RoomSnapshot, Vec<ClientSender>)> {
        let room = self.rooms.get(room_id)?;
        let mut members = Vec::with_capacity(room.members.len());
        let mut targets = Vec::with_capacity(room.members.len());
        for member_id in &room.members {
            let Some(client) = self.clients.get(member_id) else {
                continue;
            };
            members.push(Member {
                member_id: member_id.clone(),
                display_name: client.display_name.clone(),
                is_host: *member_id == room.host_id,
            });
            targets.push(client.sender.clone());
        }
        members.sort_by(|a, b| {
            b.is_host
                .cmp(&a.is_host)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        let snapshot = RoomSnapshot {
            room_id: room.id.clone(),
            room_code: room.code.clone(),
            host_id: room.host_id.clone(),
            members,
            latest_state: room.latest_state.clone(),
            server_time_ms: unix_millis(),
        };
        Some((snapshot, targets))
    }

    fn unique_room_code(&self) -> String {
        loop {
            let code = random_room_code();
            if !self.room_codes.contains_key(&code) {
                break code;
            }
        }
    }
}

fn encode(envelope: &Envelope) -> Option<Frame> {
    match envelope.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!("{LOG_TAG} Failed to encode {}: {}", envelope.kind(), e);
            None
        }
    }
}

/// Hands a frame to each queue without waiting; full queues drop the frame.
fn deliver(targets: &[ClientSender], frame: &Frame) -> usize {
    let mut delivered = 0;
    for sender in targets {
        match sender.try_send(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("{LOG_TAG} Outbound queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
    delivered
}

fn error_envelope(message: &str) -> Envelope {
    Envelope::ErrorResp(ErrorResp {
        message: message.to_string(),
        server_time_ms: unix_millis(),
    })
}

fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn random_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

fn sanitize_display_name(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|ch| !ch.is_control())
        .take(MAX_DISPLAY_NAME)
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn default_display_name(client_id: &str) -> String {
    let short: String = client_id.chars().take(8).collect();
    format!("guest-{short}")
}
