use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Largest frame either peer will decode.
pub const MAX_FRAME_BYTES: usize = 2 << 20;

/// Media attribute marking a host update that carries no playback state.
pub const PAGE_ONLY_ATTR: &str = "page_only";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Messages exchanged between clients and the relay, one per binary frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    // Client -> Server
    ClientHello(ClientHello),
    CreateRoomReq(CreateRoomReq),
    JoinRoomReq(JoinRoomReq),
    LeaveRoomReq(LeaveRoomReq),
    MemberStatus(MemberStatus),
    HostState(HostState),
    TimeSyncReq(TimeSyncReq),

    // Server -> Client
    ServerHello(ServerHello),
    CreateRoomResp(CreateRoomResp),
    JoinRoomResp(JoinRoomResp),
    BroadcastState(BroadcastState),
    RoomSnapshot(RoomSnapshot),
    TimeSyncResp(TimeSyncResp),
    ErrorResp(ErrorResp),
}

fn codec() -> impl Options {
    bincode::options().with_limit(MAX_FRAME_BYTES as u64)
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        codec().serialize(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(frame.len()));
        }
        codec().deserialize(frame).map_err(ProtocolError::Decode)
    }

    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ClientHello(_) => "client_hello",
            Envelope::CreateRoomReq(_) => "create_room_req",
            Envelope::JoinRoomReq(_) => "join_room_req",
            Envelope::LeaveRoomReq(_) => "leave_room_req",
            Envelope::MemberStatus(_) => "member_status",
            Envelope::HostState(_) => "host_state",
            Envelope::TimeSyncReq(_) => "time_sync_req",
            Envelope::ServerHello(_) => "server_hello",
            Envelope::CreateRoomResp(_) => "create_room_resp",
            Envelope::JoinRoomResp(_) => "join_room_resp",
            Envelope::BroadcastState(_) => "broadcast_state",
            Envelope::RoomSnapshot(_) => "room_snapshot",
            Envelope::TimeSyncResp(_) => "time_sync_resp",
            Envelope::ErrorResp(_) => "error_resp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_name: String,
    pub client_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    pub client_id: String,
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRoomReq {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRoomResp {
    pub room_id: String,
    pub room_code: String,
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomReq {
    pub client_id: String,
    pub room_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomResp {
    pub room_id: String,
    pub host_id: String,
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRoomReq {
    pub client_id: String,
    pub room_id: String,
}

/// Liveness hint a member reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub room_id: String,
    pub member_id: String,
    pub active: bool,
}

/// Media currently loaded by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaInfo {
    pub url: String,
    pub title: String,
    pub site: String,
    pub attrs: HashMap<String, String>,
}

impl MediaInfo {
    pub fn is_page_only(&self) -> bool {
        self.attrs.get(PAGE_ONLY_ATTR).map(String::as_str) == Some("1")
    }
}

/// Authoritative playback sample published by a room's host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub room_id: String,
    pub host_id: String,
    pub seq: u64,
    pub position_ms: i64,
    pub rate: f64,
    pub paused: bool,
    /// Server-clock time at which the sample was taken.
    pub sample_server_time_ms: i64,
    /// Static offset configured by the host, added to the position by followers.
    pub offset_ms: i64,
    pub media: Option<MediaInfo>,
}

impl HostState {
    /// True when the update only advertises a page and carries no playback state.
    pub fn is_page_only(&self) -> bool {
        self.media.as_ref().is_some_and(MediaInfo::is_page_only)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastState {
    pub state: HostState,
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub display_name: String,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub room_code: String,
    pub host_id: String,
    pub members: Vec<Member>,
    pub latest_state: Option<HostState>,
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncReq {
    pub t1_local_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncResp {
    pub t1_local_ms: i64,
    pub t2_server_ms: i64,
    pub t3_server_ms: i64,
    pub server_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResp {
    pub message: String,
    pub server_time_ms: i64,
}
