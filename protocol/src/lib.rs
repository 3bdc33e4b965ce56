//! Wire types shared by the tandem relay and its clients.

pub mod clock;
mod envelope;

pub use clock::{best_estimate, compute_offset_delay, unix_millis, ClockEstimate, ClockSample};
pub use envelope::{
    BroadcastState, ClientHello, CreateRoomReq, CreateRoomResp, Envelope, ErrorResp, HostState,
    JoinRoomReq, JoinRoomResp, LeaveRoomReq, MediaInfo, Member, MemberStatus, ProtocolError,
    RoomSnapshot, ServerHello, TimeSyncReq, TimeSyncResp, MAX_FRAME_BYTES, PAGE_ONLY_ATTR,
};
