// src/core/protocol/mod.rs

//! The game wire protocol: fixed-layout message headers, the frame codec,
//! and the fixed payload layouts exchanged during handshake and join.

mod frame;
mod io;
mod payloads;

pub use frame::{Frame, FrameClass, FrameCodec, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use io::{read_frame, write_frame};
pub use payloads::{
    Credentials, NICKNAME_LEN, PASSWORD_LEN, STREAM_NAME_LEN, StreamRegistration, UNIQUE_ID_LEN,
    UserInfoPayload,
};

/// Protocol version string exchanged in the `Hello` frame. A client with a
/// different version is rejected during the handshake.
pub const PROTOCOL_VERSION: &str = "RELAY-4";

/// `source_uid` value for frames originating from the server itself.
pub const SERVER_UID: u32 = u32::MAX;

/// All message types understood by the core. The wire encoding is the
/// discriminant as a little-endian u32; unknown values survive decoding as
/// raw numbers so that the dispatcher can log and drop them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Client -> server: protocol version handshake.
    Hello = 1001,
    /// Server -> client: admission rejected, no free slot.
    Full = 1002,
    /// Server -> client: wrong server password.
    WrongPassword = 1003,
    /// Server -> client: peer address is on the ban list.
    Banned = 1004,
    /// Server -> client: admission accepted; payload is the colour number.
    Welcome = 1005,
    /// Client -> server: username, unique id and password digest.
    UserCredentials = 1006,
    /// Client -> server: ready to receive stream traffic.
    EnableFlow = 1007,
    /// Server -> client: protocol version mismatch during handshake.
    WrongVersion = 1008,
    /// Server -> clients: a new client joined; payload is `UserInfoPayload`.
    UserJoin = 1020,
    /// Server -> clients: a client left cleanly.
    UserLeave = 1021,
    /// Server -> client: join-state replay; payload is `UserInfoPayload`.
    UserInfo = 1022,
    /// Both directions: errored teardown (server) or leave request (client).
    Delete = 1023,
    /// Client -> server, relayed: a new stream was registered.
    StreamRegister = 1030,
    /// Client -> server, relayed: opaque stream payload.
    StreamData = 1031,
    /// Client -> server, relayed: vehicle state; carries the position hint.
    VehicleData = 1032,
    /// Chat line, relayed to everyone or intercepted as a `!` command.
    Chat = 1040,
    /// Private chat; first four payload bytes are the target uid.
    PrivChat = 1041,
    /// Server -> client: scripted game command.
    GameCmd = 1042,
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1001 => Self::Hello,
            1002 => Self::Full,
            1003 => Self::WrongPassword,
            1004 => Self::Banned,
            1005 => Self::Welcome,
            1006 => Self::UserCredentials,
            1007 => Self::EnableFlow,
            1008 => Self::WrongVersion,
            1020 => Self::UserJoin,
            1021 => Self::UserLeave,
            1022 => Self::UserInfo,
            1023 => Self::Delete,
            1030 => Self::StreamRegister,
            1031 => Self::StreamData,
            1032 => Self::VehicleData,
            1040 => Self::Chat,
            1041 => Self::PrivChat,
            1042 => Self::GameCmd,
            _ => return None,
        })
    }
}

impl From<MessageType> for u32 {
    fn from(ty: MessageType) -> u32 {
        ty as u32
    }
}
