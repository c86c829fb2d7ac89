// src/core/protocol/payloads.rs

//! Fixed-layout payloads carried inside frames during handshake and join.
//!
//! All of these are C-style structs on the wire: little-endian integers and
//! fixed-width, NUL-padded byte fields. Strings are length-checked at encode
//! time; anything longer than its wire field is truncated there, never
//! patched up after the fact.

use crate::core::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire size of the nickname field.
pub const NICKNAME_LEN: usize = 20;
/// Wire size of the opaque user token field.
pub const UNIQUE_ID_LEN: usize = 60;
/// Wire size of the password digest field.
pub const PASSWORD_LEN: usize = 40;
/// Wire size of a stream name.
pub const STREAM_NAME_LEN: usize = 128;

/// Writes `s` into a fixed-width field, truncating and NUL-padding.
fn put_fixed_str(dst: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    dst.extend_from_slice(&bytes[..n]);
    dst.put_bytes(0, width - n);
}

/// Reads a fixed-width field, stopping at the first NUL.
fn get_fixed_str(src: &mut Bytes, width: usize) -> Result<String, RelayError> {
    if src.len() < width {
        return Err(RelayError::MalformedPayload(format!(
            "fixed field needs {width} bytes, {} left",
            src.len()
        )));
    }
    let field = src.split_to(width);
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// Credentials supplied by the client right after the version handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub unique_id: String,
    /// Digest of the server password; empty when the server is open.
    pub password: String,
}

impl Credentials {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NICKNAME_LEN + UNIQUE_ID_LEN + PASSWORD_LEN);
        put_fixed_str(&mut buf, &self.username, NICKNAME_LEN);
        put_fixed_str(&mut buf, &self.unique_id, UNIQUE_ID_LEN);
        put_fixed_str(&mut buf, &self.password, PASSWORD_LEN);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, RelayError> {
        Ok(Self {
            username: get_fixed_str(&mut payload, NICKNAME_LEN)?,
            unique_id: get_fixed_str(&mut payload, UNIQUE_ID_LEN)?,
            password: get_fixed_str(&mut payload, PASSWORD_LEN)?,
        })
    }
}

/// Payload of `UserJoin` and `UserInfo` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfoPayload {
    pub version: u32,
    pub slot: u32,
    pub colour: u32,
    pub auth: u32,
    pub nickname: String,
}

impl UserInfoPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + NICKNAME_LEN);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.slot);
        buf.put_u32_le(self.colour);
        buf.put_u32_le(self.auth);
        put_fixed_str(&mut buf, &self.nickname, NICKNAME_LEN);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, RelayError> {
        if payload.len() < 16 + NICKNAME_LEN {
            return Err(RelayError::MalformedPayload(format!(
                "user info payload too short: {} bytes",
                payload.len()
            )));
        }
        let version = payload.get_u32_le();
        let slot = payload.get_u32_le();
        let colour = payload.get_u32_le();
        let auth = payload.get_u32_le();
        let nickname = get_fixed_str(&mut payload, NICKNAME_LEN)?;
        Ok(Self {
            version,
            slot,
            colour,
            auth,
            nickname,
        })
    }
}

/// A stream registration record as announced by `StreamRegister` frames and
/// kept per client afterwards.
///
/// Known kinds: 0 = truck, 1 = character, 2 = aitraffic, 3 = chat. Other
/// values are preserved and relayed untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRegistration {
    pub kind: i32,
    pub status: i32,
    /// Sanitised name: spaces converted to NUL, last byte always NUL.
    pub name: [u8; STREAM_NAME_LEN],
}

impl StreamRegistration {
    pub fn new(kind: i32, status: i32, name: &str) -> Self {
        let mut reg = Self {
            kind,
            status,
            name: [0u8; STREAM_NAME_LEN],
        };
        let bytes = name.as_bytes();
        let n = bytes.len().min(STREAM_NAME_LEN - 1);
        reg.name[..n].copy_from_slice(&bytes[..n]);
        reg.sanitise();
        reg
    }

    /// Converts spaces to NUL and forces the terminator, matching what game
    /// clients expect of the relayed record.
    pub fn sanitise(&mut self) {
        for b in self.name.iter_mut() {
            if *b == b' ' {
                *b = 0;
            }
        }
        self.name[STREAM_NAME_LEN - 1] = 0;
    }

    /// The name up to the first NUL, for logs and the roster snapshot.
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STREAM_NAME_LEN);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            0 => "truck",
            1 => "character",
            2 => "aitraffic",
            3 => "chat",
            _ => "unknown",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + STREAM_NAME_LEN);
        buf.put_i32_le(self.kind);
        buf.put_i32_le(self.status);
        buf.extend_from_slice(&self.name);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, RelayError> {
        if payload.len() < 8 + STREAM_NAME_LEN {
            return Err(RelayError::MalformedPayload(format!(
                "stream register payload too short: {} bytes",
                payload.len()
            )));
        }
        let kind = payload.get_i32_le();
        let status = payload.get_i32_le();
        let mut name = [0u8; STREAM_NAME_LEN];
        name.copy_from_slice(&payload[..STREAM_NAME_LEN]);
        let mut reg = Self { kind, status, name };
        reg.sanitise();
        Ok(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_round_trip() {
        let creds = Credentials {
            username: "alice".into(),
            unique_id: "token-123".into(),
            password: String::new(),
        };
        let decoded = Credentials::decode(creds.encode()).unwrap();
        assert_eq!(decoded, creds);
    }

    #[test]
    fn long_username_truncates_to_wire_field() {
        let creds = Credentials {
            username: "x".repeat(64),
            unique_id: String::new(),
            password: String::new(),
        };
        let decoded = Credentials::decode(creds.encode()).unwrap();
        assert_eq!(decoded.username.len(), NICKNAME_LEN);
    }

    #[test]
    fn stream_name_spaces_become_nul() {
        let reg = StreamRegistration::new(0, 0, "big rig.truck");
        assert_eq!(reg.name_str(), "big");
        assert_eq!(reg.name[STREAM_NAME_LEN - 1], 0);
        assert_eq!(reg.kind_str(), "truck");
    }

    #[test]
    fn user_info_round_trip() {
        let info = UserInfoPayload {
            version: 1,
            slot: 2,
            colour: 3,
            auth: 0x03,
            nickname: "bob".into(),
        };
        assert_eq!(UserInfoPayload::decode(info.encode()).unwrap(), info);
    }
}
