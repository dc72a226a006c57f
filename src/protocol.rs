//! Wire protocol
//!
//! Control messages travel as JSON text frames, discriminated by `type`.
//! Audio travels as binary frames:
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────────────┐
//! │ freqId (i32) │ seq (u32)    │ Opus frame (20 ms)    │
//! │ big-endian   │ big-endian   │ variable length       │
//! └──────────────┴──────────────┴───────────────────────┘
//!   bytes 0..4     bytes 4..8     bytes 8..
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Size of the binary audio header
pub const AUDIO_HEADER_LEN: usize = 8;

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Auth {
        discord_user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        freq_id: Option<i32>,
        guild_id: String,
        auth_token: String,
    },
    #[serde(rename_all = "camelCase")]
    Join { freq_id: i32 },
    #[serde(rename_all = "camelCase")]
    Leave { freq_id: i32 },
    #[serde(rename_all = "camelCase")]
    Mute { freq_id: i32 },
    #[serde(rename_all = "camelCase")]
    Unmute { freq_id: i32 },
    Ping,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Remote transmission state carried by `rx`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum RxAction {
    Start,
    Stop,
    #[default]
    Unknown,
}

impl From<String> for RxAction {
    fn from(action: String) -> Self {
        match action.as_str() {
            "start" => RxAction::Start,
            "stop" => RxAction::Stop,
            _ => RxAction::Unknown,
        }
    }
}

/// Messages sent by the relay
///
/// Fields the relay may omit default to empty values. Message types this
/// client does not know decode to [`ServerMessage::Unknown`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AuthOk {
        #[serde(default)]
        session_token: Option<String>,
    },
    #[serde(alias = "auth_fail")]
    AuthError {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinOk {
        freq_id: i32,
        #[serde(default)]
        listener_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    ListenerUpdate {
        freq_id: i32,
        #[serde(default)]
        listener_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    MuteOk {
        freq_id: i32,
        #[serde(default)]
        muted: bool,
    },
    #[serde(rename_all = "camelCase")]
    Rx {
        #[serde(default)]
        discord_user_id: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        freq_id: i32,
        #[serde(default)]
        action: RxAction,
    },
    Pong,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One encoded voice frame with its routing header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub freq_id: i32,
    pub sequence: u32,
    pub payload: Bytes,
}

impl AudioPacket {
    pub fn new(freq_id: i32, sequence: u32, payload: Bytes) -> Self {
        Self {
            freq_id,
            sequence,
            payload,
        }
    }

    /// Serialize header and payload into one binary frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_LEN + self.payload.len());
        buf.put_i32(self.freq_id);
        buf.put_u32(self.sequence);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a binary frame. A frame must carry at least one payload byte.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() <= AUDIO_HEADER_LEN {
            return Err(ProtocolError::PacketTooShort(frame.len()));
        }
        let mut header = &frame[..AUDIO_HEADER_LEN];
        let freq_id = header.get_i32();
        let sequence = header.get_u32();
        Ok(Self {
            freq_id,
            sequence,
            payload: Bytes::copy_from_slice(&frame[AUDIO_HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_extremes_survive() {
        let packet = AudioPacket::new(-7, u32::MAX, Bytes::from_static(&[0xF8, 0xFF, 0xFE]));
        let decoded = AudioPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.freq_id, -7);
        assert_eq!(decoded.sequence, 4_294_967_295);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_header_is_big_endian() {
        let frame = AudioPacket::new(0x0102_0304, 0x0A0B_0C0D, Bytes::from_static(b"x")).encode();
        assert_eq!(&frame[..8], &[1, 2, 3, 4, 0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&frame[8..], b"x");
    }

    #[test]
    fn test_header_only_frame_rejected() {
        assert!(matches!(
            AudioPacket::decode(&[0u8; 8]),
            Err(ProtocolError::PacketTooShort(8))
        ));
        assert!(AudioPacket::decode(&[]).is_err());
    }

    #[test]
    fn test_auth_wire_fields() {
        let msg = ClientMessage::Auth {
            discord_user_id: "42".into(),
            freq_id: None,
            guild_id: "g1".into(),
            auth_token: "secret".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "auth", "discordUserId": "42", "guildId": "g1", "authToken": "secret"})
        );
    }

    #[test]
    fn test_frequency_requests() {
        let join = ClientMessage::Join { freq_id: 101 }.to_json().unwrap();
        assert_eq!(join, r#"{"type":"join","freqId":101}"#);
        let unmute = ClientMessage::Unmute { freq_id: -3 }.to_json().unwrap();
        assert_eq!(unmute, r#"{"type":"unmute","freqId":-3}"#);
        assert_eq!(ClientMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_parse_server_messages() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"auth_ok","sessionToken":"t-1"}"#).unwrap(),
            ServerMessage::AuthOk {
                session_token: Some("t-1".into())
            }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"auth_fail","reason":"banned"}"#).unwrap(),
            ServerMessage::AuthError {
                reason: Some("banned".into())
            }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"join_ok","freqId":5,"listenerCount":3}"#).unwrap(),
            ServerMessage::JoinOk {
                freq_id: 5,
                listener_count: 3
            }
        );
        assert_eq!(
            ServerMessage::parse(
                r#"{"type":"rx","discordUserId":"9","freqId":5,"action":"stop"}"#
            )
            .unwrap(),
            ServerMessage::Rx {
                discord_user_id: "9".into(),
                username: None,
                freq_id: 5,
                action: RxAction::Stop,
            }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"roster","users":[]}"#).unwrap(),
            ServerMessage::Unknown
        );
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(ServerMessage::parse("{not json").is_err());
        assert!(ServerMessage::parse(r#"{"type":"join_ok"}"#).is_err());
    }
}
