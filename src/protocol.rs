//! Game Server Wire Protocol
//!
//! Single responsibility: Encode and decode messages in the server's text wire format.
//!
//! # Wire Format
//!
//! Every frame is UTF-8 text: the message kind name, a newline, then the payload.
//!
//! ```text
//! Ping
//! {"pingTime":"2024-05-01T12:00:00.000Z","pingMs":0,"currentLatencyEstimate":"+00:00:00.025","currentServerTimeOffsetEstimate":"-00:00:01.250"}
//! ```
//!
//! Payload keys are lower camel case. Timestamps are ISO-8601 UTC with millisecond
//! precision; durations are timespan strings `[+|-][d.]hh:mm:ss.fff`.
//!
//! Warning and error payloads are forwarded as text without interpretation.

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LinkError, Result};

/// Kinds of message understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RequestAuthentication,
    PlayerAuthenticated,
    PlayerNotAuthenticated,
    WarningMessage,
    ErrorMessage,
    Ping,
    Pong,
    Invalid,
}

/// Name <-> kind table. The only place kind names are spelled out.
const KIND_TABLE: [(&str, MessageKind); 7] = [
    ("RequestAuthentication", MessageKind::RequestAuthentication),
    ("PlayerAuthenticated", MessageKind::PlayerAuthenticated),
    ("PlayerNotAuthenticated", MessageKind::PlayerNotAuthenticated),
    ("WarningMessage", MessageKind::WarningMessage),
    ("ErrorMessage", MessageKind::ErrorMessage),
    ("Ping", MessageKind::Ping),
    ("Pong", MessageKind::Pong),
];

const INVALID_NAME: &str = "INVALID";

impl MessageKind {
    /// All kinds that can appear on the wire.
    pub const ALL: [MessageKind; 7] = [
        MessageKind::RequestAuthentication,
        MessageKind::PlayerAuthenticated,
        MessageKind::PlayerNotAuthenticated,
        MessageKind::WarningMessage,
        MessageKind::ErrorMessage,
        MessageKind::Ping,
        MessageKind::Pong,
    ];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        KIND_TABLE
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(name, _)| *name)
            .unwrap_or(INVALID_NAME)
    }

    /// Look up a kind by wire name. Unknown names map to `Invalid`.
    pub fn from_name(name: &str) -> Self {
        KIND_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, kind)| *kind)
            .unwrap_or(MessageKind::Invalid)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Client -> server: identify the player on a fresh connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAuthenticationPayload {
    pub player_name: String,
    #[serde(rename = "playerID")]
    pub player_id: String,
    pub game_version: String,
}

/// Server -> client: the player was accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerAuthenticatedPayload {
    pub player_name: String,
    #[serde(rename = "playerID")]
    pub player_id: String,
}

/// Client -> server: latency probe. Carries the last known estimates for
/// server-side diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    #[serde(with = "iso8601")]
    pub ping_time: DateTime<Utc>,
    pub ping_ms: i32,
    #[serde(with = "timespan")]
    pub current_latency_estimate: TimeDelta,
    #[serde(with = "timespan")]
    pub current_server_time_offset_estimate: TimeDelta,
}

/// Server -> client: answer to a ping, echoing its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    #[serde(with = "iso8601")]
    pub ping_time: DateTime<Utc>,
    #[serde(with = "iso8601")]
    pub pong_time: DateTime<Utc>,
}

/// A typed message: one variant per wire kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RequestAuthentication(RequestAuthenticationPayload),
    PlayerAuthenticated(PlayerAuthenticatedPayload),
    PlayerNotAuthenticated(serde_json::Value),
    WarningMessage(String),
    ErrorMessage(String),
    Ping(PingPayload),
    Pong(PongPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RequestAuthentication(_) => MessageKind::RequestAuthentication,
            Message::PlayerAuthenticated(_) => MessageKind::PlayerAuthenticated,
            Message::PlayerNotAuthenticated(_) => MessageKind::PlayerNotAuthenticated,
            Message::WarningMessage(_) => MessageKind::WarningMessage,
            Message::ErrorMessage(_) => MessageKind::ErrorMessage,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
        }
    }

    /// Encode into a wire frame.
    pub fn encode(&self) -> Result<String> {
        match self {
            Message::RequestAuthentication(payload) => encode(self.kind(), payload),
            Message::PlayerAuthenticated(payload) => encode(self.kind(), payload),
            Message::PlayerNotAuthenticated(value) => encode(self.kind(), value),
            Message::WarningMessage(text) | Message::ErrorMessage(text) => {
                Ok(frame(self.kind(), text))
            }
            Message::Ping(payload) => encode(self.kind(), payload),
            Message::Pong(payload) => encode(self.kind(), payload),
        }
    }

    /// Decode a complete wire frame.
    ///
    /// # Errors
    /// - The kind line names no known kind
    /// - The payload is not valid for the kind
    pub fn decode(raw: &str) -> Result<Self> {
        let parts = split(raw);
        Self::from_parts(parts.kind, parts.payload)
    }

    /// Decode the payload of an already-split frame.
    pub fn from_parts(kind: MessageKind, payload: &str) -> Result<Self> {
        let message = match kind {
            MessageKind::RequestAuthentication => {
                Message::RequestAuthentication(decode_payload(payload)?)
            }
            MessageKind::PlayerAuthenticated => {
                Message::PlayerAuthenticated(decode_payload(payload)?)
            }
            MessageKind::PlayerNotAuthenticated => {
                if payload.trim().is_empty() {
                    Message::PlayerNotAuthenticated(serde_json::json!({}))
                } else {
                    Message::PlayerNotAuthenticated(decode_payload(payload)?)
                }
            }
            MessageKind::WarningMessage => Message::WarningMessage(payload.to_string()),
            MessageKind::ErrorMessage => Message::ErrorMessage(payload.to_string()),
            MessageKind::Ping => Message::Ping(decode_payload(payload)?),
            MessageKind::Pong => Message::Pong(decode_payload(payload)?),
            MessageKind::Invalid => {
                return Err(LinkError::Protocol("Unrecognised message kind".into()))
            }
        };
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// A wire frame split into its kind line and payload text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: MessageKind,
    pub kind_name: &'a str,
    pub payload: &'a str,
}

/// Split a raw frame at the first newline.
///
/// A frame without a newline has no payload section and decodes as `Invalid`,
/// whatever its text.
pub fn split(raw: &str) -> Frame<'_> {
    match raw.split_once('\n') {
        Some((kind_line, payload)) => {
            let kind_name = kind_line.trim();
            Frame {
                kind: MessageKind::from_name(kind_name),
                kind_name,
                payload,
            }
        }
        None => Frame {
            kind: MessageKind::Invalid,
            kind_name: raw.trim(),
            payload: "",
        },
    }
}

/// Encode a serializable payload under the given kind.
pub fn encode<T: Serialize + ?Sized>(kind: MessageKind, payload: &T) -> Result<String> {
    let json = serde_json::to_string(payload)?;
    Ok(frame(kind, &json))
}

/// Decode a JSON payload into its typed form.
pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T> {
    Ok(serde_json::from_str(payload)?)
}

/// Encode a kind with an empty JSON object as payload.
pub fn encode_empty(kind: MessageKind) -> String {
    frame(kind, "{}")
}

fn frame(kind: MessageKind, payload: &str) -> String {
    format!("{}\n{}", kind.as_str(), payload)
}

// ---------------------------------------------------------------------------
// Field formats
// ---------------------------------------------------------------------------

/// ISO-8601 UTC timestamps with millisecond precision.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|time| time.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Signed durations as `[+|-][d.]hh:mm:ss.fff`.
pub mod timespan {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(span: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*span))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn format(span: TimeDelta) -> String {
        let sign = if span < TimeDelta::zero() { '-' } else { '+' };
        let total_ms = span.num_milliseconds().unsigned_abs();
        let millis = total_ms % 1000;
        let total_secs = total_ms / 1000;
        let secs = total_secs % 60;
        let minutes = (total_secs / 60) % 60;
        let hours = (total_secs / 3600) % 24;
        let days = total_secs / 86_400;

        if days > 0 {
            format!("{sign}{days}.{hours:02}:{minutes:02}:{secs:02}.{millis:03}")
        } else {
            format!("{sign}{hours:02}:{minutes:02}:{secs:02}.{millis:03}")
        }
    }

    pub fn parse(raw: &str) -> Result<TimeDelta, String> {
        let raw = raw.trim();
        let (negative, rest) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix('+').unwrap_or(raw)),
        };

        let fields: Vec<&str> = rest.split(':').collect();
        let &[day_hours, minutes, seconds] = fields.as_slice() else {
            return Err(format!("Malformed timespan: {raw}"));
        };

        let (days, hours) = match day_hours.split_once('.') {
            Some((days, hours)) => (number(days, raw)?, number(hours, raw)?),
            None => (0, number(day_hours, raw)?),
        };
        let minutes = number(minutes, raw)?;
        let (secs, millis) = match seconds.split_once('.') {
            Some((secs, fraction)) => (number(secs, raw)?, fraction_millis(fraction, raw)?),
            None => (number(seconds, raw)?, 0),
        };

        let total = days
            .checked_mul(24)
            .and_then(|h| h.checked_add(hours))
            .and_then(|h| h.checked_mul(60))
            .and_then(|m| m.checked_add(minutes))
            .and_then(|m| m.checked_mul(60))
            .and_then(|s| s.checked_add(secs))
            .and_then(|s| s.checked_mul(1000))
            .and_then(|ms| ms.checked_add(millis))
            .ok_or_else(|| format!("Timespan out of range: {raw}"))?;
        let total = if negative { -total } else { total };
        TimeDelta::try_milliseconds(total).ok_or_else(|| format!("Timespan out of range: {raw}"))
    }

    fn number(field: &str, raw: &str) -> Result<i64, String> {
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("Malformed timespan: {raw}"));
        }
        field.parse().map_err(|_| format!("Malformed timespan: {raw}"))
    }

    fn fraction_millis(fraction: &str, raw: &str) -> Result<i64, String> {
        let digits: String = fraction.chars().take(3).collect();
        let value = number(&digits, raw)?;
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("Malformed timespan: {raw}"));
        }
        Ok(value * 10_i64.pow(3 - digits.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_714_564_800_000 + ms).unwrap()
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_name(kind.as_str()), kind);
        }
        assert_eq!(MessageKind::Ping.as_str(), "Ping");
        assert_eq!(MessageKind::Invalid.as_str(), "INVALID");
    }

    #[test]
    fn test_unknown_kind_is_invalid() {
        assert_eq!(MessageKind::from_name("Handshake"), MessageKind::Invalid);
        assert_eq!(MessageKind::from_name(""), MessageKind::Invalid);
        assert_eq!(MessageKind::from_name("ping"), MessageKind::Invalid);
    }

    #[test]
    fn test_split_at_first_newline() {
        let parts = split("WarningMessage\nline one\nline two");
        assert_eq!(parts.kind, MessageKind::WarningMessage);
        assert_eq!(parts.payload, "line one\nline two");

        let bare = split("Pong");
        assert_eq!(bare.kind, MessageKind::Invalid);
        assert_eq!(bare.kind_name, "Pong");
        assert_eq!(bare.payload, "");

        let crlf = split("Pong\r\n{}");
        assert_eq!(crlf.kind, MessageKind::Pong);
        assert_eq!(crlf.payload, "{}");
    }

    #[test]
    fn test_encode_request_authentication_keys() {
        let raw = Message::RequestAuthentication(RequestAuthenticationPayload {
            player_name: "Ada".into(),
            player_id: "p-1".into(),
            game_version: "1.2.0".into(),
        })
        .encode()
        .unwrap();

        let (kind, json) = raw.split_once('\n').unwrap();
        assert_eq!(kind, "RequestAuthentication");
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["playerName"], "Ada");
        assert_eq!(value["playerID"], "p-1");
        assert_eq!(value["gameVersion"], "1.2.0");
    }

    #[test]
    fn test_ping_payload_formats() {
        let raw = Message::Ping(PingPayload {
            ping_time: at(250),
            ping_ms: 250,
            current_latency_estimate: TimeDelta::milliseconds(25),
            current_server_time_offset_estimate: TimeDelta::milliseconds(-1250),
        })
        .encode()
        .unwrap();

        let json = raw.split_once('\n').unwrap().1;
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["pingTime"], "2024-05-01T12:00:00.250Z");
        assert_eq!(value["pingMs"], 250);
        assert_eq!(value["currentLatencyEstimate"], "+00:00:00.025");
        assert_eq!(value["currentServerTimeOffsetEstimate"], "-00:00:01.250");
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode_empty(MessageKind::Ping), "Ping\n{}");
    }

    #[test]
    fn test_every_kind_round_trips() {
        let messages = vec![
            Message::RequestAuthentication(RequestAuthenticationPayload {
                player_name: "Ada".into(),
                player_id: "p-1".into(),
                game_version: "1.2.0".into(),
            }),
            Message::PlayerAuthenticated(PlayerAuthenticatedPayload {
                player_name: "Ada".into(),
                player_id: "p-1".into(),
            }),
            Message::PlayerNotAuthenticated(serde_json::json!({ "reason": "banned" })),
            Message::WarningMessage("server restarting soon".into()),
            Message::ErrorMessage("{\"code\":42}".into()),
            Message::Ping(PingPayload {
                ping_time: at(7),
                ping_ms: 7,
                current_latency_estimate: TimeDelta::milliseconds(40),
                current_server_time_offset_estimate: TimeDelta::milliseconds(-90_061_001),
            }),
            Message::Pong(PongPayload {
                ping_time: at(7),
                pong_time: at(130),
            }),
        ];

        for message in messages {
            let raw = message.encode().unwrap();
            let decoded = Message::decode(&raw).unwrap();
            assert_eq!(decoded.kind(), message.kind());
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_decode_rejects_invalid_kind_and_bad_json() {
        assert!(matches!(
            Message::decode("Teleport\n{}"),
            Err(LinkError::Protocol(_))
        ));
        assert!(matches!(
            Message::decode("Pong\n{not json"),
            Err(LinkError::Json(_))
        ));
    }

    #[test]
    fn test_player_authenticated_tolerates_missing_fields() {
        let decoded = Message::decode("PlayerAuthenticated\n{\"playerName\":\"Ada\"}").unwrap();
        assert_eq!(
            decoded,
            Message::PlayerAuthenticated(PlayerAuthenticatedPayload {
                player_name: "Ada".into(),
                player_id: String::new(),
            })
        );
    }

    #[test]
    fn test_timespan_format() {
        assert_eq!(timespan::format(TimeDelta::zero()), "+00:00:00.000");
        assert_eq!(timespan::format(TimeDelta::milliseconds(70)), "+00:00:00.070");
        assert_eq!(timespan::format(TimeDelta::milliseconds(-3_723_004)), "-01:02:03.004");
        assert_eq!(timespan::format(TimeDelta::milliseconds(90_061_001)), "+1.01:01:01.001");
    }

    #[test]
    fn test_timespan_parse() {
        assert_eq!(timespan::parse("+00:00:00.070").unwrap(), TimeDelta::milliseconds(70));
        assert_eq!(timespan::parse("-01:02:03.004").unwrap(), TimeDelta::milliseconds(-3_723_004));
        assert_eq!(timespan::parse("1.01:01:01.001").unwrap(), TimeDelta::milliseconds(90_061_001));
        assert_eq!(timespan::parse("00:00:02").unwrap(), TimeDelta::seconds(2));
        assert_eq!(timespan::parse("00:00:00.5").unwrap(), TimeDelta::milliseconds(500));
        assert_eq!(timespan::parse("00:00:00.1234567").unwrap(), TimeDelta::milliseconds(123));
        assert!(timespan::parse("00:00").is_err());
        assert!(timespan::parse("aa:00:00").is_err());
        assert!(timespan::parse("00:00:00.x").is_err());
        assert!(timespan::parse("99999999999999.00:00:00").is_err());
        assert!(timespan::parse("00:00:99999999999999999").is_err());
    }

    #[test]
    fn test_decode_ping_with_out_of_range_timespan_is_an_error() {
        let raw = "Ping\n{\"pingTime\":\"2024-05-01T12:00:00.000Z\",\"pingMs\":0,\
                   \"currentLatencyEstimate\":\"99999999999999.00:00:00\",\
                   \"currentServerTimeOffsetEstimate\":\"+00:00:00.000\"}";
        assert!(matches!(Message::decode(raw), Err(LinkError::Json(_))));
    }
}
