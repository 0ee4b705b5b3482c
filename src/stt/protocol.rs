//! Wire protocol of the streaming transcription service.
//!
//! Outbound: raw binary PCM frames, plus one JSON control message
//! (`{"type":"Terminate"}`) for a graceful stop. Inbound: JSON objects
//! discriminated by a `type` field (`Begin`, `Turn`, `Termination`); an
//! `error` field may appear independently of `type` and takes precedence.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use serde_json::json;

/// Characters escaped inside a query-string value. Tokens are opaque, so
/// reserved query characters must not pass through verbatim.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

/// One decoded inbound message.
///
/// Anything that fails to parse or carries an unknown discriminator
/// becomes `Malformed`, never silently dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    SessionBegin {
        id: String,
        /// Unix timestamp after which the remote session expires
        expires_at: Option<i64>,
    },
    Turn {
        text: String,
        is_final: bool,
        formatted: bool,
    },
    SessionEnd {
        reason: Option<String>,
    },
    Error {
        message: String,
    },
    Malformed {
        payload: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
    expires_at: Option<f64>,
    transcript: Option<String>,
    #[serde(default)]
    end_of_turn: bool,
    #[serde(default)]
    turn_is_formatted: bool,
    reason: Option<String>,
    error: Option<String>,
}

/// Build the connection URL. The service is parameterized by sample rate
/// and PCM encoding, with the session token passed as a query parameter.
pub fn stream_url(endpoint: &str, sample_rate: u32, format_turns: bool, token: &str) -> String {
    let token = utf8_percent_encode(token, QUERY_VALUE);
    format!(
        "{endpoint}?sample_rate={sample_rate}&encoding=pcm_s16le&format_turns={format_turns}&token={token}"
    )
}

/// Control message announcing a graceful client-initiated stop.
pub fn terminate_message() -> String {
    json!({ "type": "Terminate" }).to_string()
}

/// Decode one inbound text payload.
pub fn parse_inbound(payload: &str) -> TranscriptEvent {
    let raw: RawInbound = match serde_json::from_str(payload) {
        Ok(raw) => raw,
        Err(_) => {
            return TranscriptEvent::Malformed {
                payload: payload.to_string(),
            }
        }
    };

    // The error field wins regardless of the message type
    if let Some(message) = raw.error {
        return TranscriptEvent::Error { message };
    }

    match raw.kind.as_deref() {
        Some("Begin") => match raw.id {
            Some(id) => TranscriptEvent::SessionBegin {
                id,
                expires_at: raw.expires_at.map(|t| t as i64),
            },
            None => TranscriptEvent::Malformed {
                payload: payload.to_string(),
            },
        },
        Some("Turn") => match raw.transcript {
            Some(text) => TranscriptEvent::Turn {
                text,
                is_final: raw.end_of_turn,
                formatted: raw.turn_is_formatted,
            },
            None => TranscriptEvent::Malformed {
                payload: payload.to_string(),
            },
        },
        Some("Termination") => TranscriptEvent::SessionEnd { reason: raw.reason },
        _ => TranscriptEvent::Malformed {
            payload: payload.to_string(),
        },
    }
}
