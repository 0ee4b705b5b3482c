//! Reconciles the asynchronous event stream into a stable transcript.

use crate::error::ProtocolError;
use crate::stt::TranscriptEvent;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::debug;

/// The user-visible transcript: an append-only list of finalized
/// utterances plus at most one in-progress partial.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TranscriptState {
    pub finalized: Vec<String>,
    pub partial: String,
}

impl TranscriptState {
    pub fn full_text(&self) -> String {
        self.finalized.join(" ")
    }
}

/// Remote-assigned session identity, from the `Begin` event.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSession {
    pub id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// What applying one event did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Remote session established; no transcript change
    Began(RemoteSession),
    /// Finalized list or partial changed
    Transcript,
    /// Remote ended the session; a pending partial was discarded
    Ended { reason: Option<String> },
    /// Remote-reported error or malformed message; transcript untouched
    Fault(ProtocolError),
    Nothing,
}

/// Applies the turn-taking protocol to the inbound event stream.
///
/// The remote guarantees in-order per-connection delivery, and this trusts
/// arrival order: every non-final Turn wholesale-replaces the partial
/// (the remote resends the growing hypothesis each time), and only a final
/// Turn grows `finalized`, clearing the partial in the same step, so no
/// observer ever sees a final next to its own stale partial. There is no
/// reordering or merge logic for overlapping turns.
#[derive(Debug, Default)]
pub struct TranscriptReconciler {
    state: TranscriptState,
    remote: Option<RemoteSession>,
    ended: bool,
}

impl TranscriptReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &TranscriptState {
        &self.state
    }

    pub fn remote(&self) -> Option<&RemoteSession> {
        self.remote.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Drop any pending partial without finalizing it. Used when the
    /// connection is lost: finality belongs to the remote, so an
    /// unacknowledged hypothesis is never promoted.
    pub fn discard_partial(&mut self) -> bool {
        if self.state.partial.is_empty() {
            return false;
        }
        debug!("Discarding pending partial: {:?}", self.state.partial);
        self.state.partial.clear();
        true
    }

    pub fn apply(&mut self, event: TranscriptEvent) -> Applied {
        match event {
            TranscriptEvent::SessionBegin { id, expires_at } => {
                let remote = RemoteSession {
                    id,
                    expires_at: expires_at.and_then(|t| Utc.timestamp_opt(t, 0).single()),
                };
                self.remote = Some(remote.clone());
                Applied::Began(remote)
            }

            TranscriptEvent::Turn {
                text,
                is_final: false,
                ..
            } => {
                // Authoritative overwrite, not append
                self.state.partial = text;
                Applied::Transcript
            }

            TranscriptEvent::Turn {
                text,
                is_final: true,
                ..
            } => {
                // The only point at which finalized grows; the partial is
                // cleared in the same step
                self.state.finalized.push(text);
                self.state.partial.clear();
                Applied::Transcript
            }

            TranscriptEvent::SessionEnd { reason } => {
                self.ended = true;
                self.discard_partial();
                Applied::Ended { reason }
            }

            TranscriptEvent::Error { message } => Applied::Fault(ProtocolError::Remote(message)),

            TranscriptEvent::Malformed { payload } => {
                Applied::Fault(ProtocolError::Malformed(payload))
            }
        }
    }
}
