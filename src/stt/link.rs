use super::protocol::{parse_inbound, terminate_message, TranscriptEvent};
use super::SttConfig;
use crate::audio::AudioFrame;
use crate::error::{ConnectError, SendError, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Transport-level connection state. Kept separate from the session-level
/// state machine; the session maps `Failed` onto its own failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Connecting => "connecting",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
            LinkState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the reader side of the link observed.
#[derive(Debug)]
pub enum LinkSignal {
    Event(TranscriptEvent),
    /// Remote closed the connection (or EOF)
    Closed,
    /// Transport error mid-connection
    Failed(TransportError),
}

/// Inbound signal queue depth. Events may arrive batched; the remote's
/// segmentation decides when Turns are emitted, so no one-frame-in /
/// one-event-out assumption is made anywhere.
const SIGNAL_QUEUE: usize = 64;

/// How long a graceful close waits for the remote to wrap up.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// One persistent connection to the streaming transcription service.
///
/// Outbound audio goes through [`send`]; inbound messages are parsed by a
/// reader task and consumed in arrival order via [`next_signal`].
///
/// [`send`]: TranscriptionLink::send
/// [`next_signal`]: TranscriptionLink::next_signal
#[derive(Debug)]
pub struct TranscriptionLink {
    sink: WsSink,
    signals: mpsc::Receiver<LinkSignal>,
    state: LinkState,
    reader: JoinHandle<()>,
}

impl TranscriptionLink {
    /// Establish the connection using a freshly issued session token.
    pub async fn connect(config: &SttConfig, token: &str) -> Result<Self, ConnectError> {
        let url = super::protocol::stream_url(
            &config.endpoint,
            config.sample_rate,
            config.format_turns,
            token,
        );

        debug!("Connecting to {}", config.endpoint);

        let (ws, _response) = connect_async(&url).await.map_err(map_connect_error)?;

        info!("Transcription link established");

        let (sink, stream) = ws.split();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);
        let reader = tokio::spawn(read_loop(stream, signal_tx));

        Ok(Self {
            sink,
            signals: signal_rx,
            state: LinkState::Open,
            reader,
        })
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Send one audio frame. Fails fast when the link is not `Open`
    /// instead of buffering.
    pub async fn send(&mut self, frame: &AudioFrame) -> Result<(), SendError> {
        if self.state != LinkState::Open {
            return Err(SendError::NotOpen { state: self.state });
        }

        let bytes = frame.pcm_bytes();
        debug!("Sending frame {} ({} bytes)", frame.sequence, bytes.len());

        self.sink.send(Message::Binary(bytes)).await.map_err(|e| {
            self.state = LinkState::Failed;
            SendError::Transport(e.to_string())
        })
    }

    /// Next inbound signal, in arrival order. `Closed`/`Failed` are
    /// terminal; afterward only those are returned.
    pub async fn next_signal(&mut self) -> LinkSignal {
        match self.signals.recv().await {
            Some(LinkSignal::Closed) => {
                if self.state != LinkState::Failed {
                    self.state = LinkState::Closed;
                }
                LinkSignal::Closed
            }
            Some(LinkSignal::Failed(e)) => {
                self.state = LinkState::Failed;
                LinkSignal::Failed(e)
            }
            Some(signal) => signal,
            None => {
                // Reader task is gone; treat as a closed transport
                if self.state == LinkState::Open || self.state == LinkState::Closing {
                    self.state = LinkState::Closed;
                }
                LinkSignal::Closed
            }
        }
    }

    /// Announce a graceful stop to the remote. The link moves to `Closing`;
    /// remaining inbound events can still be drained via `next_signal`.
    pub async fn send_terminate(&mut self) -> Result<(), SendError> {
        if self.state != LinkState::Open {
            return Err(SendError::NotOpen { state: self.state });
        }

        debug!("Sending Terminate control message");
        match self.sink.send(Message::Text(terminate_message())).await {
            Ok(()) => {
                self.state = LinkState::Closing;
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Failed;
                Err(SendError::Transport(e.to_string()))
            }
        }
    }

    /// Close the transport. Safe when the remote closed first.
    pub async fn shutdown(mut self) {
        // An error here means the transport is already gone, which is fine
        let _ = self.sink.close().await;
        self.reader.abort();
        let _ = self.reader.await;
        info!("Transcription link closed");
    }

    /// Full close. Graceful close announces the stop with a `Terminate`
    /// control message and gives the remote a bounded grace period to
    /// finish; remaining events are discarded.
    pub async fn close(mut self, graceful: bool) {
        if graceful && self.state == LinkState::Open {
            if self.send_terminate().await.is_ok() {
                let drain = async {
                    loop {
                        match self.next_signal().await {
                            LinkSignal::Closed | LinkSignal::Failed(_) => break,
                            LinkSignal::Event(ev) => debug!("Discarding drain event: {ev:?}"),
                        }
                    }
                };
                if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
                    warn!("Remote did not close within grace period");
                }
            }
        }
        self.shutdown().await;
    }
}

async fn read_loop(mut stream: WsStream, tx: mpsc::Sender<LinkSignal>) {
    let mut closed_reported = false;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let event = parse_inbound(&text);
                if let TranscriptEvent::Malformed { .. } = &event {
                    warn!("Malformed inbound message: {}", text);
                }
                if tx.send(LinkSignal::Event(event)).await.is_err() {
                    return; // consumer gone
                }
            }
            Ok(Message::Binary(bytes)) => {
                // The service never sends binary; surface it, don't drop it
                let event = TranscriptEvent::Malformed {
                    payload: format!("unexpected {}-byte binary message", bytes.len()),
                };
                if tx.send(LinkSignal::Event(event)).await.is_err() {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                debug!("Remote closed the connection: {frame:?}");
                let _ = tx.send(LinkSignal::Closed).await;
                closed_reported = true;
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Err(e) => {
                let _ = tx
                    .send(LinkSignal::Failed(TransportError(e.to_string())))
                    .await;
                return;
            }
        }
    }

    if !closed_reported {
        let _ = tx.send(LinkSignal::Closed).await;
    }
}

fn map_connect_error(e: tungstenite::Error) -> ConnectError {
    match e {
        tungstenite::Error::Http(response) => ConnectError::Rejected {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Url(e) => ConnectError::InvalidEndpoint(e.to_string()),
        other => ConnectError::Handshake(other.to_string()),
    }
}
