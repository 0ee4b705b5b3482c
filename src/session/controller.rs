use super::config::SessionConfig;
use super::stats::SessionStats;
use crate::audio::{AudioCapture, CaptureEvent, MicrophoneCapture, SessionRecorder};
use crate::error::{
    ConnectError, DeviceError, ProtocolError, SessionError, TokenError, TransportError,
};
use crate::stt::{HttpTokenSource, LinkSignal, TokenSource, TranscriptionLink};
use crate::transcript::{Applied, TranscriptReconciler, TranscriptState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Application-level session state. Transport-level connection state lives
/// in [`LinkState`](crate::stt::LinkState); the two are coupled only by
/// the failure mapping (transport failure -> session teardown).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    /// Fetching the session token and opening the microphone
    Acquiring,
    Connecting,
    Active,
    /// Graceful stop in progress; remaining inbound events still apply
    Draining,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Acquiring => "acquiring",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Out-of-band condition surfaced to the UI alongside the transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Device(DeviceError),
    Token(TokenError),
    Connect(ConnectError),
    /// Mid-session transport loss; finalized text is preserved
    ConnectionLost(TransportError),
    /// Remote-reported error or malformed inbound message
    Degraded(ProtocolError),
    /// Remote ended the session
    Ended { reason: Option<String> },
}

impl SessionNotice {
    /// User-facing text. Device errors carry their own actionable wording;
    /// everything else reads as an unexpected end (the diagnostic detail
    /// is logged where it occurred).
    pub fn message(&self) -> String {
        match self {
            SessionNotice::Device(e) => e.to_string(),
            SessionNotice::ConnectionLost(_) => "connection lost".to_string(),
            SessionNotice::Token(_) | SessionNotice::Connect(_) | SessionNotice::Degraded(_) => {
                "session ended unexpectedly".to_string()
            }
            SessionNotice::Ended { reason } => match reason {
                Some(reason) => format!("session ended: {reason}"),
                None => "session ended".to_string(),
            },
        }
    }
}

/// Read-only view published to subscribers after every change.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub transcript: TranscriptState,
    pub notice: Option<SessionNotice>,
}

/// Grace period for the remote to finalize in-flight turns after a
/// graceful stop is announced.
const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Orchestrates capture -> link -> reconciler for one session at a time.
///
/// `Idle -> Acquiring -> Connecting -> Active -> Draining -> Idle`, with
/// any step failing over to teardown. All session state is mutated by a
/// single spawned task; audio frames and inbound events interleave through
/// one `select!` loop and never race each other.
pub struct SessionController {
    config: SessionConfig,
    capture: Arc<Mutex<Box<dyn AudioCapture>>>,
    tokens: Arc<dyn TokenSource>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    ended_at: Arc<Mutex<Option<DateTime<Utc>>>>,
    frames_sent: Arc<AtomicUsize>,
    events_received: Arc<AtomicUsize>,
}

impl SessionController {
    /// Controller over the default microphone and the configured HTTP
    /// token endpoint.
    pub fn new(config: SessionConfig) -> Self {
        let capture = Box::new(MicrophoneCapture::new(config.capture.clone()));
        let tokens = Arc::new(HttpTokenSource::new(config.token_url.clone()));
        Self::with_parts(config, capture, tokens)
    }

    /// Controller over caller-provided capture and token seams.
    pub fn with_parts(
        config: SessionConfig,
        capture: Box<dyn AudioCapture>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            config,
            capture: Arc::new(Mutex::new(capture)),
            tokens,
            snapshot: Arc::new(snapshot),
            shutdown: Mutex::new(None),
            run_task: Mutex::new(None),
            started_at: Mutex::new(None),
            ended_at: Arc::new(Mutex::new(None)),
            frames_sent: Arc::new(AtomicUsize::new(0)),
            events_received: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Begin a session. Rejected unless `Idle`; an already-running session
    /// is left untouched. Acquisition/connection failures after this
    /// returns surface through the snapshot as notices, with the state
    /// settling back to `Idle`.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut rejected = false;
        self.snapshot.send_modify(|snap| {
            if snap.state != SessionState::Idle {
                rejected = true;
            } else {
                snap.state = SessionState::Acquiring;
                snap.transcript = TranscriptState::default();
                snap.notice = None;
            }
        });
        if rejected {
            return Err(SessionError::AlreadyActive);
        }

        info!("Starting session {}", self.config.session_id);

        self.frames_sent.store(0, Ordering::SeqCst);
        self.events_received.store(0, Ordering::SeqCst);
        *self.started_at.lock().await = Some(Utc::now());
        *self.ended_at.lock().await = None;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        let runtime = SessionRuntime {
            config: self.config.clone(),
            capture: Arc::clone(&self.capture),
            tokens: Arc::clone(&self.tokens),
            snapshot: Arc::clone(&self.snapshot),
            frames_sent: Arc::clone(&self.frames_sent),
            events_received: Arc::clone(&self.events_received),
            ended_at: Arc::clone(&self.ended_at),
        };
        let task = tokio::spawn(runtime.run(shutdown_rx));
        *self.run_task.lock().await = Some(task);

        Ok(())
    }

    /// Tear the session down: cancel an in-flight acquire/connect, close
    /// the link gracefully, release the microphone. Idempotent; a second
    /// call is a no-op.
    pub async fn stop(&self) {
        let shutdown = self.shutdown.lock().await.take();
        let task = self.run_task.lock().await.take();

        if shutdown.is_none() && task.is_none() {
            debug!("stop() with no session to stop");
            return;
        }

        info!("Stopping session {}", self.config.session_id);

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Session task panicked: {e}");
            }
        }
    }

    /// Read-only subscription to {state, transcript, notices}.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn transcript(&self) -> TranscriptState {
        self.snapshot.borrow().transcript.clone()
    }

    pub async fn stats(&self) -> SessionStats {
        let started_at = *self.started_at.lock().await;
        // The clock is frozen once the session tears down, so duration
        // stops growing after Idle
        let clock_end = (*self.ended_at.lock().await).unwrap_or_else(Utc::now);
        let duration_secs = started_at
            .map(|t| clock_end.signed_duration_since(t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        let snap = self.snapshot.borrow().clone();

        SessionStats {
            state: snap.state,
            started_at,
            duration_secs,
            frames_sent: self.frames_sent.load(Ordering::SeqCst),
            events_received: self.events_received.load(Ordering::SeqCst),
            finalized_count: snap.transcript.finalized.len(),
        }
    }
}

/// How the active loop ended.
enum Outcome {
    /// User-initiated stop
    Stopped,
    /// Remote ended the session (Termination)
    Ended(Option<String>),
    /// Device, transport, or protocol failure
    Lost(SessionNotice),
}

/// Owns every mutable piece of one session run. Lives inside the spawned
/// task; nothing here is touched from outside it.
struct SessionRuntime {
    config: SessionConfig,
    capture: Arc<Mutex<Box<dyn AudioCapture>>>,
    tokens: Arc<dyn TokenSource>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    frames_sent: Arc<AtomicUsize>,
    events_received: Arc<AtomicUsize>,
    ended_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SessionRuntime {
    async fn run(self, shutdown: watch::Receiver<bool>) {
        self.drive(shutdown).await;
        // Freeze the session clock for post-session stats
        *self.ended_at.lock().await = Some(Utc::now());
    }

    async fn drive(&self, mut shutdown: watch::Receiver<bool>) {
        // Acquiring: token fetch and device open proceed concurrently;
        // Active is only reached once both succeed.
        let acquire = async {
            tokio::join!(self.tokens.fetch(), async {
                self.capture.lock().await.open().await
            })
        };

        let (token_res, open_res) = tokio::select! {
            _ = shutdown.changed() => {
                info!("Session cancelled during acquisition");
                self.release_capture().await;
                self.publish_state(SessionState::Idle);
                return;
            }
            res = acquire => res,
        };

        // Device failure first: in that case no socket is ever opened
        let mut frames = match open_res {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Failed to open capture device: {e}");
                self.fail_to_idle(SessionNotice::Device(e));
                return;
            }
        };

        let issued = match token_res {
            Ok(issued) => issued,
            Err(e) => {
                warn!("Token fetch failed: {e}");
                self.release_capture().await;
                self.fail_to_idle(SessionNotice::Token(e));
                return;
            }
        };
        if let Some(expiry) = issued.expires_in_seconds {
            debug!("Session token issued (expires in {expiry}s)");
        }

        // Connecting, raced against stop()
        self.publish_state(SessionState::Connecting);
        let link = tokio::select! {
            _ = shutdown.changed() => {
                info!("Session cancelled during connect");
                self.release_capture().await;
                self.publish_state(SessionState::Idle);
                return;
            }
            res = TranscriptionLink::connect(&self.config.stt, &issued.token) => match res {
                Ok(link) => link,
                Err(e) => {
                    warn!("Failed to connect transcription link: {e}");
                    self.release_capture().await;
                    self.fail_to_idle(SessionNotice::Connect(e));
                    return;
                }
            }
        };

        // Frames produced before Active are dropped, never queued
        let mut dropped = 0usize;
        while frames.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {dropped} frames produced before Active");
        }

        self.publish_state(SessionState::Active);
        info!("Session active");

        self.active_loop(link, &mut frames, shutdown).await;
    }

    async fn active_loop(
        &self,
        mut link: TranscriptionLink,
        frames: &mut mpsc::Receiver<CaptureEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut reconciler = TranscriptReconciler::new();
        let mut recorder = self.open_recorder();

        let outcome = loop {
            tokio::select! {
                _ = shutdown.changed() => break Outcome::Stopped,

                event = frames.recv() => match event {
                    Some(CaptureEvent::Frame(frame)) => {
                        if let Some(rec) = recorder.as_mut() {
                            if let Err(e) = rec.write_frame(&frame) {
                                warn!("Session recording failed, disabling: {e:#}");
                                recorder = None;
                            }
                        }
                        match link.send(&frame).await {
                            Ok(()) => {
                                self.frames_sent.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => {
                                warn!("Frame send failed: {e}");
                                break Outcome::Lost(SessionNotice::ConnectionLost(
                                    TransportError(e.to_string()),
                                ));
                            }
                        }
                    }
                    Some(CaptureEvent::Error(e)) => {
                        warn!("Capture device error: {e}");
                        break Outcome::Lost(SessionNotice::Device(e));
                    }
                    None => {
                        break Outcome::Lost(SessionNotice::Device(DeviceError::Disconnected));
                    }
                },

                signal = link.next_signal() => match signal {
                    LinkSignal::Event(event) => {
                        self.events_received.fetch_add(1, Ordering::SeqCst);
                        match reconciler.apply(event) {
                            Applied::Began(remote) => {
                                info!("Remote session {} established", remote.id);
                            }
                            Applied::Transcript => self.publish_transcript(reconciler.state()),
                            Applied::Ended { reason } => break Outcome::Ended(reason),
                            Applied::Fault(e) => {
                                warn!("Protocol fault: {e}");
                                break Outcome::Lost(SessionNotice::Degraded(e));
                            }
                            Applied::Nothing => {}
                        }
                    }
                    LinkSignal::Closed => {
                        break Outcome::Lost(SessionNotice::ConnectionLost(TransportError(
                            "connection closed by remote".to_string(),
                        )));
                    }
                    LinkSignal::Failed(e) => {
                        break Outcome::Lost(SessionNotice::ConnectionLost(e));
                    }
                }
            }
        };

        match outcome {
            Outcome::Stopped => {
                self.publish_state(SessionState::Draining);
                self.drain(&mut link, &mut reconciler).await;
                link.shutdown().await;
                self.finish(recorder, reconciler, None).await;
            }
            Outcome::Ended(reason) => {
                info!("Remote ended the session");
                self.publish_state(SessionState::Draining);
                link.close(false).await;
                self.finish(recorder, reconciler, Some(SessionNotice::Ended { reason }))
                    .await;
            }
            Outcome::Lost(notice) => {
                // Same teardown path as stop(), surfaced as a distinct
                // condition instead of a silent disconnect
                self.publish_state(SessionState::Failed);
                link.shutdown().await;
                self.finish(recorder, reconciler, Some(notice)).await;
            }
        }
    }

    /// Announce the graceful stop and give the remote a bounded window to
    /// finalize in-flight turns. Transcript changes arriving here still
    /// apply.
    async fn drain(&self, link: &mut TranscriptionLink, reconciler: &mut TranscriptReconciler) {
        if link.send_terminate().await.is_err() {
            return;
        }

        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        loop {
            match tokio::time::timeout_at(deadline, link.next_signal()).await {
                Err(_) => {
                    warn!("Remote did not terminate within the drain grace period");
                    break;
                }
                Ok(LinkSignal::Event(event)) => {
                    self.events_received.fetch_add(1, Ordering::SeqCst);
                    match reconciler.apply(event) {
                        Applied::Transcript => self.publish_transcript(reconciler.state()),
                        Applied::Ended { .. } => break,
                        _ => {}
                    }
                }
                Ok(LinkSignal::Closed) | Ok(LinkSignal::Failed(_)) => break,
            }
        }
    }

    /// Common teardown tail: release the device, finalize the recording,
    /// discard any unacknowledged partial, settle back to Idle.
    async fn finish(
        &self,
        recorder: Option<SessionRecorder>,
        mut reconciler: TranscriptReconciler,
        notice: Option<SessionNotice>,
    ) {
        self.release_capture().await;

        if let Some(rec) = recorder {
            if let Err(e) = rec.finish() {
                warn!("Failed to finalize session recording: {e:#}");
            }
        }

        reconciler.discard_partial();
        let transcript = reconciler.state().clone();
        let finalized = transcript.finalized.len();

        self.snapshot.send_modify(|snap| {
            snap.state = SessionState::Idle;
            snap.transcript = transcript;
            if notice.is_some() {
                snap.notice = notice;
            }
        });

        info!("Session finished ({finalized} finalized utterances)");
    }

    fn fail_to_idle(&self, notice: SessionNotice) {
        self.snapshot.send_modify(|snap| {
            snap.state = SessionState::Idle;
            snap.notice = Some(notice);
        });
    }

    async fn release_capture(&self) {
        self.capture.lock().await.close().await;
    }

    fn open_recorder(&self) -> Option<SessionRecorder> {
        let dir = self.config.recording_dir.as_ref()?;
        match SessionRecorder::create(dir, &self.config.session_id, &self.config.capture) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!("Could not start session recording: {e:#}");
                None
            }
        }
    }

    fn publish_state(&self, state: SessionState) {
        debug!("Session state -> {state}");
        self.snapshot.send_modify(|snap| snap.state = state);
    }

    fn publish_transcript(&self, transcript: &TranscriptState) {
        let transcript = transcript.clone();
        self.snapshot.send_modify(|snap| snap.transcript = transcript);
    }
}
