// End-to-end session controller tests with scripted capture, token source,
// and a scripted in-process WebSocket server.

use futures::{SinkExt, StreamExt};
use room_scribe::audio::{AudioCapture, AudioFrame, CaptureConfig, CaptureEvent};
use room_scribe::error::{DeviceError, SessionError, TokenError};
use room_scribe::session::{SessionConfig, SessionController, SessionNotice, SessionSnapshot, SessionState};
use room_scribe::stt::{IssuedToken, SttConfig, TokenSource};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Scripted seams
// ---------------------------------------------------------------------------

struct ScriptedCapture {
    fail_open: Option<DeviceError>,
    opened: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    fault: Arc<StdMutex<Option<DeviceError>>>,
}

impl ScriptedCapture {
    fn working() -> (Self, Arc<AtomicBool>, Arc<AtomicBool>) {
        let opened = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        (
            Self {
                fail_open: None,
                opened: Arc::clone(&opened),
                released: Arc::clone(&released),
                fault: Arc::new(StdMutex::new(None)),
            },
            opened,
            released,
        )
    }

    fn failing(error: DeviceError) -> Self {
        Self {
            fail_open: Some(error),
            opened: Arc::new(AtomicBool::new(false)),
            released: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(StdMutex::new(None)),
        }
    }

    /// Handle for injecting a device error into a running stream.
    fn fault_handle(&self) -> Arc<StdMutex<Option<DeviceError>>> {
        Arc::clone(&self.fault)
    }
}

#[async_trait::async_trait]
impl AudioCapture for ScriptedCapture {
    async fn open(&mut self) -> Result<mpsc::Receiver<CaptureEvent>, DeviceError> {
        if let Some(e) = self.fail_open.clone() {
            return Err(e);
        }
        self.opened.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(32);
        let released = Arc::clone(&self.released);
        let fault = Arc::clone(&self.fault);
        tokio::spawn(async move {
            let mut sequence = 0;
            while !released.load(Ordering::SeqCst) {
                let injected = fault.lock().unwrap().take();
                if let Some(error) = injected {
                    let _ = tx.send(CaptureEvent::Error(error)).await;
                    break;
                }
                let frame = AudioFrame {
                    samples: vec![0i16; 1600],
                    sample_rate: 16000,
                    sequence,
                };
                sequence += 1;
                if tx.send(CaptureEvent::Frame(frame)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        Ok(rx)
    }

    async fn close(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.released.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct FixedTokens(Result<IssuedToken, TokenError>);

impl FixedTokens {
    fn good() -> Self {
        Self(Ok(IssuedToken {
            token: "tok-test".to_string(),
            expires_in_seconds: Some(60),
        }))
    }
}

#[async_trait::async_trait]
impl TokenSource for FixedTokens {
    async fn fetch(&self) -> Result<IssuedToken, TokenError> {
        self.0.clone()
    }
}

/// Token source that never resolves; acquisition hangs until cancelled.
struct StalledTokens;

#[async_trait::async_trait]
impl TokenSource for StalledTokens {
    async fn fetch(&self) -> Result<IssuedToken, TokenError> {
        futures::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/", listener.local_addr().unwrap());
    (listener, endpoint)
}

fn controller_with(
    endpoint: String,
    capture: ScriptedCapture,
    tokens: impl TokenSource + 'static,
    recording_dir: Option<PathBuf>,
) -> SessionController {
    let config = SessionConfig {
        session_id: "room-test".to_string(),
        stt: SttConfig {
            endpoint,
            sample_rate: 16000,
            format_turns: true,
        },
        token_url: "http://unused.invalid".to_string(),
        capture: CaptureConfig::default(),
        recording_dir,
    };
    SessionController::with_parts(config, Box::new(capture), Arc::new(tokens))
}

async fn wait_until(
    snapshots: &mut watch::Receiver<SessionSnapshot>,
    what: &str,
    predicate: impl Fn(&SessionSnapshot) -> bool,
) {
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&snapshots.borrow_and_update()) {
                return;
            }
            if snapshots.changed().await.is_err() {
                panic!("snapshot channel closed while waiting for {what}");
            }
        }
    })
    .await;
    outcome.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn text(payload: &str) -> Message {
    Message::Text(payload.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_grows_partial_then_finalizes() {
    let (listener, endpoint) = bind_server().await;

    // The server holds the final turn until the test has observed the
    // growing partial; watch snapshots coalesce, so an unthrottled server
    // could finalize before the intermediate state is ever seen.
    let (partial_seen_tx, partial_seen_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        ws.send(text(r#"{"type":"Begin","id":"s1","expires_at":1735689600.0}"#))
            .await
            .unwrap();
        ws.send(text(r#"{"type":"Turn","transcript":"hel","end_of_turn":false}"#))
            .await
            .unwrap();
        ws.send(text(r#"{"type":"Turn","transcript":"hello","end_of_turn":false}"#))
            .await
            .unwrap();

        partial_seen_rx.await.unwrap();
        ws.send(text(
            r#"{"type":"Turn","transcript":"hello world","end_of_turn":true,"turn_is_formatted":true}"#,
        ))
        .await
        .unwrap();

        // Audio keeps flowing; wait for the graceful Terminate
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(control) => {
                    assert!(control.contains("Terminate"));
                    break;
                }
                _ => {}
            }
        }
        ws.send(text(r#"{"type":"Termination"}"#)).await.unwrap();
        ws.close(None).await.ok();
    });

    let recording_dir = tempfile::tempdir().unwrap();
    let (capture, _opened, released) = ScriptedCapture::working();
    let controller = controller_with(
        endpoint,
        capture,
        FixedTokens::good(),
        Some(recording_dir.path().to_path_buf()),
    );
    let mut snapshots = controller.subscribe();

    controller.start().await.unwrap();

    // Partial reflects the most recent hypothesis while finalized is empty
    wait_until(&mut snapshots, "growing partial", |snap| {
        snap.transcript.partial == "hello" && snap.transcript.finalized.is_empty()
    })
    .await;
    partial_seen_tx.send(()).unwrap();

    wait_until(&mut snapshots, "finalized turn", |snap| {
        snap.transcript.finalized == vec!["hello world".to_string()]
            && snap.transcript.partial.is_empty()
    })
    .await;

    controller.stop().await;
    server.await.unwrap();

    let snap = snapshots.borrow().clone();
    assert_eq!(snap.state, SessionState::Idle);
    assert_eq!(snap.transcript.finalized, vec!["hello world".to_string()]);
    assert_eq!(snap.transcript.partial, "");

    // Device released, frames were sent, WAV keepsake exists
    assert!(released.load(Ordering::SeqCst));
    let stats = controller.stats().await;
    assert!(stats.frames_sent > 0);
    assert_eq!(stats.finalized_count, 1);
    assert!(recording_dir.path().join("room-test.wav").exists());

    // The session clock froze at teardown; duration no longer grows
    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = controller.stats().await;
    assert_eq!(stats.duration_secs, later.duration_secs);
}

#[tokio::test]
async fn start_while_active_is_rejected_without_teardown() {
    let (listener, endpoint) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(text(r#"{"type":"Begin","id":"s1"}"#)).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(_))) => {
                    ws.send(text(r#"{"type":"Termination"}"#)).await.ok();
                    ws.close(None).await.ok();
                    break;
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    });

    let (capture, _, _) = ScriptedCapture::working();
    let controller = controller_with(endpoint, capture, FixedTokens::good(), None);
    let mut snapshots = controller.subscribe();

    controller.start().await.unwrap();
    wait_until(&mut snapshots, "active", |snap| {
        snap.state == SessionState::Active
    })
    .await;

    let err = controller.start().await.unwrap_err();
    assert_eq!(err, SessionError::AlreadyActive);

    // The running session is untouched
    assert_eq!(controller.state(), SessionState::Active);

    controller.stop().await;
    server.await.unwrap();
    assert_eq!(controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (listener, endpoint) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(text(r#"{"type":"Begin","id":"s1"}"#)).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(_))) => {
                    ws.send(text(r#"{"type":"Termination"}"#)).await.ok();
                    ws.close(None).await.ok();
                    break;
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    });

    let (capture, _, released) = ScriptedCapture::working();
    let controller = controller_with(endpoint, capture, FixedTokens::good(), None);
    let mut snapshots = controller.subscribe();

    // stop() with nothing running is a no-op
    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Idle);

    controller.start().await.unwrap();
    wait_until(&mut snapshots, "active", |snap| {
        snap.state == SessionState::Active
    })
    .await;

    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(released.load(Ordering::SeqCst));

    // Second stop is a no-op
    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Idle);

    server.await.unwrap();
}

#[tokio::test]
async fn transport_drop_preserves_finalized_and_discards_partial() {
    let (listener, endpoint) = bind_server().await;

    // Hold the abrupt drop until the pending partial has been observed,
    // so the teardown cannot coalesce it away before the test sees it
    let (partial_seen_tx, partial_seen_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(text(r#"{"type":"Begin","id":"s1"}"#)).await.unwrap();
        ws.send(text(
            r#"{"type":"Turn","transcript":"hi there","end_of_turn":true}"#,
        ))
        .await
        .unwrap();
        ws.send(text(r#"{"type":"Turn","transcript":"how","end_of_turn":false}"#))
            .await
            .unwrap();

        partial_seen_rx.await.unwrap();
        // Drop the connection without a close handshake
        drop(ws);
    });

    let (capture, _, released) = ScriptedCapture::working();
    let controller = controller_with(endpoint, capture, FixedTokens::good(), None);
    let mut snapshots = controller.subscribe();

    controller.start().await.unwrap();
    wait_until(&mut snapshots, "pending partial", |snap| {
        snap.transcript.partial == "how"
    })
    .await;
    partial_seen_tx.send(()).unwrap();
    server.await.unwrap();

    wait_until(&mut snapshots, "teardown after drop", |snap| {
        snap.state == SessionState::Idle
    })
    .await;

    let snap = snapshots.borrow().clone();
    assert_eq!(snap.transcript.finalized, vec!["hi there".to_string()]);
    assert_eq!(snap.transcript.partial, "");
    assert!(matches!(
        snap.notice,
        Some(SessionNotice::ConnectionLost(_))
    ));
    assert!(released.load(Ordering::SeqCst));

    controller.stop().await;
}

#[tokio::test]
async fn token_failure_aborts_cleanly_to_idle() {
    let (listener, endpoint) = bind_server().await;

    let (capture, _, released) = ScriptedCapture::working();
    let controller = controller_with(
        endpoint,
        capture,
        FixedTokens(Err(TokenError::Status(500))),
        None,
    );
    let mut snapshots = controller.subscribe();

    controller.start().await.unwrap();
    wait_until(&mut snapshots, "abort to idle", |snap| {
        snap.state == SessionState::Idle && snap.notice.is_some()
    })
    .await;

    let snap = snapshots.borrow().clone();
    assert_eq!(snap.notice, Some(SessionNotice::Token(TokenError::Status(500))));
    assert!(released.load(Ordering::SeqCst));

    // No connection was ever attempted
    let accepted =
        tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err());

    // A fresh start is allowed after the clean abort
    controller.stop().await;
    assert_eq!(controller.state(), SessionState::Idle);
}

#[tokio::test]
async fn device_loss_mid_session_tears_down_with_device_notice() {
    let (listener, endpoint) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(text(r#"{"type":"Begin","id":"s1"}"#)).await.unwrap();
        ws.send(text(
            r#"{"type":"Turn","transcript":"hi there","end_of_turn":true}"#,
        ))
        .await
        .unwrap();
        // Keep reading until the client tears the connection down
        while let Some(msg) = ws.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    let (capture, _opened, released) = ScriptedCapture::working();
    let fault = capture.fault_handle();
    let controller = controller_with(endpoint, capture, FixedTokens::good(), None);
    let mut snapshots = controller.subscribe();

    controller.start().await.unwrap();
    wait_until(&mut snapshots, "finalized turn", |snap| {
        snap.transcript.finalized == vec!["hi there".to_string()]
    })
    .await;

    // The microphone goes away mid-capture
    *fault.lock().unwrap() = Some(DeviceError::Disconnected);

    wait_until(&mut snapshots, "teardown after device loss", |snap| {
        snap.state == SessionState::Idle
    })
    .await;

    let snap = snapshots.borrow().clone();
    assert_eq!(
        snap.notice,
        Some(SessionNotice::Device(DeviceError::Disconnected))
    );
    assert_eq!(snap.transcript.finalized, vec!["hi there".to_string()]);
    assert!(released.load(Ordering::SeqCst));

    server.await.unwrap();
    controller.stop().await;
}

#[tokio::test]
async fn stop_during_acquisition_cancels_and_releases_capture() {
    let (_listener, endpoint) = bind_server().await;

    let (capture, _opened, released) = ScriptedCapture::working();
    let controller = controller_with(endpoint, capture, StalledTokens, None);

    controller.start().await.unwrap();
    assert_eq!(controller.state(), SessionState::Acquiring);

    // stop() must cancel the hung token fetch promptly
    tokio::time::timeout(Duration::from_secs(2), controller.stop())
        .await
        .expect("stop() hung on an in-flight acquisition");

    assert_eq!(controller.state(), SessionState::Idle);
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stop_during_connect_cancels_and_releases_capture() {
    // The listener is bound but never accepts: the handshake hangs
    let (_listener, endpoint) = bind_server().await;

    let (capture, _opened, released) = ScriptedCapture::working();
    let controller = controller_with(endpoint, capture, FixedTokens::good(), None);
    let mut snapshots = controller.subscribe();

    controller.start().await.unwrap();
    wait_until(&mut snapshots, "connecting", |snap| {
        snap.state == SessionState::Connecting
    })
    .await;

    tokio::time::timeout(Duration::from_secs(2), controller.stop())
        .await
        .expect("stop() hung on an in-flight connect");

    assert_eq!(controller.state(), SessionState::Idle);
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn permission_denied_reports_device_error_and_opens_no_socket() {
    let (listener, endpoint) = bind_server().await;

    let capture = ScriptedCapture::failing(DeviceError::PermissionDenied);
    let controller = controller_with(endpoint, capture, FixedTokens::good(), None);
    let mut snapshots = controller.subscribe();

    controller.start().await.unwrap();
    wait_until(&mut snapshots, "abort to idle", |snap| {
        snap.state == SessionState::Idle && snap.notice.is_some()
    })
    .await;

    let snap = snapshots.borrow().clone();
    assert_eq!(
        snap.notice,
        Some(SessionNotice::Device(DeviceError::PermissionDenied))
    );

    let accepted =
        tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "no socket should ever be opened");

    controller.stop().await;
}
