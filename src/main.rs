use anyhow::Result;
use clap::Parser;
use room_scribe::{Config, SessionConfig, SessionController, SessionState, SttConfig};
use room_scribe::audio::CaptureConfig;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Live microphone transcription for a discussion room
#[derive(Debug, Parser)]
#[command(name = "room-scribe")]
struct Args {
    /// Config file (without extension), e.g. config/room-scribe
    #[arg(long, default_value = "config/room-scribe")]
    config: String,

    /// Room/session identifier (defaults to a generated one)
    #[arg(long)]
    room: Option<String>,

    /// Keep a WAV copy of the captured audio in this directory
    #[arg(long)]
    record: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            info!("No usable config at '{}' ({e}); using defaults", args.config);
            Config::default()
        }
    };

    info!("{} starting", cfg.service.name);

    let session_config = SessionConfig {
        session_id: args
            .room
            .map(|r| format!("room-{r}"))
            .unwrap_or_else(|| SessionConfig::default().session_id),
        stt: SttConfig {
            endpoint: cfg.stt.endpoint.clone(),
            sample_rate: cfg.audio.sample_rate,
            format_turns: cfg.stt.format_turns,
        },
        token_url: cfg.stt.token_url.clone(),
        capture: CaptureConfig {
            sample_rate: cfg.audio.sample_rate,
            channels: cfg.audio.channels,
            frame_duration_ms: cfg.audio.frame_duration_ms,
        },
        recording_dir: args.record.or_else(|| {
            cfg.recording
                .enabled
                .then(|| PathBuf::from(&cfg.recording.output_dir))
        }),
    };

    let controller = SessionController::new(session_config);
    let mut snapshots = controller.subscribe();

    controller.start().await?;
    println!("Listening. Press Ctrl-C to stop.\n");

    let mut printed_finals = 0;
    let mut was_running = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow_and_update().clone();

                // Finalized lines each get their own line; the partial
                // redraws in place as the hypothesis grows
                while printed_finals < snap.transcript.finalized.len() {
                    println!("\r\x1b[2K{}", snap.transcript.finalized[printed_finals]);
                    printed_finals += 1;
                }
                if !snap.transcript.partial.is_empty() {
                    print!("\r\x1b[2K… {}", snap.transcript.partial);
                    std::io::stdout().flush().ok();
                }

                if let Some(notice) = &snap.notice {
                    warn!("{}", notice.message());
                }

                match snap.state {
                    SessionState::Active => was_running = true,
                    // Session tore itself down (failure or remote end)
                    SessionState::Idle if was_running || snap.notice.is_some() => break,
                    _ => {}
                }
            }
        }
    }

    controller.stop().await;

    let stats = controller.stats().await;
    info!(
        "Session over: {:.1}s, {} frames sent, {} events, {} finalized utterances",
        stats.duration_secs, stats.frames_sent, stats.events_received, stats.finalized_count
    );

    Ok(())
}
