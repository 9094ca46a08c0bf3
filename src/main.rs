use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use webrtc::media::Sample;

use echo_room::mesh::{LocalAudio, WebRtcBackend, OPUS_SILENCE_FRAME};
use echo_room::{ClientConfig, RoomClient, RoomCommand, RoomMonitor, SessionEnd};

/// Opus frame length fed to the outbound track.
const FRAME_DURATION: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echo_room=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env()?;
    info!(
        room_id = %config.room_id,
        user_id = %config.user_id,
        display_name = %config.display_name,
        url = %config.signaling_url,
        "echo-room starting"
    );

    let backend = Arc::new(WebRtcBackend::new(&config.ice_servers)?);
    let source = tokio::spawn(feed_local_audio(backend.local_audio()));

    let mut client = RoomClient::from_config(&config, backend);
    let (commands_tx, mut commands) = mpsc::channel(16);
    tokio::spawn(read_keyboard(commands_tx.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = commands_tx.send(RoomCommand::Leave).await;
        }
    });
    tokio::spawn(log_room_view(client.monitor()));

    println!("Commands: m = toggle mute, q = leave");

    let mut reconnect_attempts = 0;
    let outcome = loop {
        match client
            .connect_and_run(&config.signaling_url, &mut commands)
            .await
        {
            Ok(SessionEnd::Left) => break Ok(()),
            Ok(SessionEnd::TransportClosed { reason }) => {
                warn!(reason = ?reason, "Connection to relay lost");
                reconnect_attempts = 0;
            }
            Err(e) => warn!(error = %e, "Connection attempt failed"),
        }

        if client.rejected_permanently() {
            break Err(anyhow::anyhow!(
                "relay refused the join: {}",
                client.state().error.clone().unwrap_or_default()
            ));
        }
        if reconnect_attempts >= config.reconnect_attempts {
            break Err(anyhow::anyhow!("Max reconnection attempts reached"));
        }
        reconnect_attempts += 1;
        info!(
            attempt = reconnect_attempts,
            max = config.reconnect_attempts,
            "Reconnecting"
        );

        if !wait_before_reconnect(&mut client, &mut commands, config.reconnect_delay).await {
            break Ok(());
        }
    };

    source.abort();
    outcome?;
    info!("Left the room");
    Ok(())
}

/// Sleeps out the reconnect delay while still honouring local commands.
/// Returns `false` if the user left in the meantime.
async fn wait_before_reconnect(
    client: &mut RoomClient,
    commands: &mut mpsc::Receiver<RoomCommand>,
    delay: Duration,
) -> bool {
    let deadline = sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => return true,
            command = commands.recv() => match command {
                Some(RoomCommand::SetMuted(muted)) => client.set_muted(muted).await,
                Some(RoomCommand::ToggleMute) => client.set_muted(!client.is_muted()).await,
                Some(RoomCommand::Leave) | None => {
                    client.leave().await;
                    return false;
                }
            },
        }
    }
}

async fn read_keyboard(commands: mpsc::Sender<RoomCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match line.trim() {
            "m" => RoomCommand::ToggleMute,
            "q" => RoomCommand::Leave,
            "" => continue,
            other => {
                println!("Unknown command: {other}");
                continue;
            }
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }
}

async fn log_room_view(monitor: RoomMonitor) {
    let mut states = monitor.subscribe();
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        info!(
            status = %state.connection_status,
            room_id = %state.room_id,
            participants = state.participant_count(),
            "Room updated"
        );
        if let Some(error) = &state.error {
            println!("! {error}");
        }
        for row in state.view() {
            println!("  {row}");
        }
    }
}

async fn feed_local_audio(audio: LocalAudio) {
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    let frame = Sample {
        data: Bytes::from_static(&OPUS_SILENCE_FRAME),
        duration: FRAME_DURATION,
        ..Default::default()
    };
    loop {
        ticker.tick().await;
        if let Err(e) = audio.write_sample(&frame).await {
            debug!(error = %e, "Failed to write local audio frame");
        }
    }
}
