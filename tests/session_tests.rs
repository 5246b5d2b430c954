// Integration tests for the session orchestrator
//
// These tests run whole voice sessions against the loopback gateway:
// recording round trips, live listeners, grace windows, connection loss
// and channel changes.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use voice_relay::config::{RecordingConfig, VoiceConfig};
use voice_relay::{
    ChannelId, Config, ConnectionState, GuildId, LoopbackGateway, ParticipantId,
    SessionOrchestrator, SessionPhase, Transcoder, VoiceConnection, VoiceError,
};

/// Records what it was asked to convert and copies the raw capture through
#[derive(Default)]
struct CapturingTranscoder {
    inputs: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Transcoder for CapturingTranscoder {
    async fn transcode(&self, raw: &Path, output: &Path) -> voice_relay::Result<()> {
        let bytes = tokio::fs::read(raw).await?;
        tokio::fs::write(output, &bytes).await?;
        self.inputs.lock().unwrap().push(bytes);
        Ok(())
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        voice: VoiceConfig {
            reconnect_window_secs: 1,
            ..VoiceConfig::default()
        },
        recording: RecordingConfig {
            sounds_path: root.join("sounds"),
            temp_path: root.join("capture"),
            min_capture_bytes: 4,
            ..RecordingConfig::default()
        },
        ..Config::default()
    }
}

fn orchestrator(
    config: &Config,
    gateway: &LoopbackGateway,
    transcoder: Arc<CapturingTranscoder>,
) -> Arc<SessionOrchestrator> {
    SessionOrchestrator::new(config, Arc::new(gateway.clone()), transcoder)
}

/// Poll until `condition` holds, failing after a few seconds
async fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_full_recording_round_trip() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let transcoder = Arc::new(CapturingTranscoder::default());
    let orchestrator = orchestrator(&config, &gateway, transcoder.clone());

    let (guild, channel, user_a) = (GuildId(1), ChannelId(42), ParticipantId(7));

    let job = orchestrator
        .start_recording(guild, channel, Some("round trip"))
        .await?;
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Active);

    let conn = gateway.connection(guild, channel).expect("connected");
    assert_eq!(conn.state(), ConnectionState::Ready);

    conn.start_speaking(user_a);
    wait_until(|| conn.is_streaming(user_a)).await?;

    for chunk in [[0x01u8, 0x02], [0x03, 0x04], [0x05, 0x06]] {
        assert!(conn.push_audio(user_a, chunk.to_vec()).await);
    }

    // All six bytes must reach the raw file before stopping
    for _ in 0..200 {
        if orchestrator.recording_status(guild).await.bytes_written == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let saved = orchestrator.stop_recording(guild).await?;

    // Verify: transcoder saw exactly those bytes, in order
    assert_eq!(
        *transcoder.inputs.lock().unwrap(),
        vec![vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06]]
    );
    assert_eq!(saved.sound_name, "round_trip");
    assert!(saved.path.exists());
    assert!(!job.raw_path.exists());

    // Verify: nothing left active, connection released
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Idle);
    assert!(orchestrator.session(guild).await.is_none());
    assert_eq!(conn.destroy_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_listener_and_recording_share_the_capture() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let orchestrator = orchestrator(&config, &gateway, Arc::default());

    let (guild, channel, speaker) = (GuildId(2), ChannelId(5), ParticipantId(11));

    orchestrator.start_recording(guild, channel, None).await?;
    orchestrator.start_broadcast(guild, channel).await?;
    assert_eq!(gateway.connect_count(), 1);

    let mut listener = orchestrator.open_listener(guild).await?;
    assert_eq!(orchestrator.live_status(guild).listener_count, 1);

    let conn = gateway.latest(guild).expect("connected");
    conn.start_speaking(speaker);
    wait_until(|| conn.is_streaming(speaker)).await?;
    conn.push_audio(speaker, vec![9u8, 9, 9, 9]).await;

    let chunk = tokio::time::timeout(Duration::from_secs(5), listener.next()).await?;
    assert_eq!(chunk.as_deref(), Some(&[9u8, 9, 9, 9][..]));

    let info = orchestrator.session(guild).await.expect("session");
    assert!(info.recording);
    assert!(info.broadcasting);
    assert_eq!(info.channel_id, channel);
    assert_eq!(info.speakers, 1);

    // Stopping the broadcast keeps the connection for the recording
    orchestrator.stop_broadcast(guild).await?;
    assert_eq!(listener.next().await, None);
    assert_eq!(conn.destroy_count(), 0);
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Active);

    // Stopping the recording releases it
    orchestrator.stop_recording(guild).await?;
    assert_eq!(conn.destroy_count(), 1);
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Idle);

    Ok(())
}

#[tokio::test]
async fn test_silent_recording_reports_no_audio() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let transcoder = Arc::new(CapturingTranscoder::default());
    let orchestrator = orchestrator(&config, &gateway, transcoder.clone());

    let job = orchestrator
        .start_recording(GuildId(3), ChannelId(1), Some("silence"))
        .await?;
    let result = orchestrator.stop_recording(GuildId(3)).await;

    assert!(matches!(result, Err(VoiceError::NoAudioCaptured { bytes: 0 })));
    assert!(transcoder.inputs.lock().unwrap().is_empty());
    assert!(!job.raw_path.exists());
    assert!(!job.final_path.exists());
    assert_eq!(orchestrator.phase(GuildId(3)).await, SessionPhase::Idle);

    Ok(())
}

#[tokio::test]
async fn test_precondition_errors_leave_state_alone() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let orchestrator = orchestrator(&config, &gateway, Arc::default());

    assert!(matches!(
        orchestrator.stop_recording(GuildId(4)).await,
        Err(VoiceError::NoActiveRecording(GuildId(4)))
    ));
    assert!(matches!(
        orchestrator.stop_broadcast(GuildId(4)).await,
        Err(VoiceError::NoActiveBroadcast(GuildId(4)))
    ));
    assert!(matches!(
        orchestrator.open_listener(GuildId(4)).await,
        Err(VoiceError::NoActiveBroadcast(GuildId(4)))
    ));

    orchestrator.start_broadcast(GuildId(4), ChannelId(1)).await?;
    assert!(matches!(
        orchestrator.start_broadcast(GuildId(4), ChannelId(1)).await,
        Err(VoiceError::AlreadyBroadcasting(GuildId(4)))
    ));
    assert!(orchestrator.live_status(GuildId(4)).is_streaming);
    assert_eq!(gateway.connect_count(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_listener_rejoining_within_grace_keeps_connection() -> Result<()> {
    let gateway = LoopbackGateway::new();
    let orchestrator = orchestrator(&Config::default(), &gateway, Arc::default());
    let guild = GuildId(5);

    orchestrator.start_broadcast(guild, ChannelId(8)).await?;
    let conn = gateway.latest(guild).expect("connected");

    let first = orchestrator.open_listener(guild).await?;
    drop(first);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let _second = orchestrator.open_listener(guild).await?;

    tokio::time::sleep(Duration::from_secs(10)).await;

    // Verify: connection never destroyed, broadcast still live
    assert_eq!(conn.destroy_count(), 0);
    assert!(orchestrator.live_status(guild).is_streaming);
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Active);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_empty_broadcast_released_after_grace() -> Result<()> {
    let gateway = LoopbackGateway::new();
    let orchestrator = orchestrator(&Config::default(), &gateway, Arc::default());
    let guild = GuildId(6);

    orchestrator.start_broadcast(guild, ChannelId(8)).await?;
    let conn = gateway.latest(guild).expect("connected");

    drop(orchestrator.open_listener(guild).await?);
    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_until(|| conn.destroy_count() == 1).await?;

    assert!(!orchestrator.live_status(guild).is_streaming);
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Idle);

    Ok(())
}

#[tokio::test]
async fn test_connection_loss_stops_everything() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let transcoder = Arc::new(CapturingTranscoder::default());
    let orchestrator = orchestrator(&config, &gateway, transcoder.clone());
    let guild = GuildId(7);

    let job = orchestrator.start_recording(guild, ChannelId(3), None).await?;
    orchestrator.start_broadcast(guild, ChannelId(3)).await?;
    let mut listener = orchestrator.open_listener(guild).await?;

    let conn = gateway.latest(guild).expect("connected");
    conn.set_state(ConnectionState::Disconnected);

    // Listener sees the stream end once the reconnect window passes
    let end = tokio::time::timeout(Duration::from_secs(5), listener.next()).await?;
    assert_eq!(end, None);

    wait_until(|| conn.destroy_count() == 1).await?;
    for _ in 0..200 {
        if orchestrator.phase(guild).await == SessionPhase::Idle
            && !orchestrator.recording_status(guild).await.is_recording
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Verify: recording discarded, broadcast gone, nothing transcoded
    assert!(!orchestrator.recording_status(guild).await.is_recording);
    assert!(!orchestrator.live_status(guild).is_streaming);
    assert!(!job.raw_path.exists());
    assert!(transcoder.inputs.lock().unwrap().is_empty());
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Idle);
    assert!(orchestrator.session(guild).await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_reconnect_within_window_keeps_session() -> Result<()> {
    let gateway = LoopbackGateway::new();
    let temp_dir = TempDir::new()?;
    let orchestrator = orchestrator(&test_config(temp_dir.path()), &gateway, Arc::default());
    let guild = GuildId(8);

    orchestrator.start_broadcast(guild, ChannelId(3)).await?;
    let conn = gateway.latest(guild).expect("connected");

    conn.set_state(ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.set_state(ConnectionState::Connecting);
    conn.set_state(ConnectionState::Ready);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(conn.destroy_count(), 0);
    assert!(orchestrator.live_status(guild).is_streaming);

    Ok(())
}

#[tokio::test]
async fn test_channel_change_replaces_session() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let orchestrator = orchestrator(&config, &gateway, Arc::default());
    let guild = GuildId(9);

    orchestrator.start_broadcast(guild, ChannelId(1)).await?;
    let old = gateway.connection(guild, ChannelId(1)).expect("connected");

    orchestrator.start_recording(guild, ChannelId(2), None).await?;
    let new = gateway.connection(guild, ChannelId(2)).expect("connected");

    // Verify: old session torn down before the new one took over
    assert_eq!(old.destroy_count(), 1);
    assert_eq!(new.destroy_count(), 0);
    assert_eq!(gateway.connect_count(), 2);
    assert!(!orchestrator.live_status(guild).is_streaming);

    let info = orchestrator.session(guild).await.expect("session");
    assert_eq!(info.channel_id, ChannelId(2));
    assert!(info.recording);
    assert!(!info.broadcasting);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_join_timeout_rolls_back() -> Result<()> {
    let gateway = LoopbackGateway::new();
    gateway.stall_connections(true);
    let orchestrator = orchestrator(&Config::default(), &gateway, Arc::default());
    let guild = GuildId(10);

    let result = orchestrator.start_broadcast(guild, ChannelId(1)).await;

    assert!(matches!(
        result,
        Err(VoiceError::ConnectionTimeout { timeout_secs: 10, .. })
    ));
    let conn = gateway.latest(guild).expect("connect attempted");
    assert_eq!(conn.destroy_count(), 1);
    assert!(!orchestrator.live_status(guild).is_streaming);
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Idle);
    assert!(orchestrator.session(guild).await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_every_guild() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let orchestrator = orchestrator(&config, &gateway, Arc::default());

    let job = orchestrator
        .start_recording(GuildId(11), ChannelId(1), None)
        .await?;
    orchestrator.start_broadcast(GuildId(12), ChannelId(1)).await?;

    orchestrator.shutdown().await;

    assert!(!job.raw_path.exists());
    assert!(!orchestrator.live_status(GuildId(12)).is_streaming);
    for guild in [GuildId(11), GuildId(12)] {
        assert_eq!(gateway.latest(guild).expect("connected").destroy_count(), 1);
        assert_eq!(orchestrator.phase(guild).await, SessionPhase::Idle);
    }

    Ok(())
}

#[tokio::test]
async fn test_restart_right_after_loss_keeps_new_session() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = test_config(temp_dir.path());
    let gateway = LoopbackGateway::new();
    let orchestrator = orchestrator(&config, &gateway, Arc::default());
    let guild = GuildId(13);

    let job = orchestrator.start_recording(guild, ChannelId(4), None).await?;
    let first = gateway.latest(guild).expect("connected");

    // The platform drops the connection; a new broadcast starts before
    // the loss has necessarily been handled
    first.set_state(ConnectionState::Destroyed);
    orchestrator.start_broadcast(guild, ChannelId(4)).await?;
    let second = gateway.latest(guild).expect("reconnected");

    // Let any queued loss report run
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Verify: the fresh connection and its broadcast survive
    assert_eq!(gateway.connect_count(), 2);
    assert_eq!(second.destroy_count(), 0);
    assert_eq!(second.state(), ConnectionState::Ready);
    assert!(orchestrator.live_status(guild).is_streaming);
    assert!(!orchestrator.recording_status(guild).await.is_recording);
    assert!(!job.raw_path.exists());

    let info = orchestrator.session(guild).await.expect("session");
    assert!(info.broadcasting);
    assert_eq!(orchestrator.phase(guild).await, SessionPhase::Active);

    Ok(())
}
