use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use voice_relay::{serve, Config, FfmpegTranscoder, LoopbackGateway, SessionOrchestrator};

#[derive(Debug, Parser)]
#[command(name = "voice-relay", version, about = "Record and relay voice channels")]
struct Args {
    /// Config file path (extension optional)
    #[arg(long, default_value = "config/voice-relay")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("Voice Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("Sounds directory: {}", cfg.recording.sounds_path.display());

    // No platform SDK is linked in; the loopback gateway accepts every join.
    let gateway = Arc::new(LoopbackGateway::new());
    let transcoder = Arc::new(FfmpegTranscoder::new(&cfg.recording));
    let orchestrator = SessionOrchestrator::new(&cfg, gateway, transcoder);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    serve(listener, orchestrator, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    info!("Voice Relay stopped");
    Ok(())
}
