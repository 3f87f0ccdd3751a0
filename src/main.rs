use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use live_voice::audio::{
    AudioCapturePipeline, CaptureBackend, ContextRegistry, DeviceRegistry, OutputContext,
};
use live_voice::http::{create_router, AppState, SessionDefaults};
use live_voice::nats::NatsClient;
use live_voice::session::{ClientConfig, SessionClient};
use live_voice::voice::VoiceSession;
use live_voice::Config;

/// Live voice - realtime voice sessions with a speech model
#[derive(Parser)]
#[command(name = "live-voice", version, about)]
struct Cli {
    /// Config file path (extension optional)
    #[arg(short, long, env = "LIVE_VOICE_CONFIG", default_value = "config/live-voice")]
    config: String,

    /// Do not start the HTTP control API
    #[arg(long)]
    no_http: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("Live Voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let nats = NatsClient::connect(&cfg.nats.url).await?;

    let client = SessionClient::new(
        Arc::new(nats.transport(&cfg.nats.transport_prefix)),
        Arc::new(nats.interaction_store(&cfg.nats.interactions_subject)),
        Arc::new(nats.diagnostics(&cfg.nats.diagnostics_subject)),
        ClientConfig {
            disconnect_timeout: cfg.session.disconnect_timeout(),
            ..Default::default()
        },
    );

    let (backend, devices) = hardware()?;
    let capture = AudioCapturePipeline::new(backend, cfg.audio.capture());
    let output_rate = cfg.audio.output_sample_rate;

    let voice = VoiceSession::new(
        client,
        capture,
        Arc::new(ContextRegistry::new()),
        || open_output(output_rate),
        Some(devices),
        cfg.audio.voice(),
    )
    .context("Failed to open audio output")?;
    let voice = Arc::new(voice);

    if cli.no_http {
        info!("HTTP API disabled, waiting for shutdown signal");
        tokio::signal::ctrl_c().await?;
    } else {
        let defaults = SessionDefaults {
            model: cfg.session.model.clone(),
            config: cfg.session.live_config(),
        };
        let app = create_router(AppState::new(Arc::clone(&voice), defaults));

        let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("HTTP server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("HTTP server failed")?;
    }

    info!("Shutting down");
    voice.stop().await;
    voice.disconnect().await;
    if let Err(e) = nats.close().await {
        warn!("{:#}", e);
    }

    Ok(())
}

#[cfg(feature = "device")]
fn hardware() -> Result<(Arc<dyn CaptureBackend>, Arc<dyn DeviceRegistry>)> {
    use live_voice::audio::hardware::{CpalCaptureBackend, CpalDeviceRegistry};

    Ok((
        Arc::new(CpalCaptureBackend::new()),
        Arc::new(CpalDeviceRegistry::default()),
    ))
}

#[cfg(not(feature = "device"))]
fn hardware() -> Result<(Arc<dyn CaptureBackend>, Arc<dyn DeviceRegistry>)> {
    anyhow::bail!("built without audio hardware support, rebuild with --features device")
}

#[cfg(feature = "device")]
fn open_output(sample_rate: u32) -> live_voice::Result<Arc<dyn OutputContext>> {
    use live_voice::audio::hardware::CpalOutputContext;

    Ok(Arc::new(CpalOutputContext::new(None, sample_rate)?))
}

#[cfg(not(feature = "device"))]
fn open_output(_sample_rate: u32) -> live_voice::Result<Arc<dyn OutputContext>> {
    Err(live_voice::Error::Device("no audio output support".to_string()))
}
