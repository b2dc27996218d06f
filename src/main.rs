use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use meshvoice::cli::{self, Args};
use meshvoice::config::VoiceConfig;
use meshvoice::session::{AudioDevices, Endpoint, SessionReport, VoiceSession};
use meshvoice::transport::{loopback, Delivery, Transport, UdpTransport};
use meshvoice::voice::device::{MeteredRender, RenderMeter, ToneCapture};

/// Test tone fed to the capture side
const TONE_HZ: f32 = 440.0;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
    };

    if args.help {
        cli::print_help();
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshvoice=info".parse()?),
        )
        .init();

    info!("meshvoice v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = VoiceConfig::from_env()?;
    info!("Configuration loaded");
    info!(
        "  Audio: {} {} Hz x{}, {} ms frames",
        config.codec, config.sample_rate, config.channels, config.frame_ms
    );
    info!(
        "  Buffer: max {} ms, warm-up {} frame(s), idle timeout {} ms",
        config.buffer_ms_max, config.warmup_frames, config.idle_timeout_ms
    );

    // Handle --validate mode
    if args.validate {
        info!("Validating configuration...");
        match config.validate() {
            Ok(()) => {
                info!("Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let report = if args.loopback {
        let (transport, inbox) = loopback(args.impairment.clone());
        run_session(&config, &args, Arc::new(transport), (), inbox).await?
    } else {
        let Some(peer) = config.peer_addr else {
            bail!("MESHVOICE_PEER_ADDR must be set unless running with --loopback");
        };
        let transport = UdpTransport::bind(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind voice socket on {}", config.bind_addr))?;
        info!("Sending to {} from {}", peer, transport.local_addr()?);
        let inbound = transport.inbound();
        run_session(&config, &args, Arc::new(transport), peer, inbound).await?
    };

    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}

async fn run_session<T, D>(
    config: &VoiceConfig,
    args: &Args,
    transport: Arc<T>,
    destination: T::Destination,
    inbound: D,
) -> Result<SessionReport>
where
    T: Transport,
    D: Delivery,
{
    let (render, meter) = MeteredRender::new();
    let devices = AudioDevices {
        capture: Box::new(ToneCapture::new(config.sample_rate, config.channels, TONE_HZ)),
        render: Box::new(render),
    };
    let endpoint = Endpoint {
        transport,
        destination,
        inbound,
    };

    let session = VoiceSession::start(config, config.build_codec()?, endpoint, devices)
        .context("Failed to start voice session")?;

    let duration = args.duration;
    let report = session
        .run_until(async move {
            match duration {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => info!("Run time of {:?} elapsed", duration),
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        })
        .await;

    log_summary(&report, &meter);
    Ok(report)
}

fn log_summary(report: &SessionReport, meter: &RenderMeter) {
    let jitter = &report.jitter;
    info!(
        "Jitter buffer: {} received, {} reordered, {} duplicate, {} stale, {} evicted, {} malformed",
        jitter.frames_received,
        jitter.frames_reordered,
        jitter.duplicates,
        jitter.stale,
        jitter.evicted,
        jitter.malformed
    );
    if let Some(playout) = &report.playout {
        info!(
            "Playout ({:?}): {} played, {} underruns, {} decode failures, {} resyncs",
            playout.reason,
            playout.stats.frames_played,
            playout.stats.underruns,
            playout.stats.decode_failures,
            playout.stats.resyncs
        );
    }
    if let Some(sequencer) = &report.sequencer {
        info!(
            "Sequencer ({:?}): {} emitted, {} encode failures, {} send failures",
            sequencer.reason,
            sequencer.stats.frames_emitted,
            sequencer.stats.encode_failures,
            sequencer.stats.send_failures
        );
    }
    info!(
        "Render: {} writes ({} silent), {} samples",
        meter.writes(),
        meter.silent_writes(),
        meter.samples()
    );
}
