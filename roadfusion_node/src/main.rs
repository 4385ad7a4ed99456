//! RoadFusion RSU node.
//!
//! Wires the core pipeline together: sensor producers push detection
//! batches into the bounded queue, the fusion worker thread consumes and
//! fuses them, and the output loop broadcasts RSM frames. A small
//! single-threaded tokio runtime handles the control plane only (signals
//! and live config reload); the data plane is plain blocking threads.

mod sim;

use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use roadfusion_core::{
    now_micros, v2x, FusionEngine, FusionWorker, MessageQueue, PipelineMetrics, SystemConfig,
};

/// MEC roadside perception fusion node.
#[derive(Parser, Debug)]
#[command(name = "roadfusion-node")]
#[command(about = "Fuse roadside sensor detections and broadcast V2X RSM frames", long_about = None)]
struct Args {
    /// Run against a scripted simulation scene instead of hardware.
    #[arg(short = 's', long)]
    sim: bool,

    /// Configuration file (TOML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Seed for the simulation scene.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SystemConfig> {
    match &args.config {
        Some(path) => match SystemConfig::load(path) {
            Ok(cfg) => {
                info!(path = %path.display(), "configuration loaded");
                Ok(cfg)
            }
            Err(err) if args.sim => {
                warn!(%err, "configuration unusable, running simulation with defaults");
                Ok(SystemConfig::default())
            }
            Err(err) => Err(err).context("failed to load configuration"),
        },
        None => Ok(SystemConfig::default()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("RoadFusion node starting");
    let config = load_config(&args)?;

    let queue = Arc::new(MessageQueue::new(config.queue.capacity));
    let engine = Arc::new(Mutex::new(FusionEngine::new(config.fusion.clone())));
    let running = Arc::new(AtomicBool::new(true));
    let metrics = Arc::new(PipelineMetrics::new());

    let worker = FusionWorker::new(
        Arc::clone(&engine),
        Arc::clone(&queue),
        Arc::clone(&running),
    )
    .with_metrics(Arc::clone(&metrics))
    .spawn()
    .context("failed to spawn fusion worker")?;

    let mut producers: Vec<JoinHandle<()>> = Vec::new();
    if args.sim {
        producers = sim::spawn_producers(
            Arc::clone(&queue),
            Arc::clone(&running),
            args.seed,
            config.video.camera_id,
            config.radar.radar_id,
        );
    } else {
        warn!(
            "no built-in sensor adapters enabled; external producers must \
             push batches through the message queue"
        );
    }

    let output = spawn_output_loop(
        Arc::clone(&engine),
        Arc::clone(&queue),
        Arc::clone(&running),
        Arc::clone(&metrics),
        config.clone(),
    )?;

    run_control_plane(&args, &engine).await;

    info!("RoadFusion node shutting down");
    running.store(false, Ordering::Relaxed);
    queue.close();

    for handle in producers {
        let _ = handle.join();
    }
    let _ = output.join();
    let _ = worker.join();

    let stats = engine
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .stats();
    info!(
        cycles = stats.cycles,
        tracks_created = stats.tracks_created,
        tracks_evicted = stats.tracks_evicted,
        "RoadFusion node stopped"
    );
    Ok(())
}

/// Blocks on SIGINT/SIGTERM; SIGHUP reloads the fusion parameters.
async fn run_control_plane(args: &Args, engine: &Arc<Mutex<FusionEngine>>) {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to install signal handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to install signal handler");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to install signal handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("received SIGINT");
                break;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = hangup.recv() => {
                let Some(path) = &args.config else {
                    warn!("SIGHUP received but no config file was given");
                    continue;
                };
                match SystemConfig::load(path) {
                    Ok(cfg) => {
                        engine
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .apply_config(cfg.fusion);
                        info!("configuration reloaded");
                    }
                    Err(err) => warn!(%err, "config reload failed, keeping current parameters"),
                }
            }
        }
    }
}

/// Spawns the broadcast thread: every 100 ms it takes the latest fused
/// snapshot, encodes an RSM frame and ships it to the configured UDP
/// target (or logs it when none is set). Pipeline metrics are reported
/// every five seconds.
fn spawn_output_loop(
    engine: Arc<Mutex<FusionEngine>>,
    queue: Arc<MessageQueue>,
    running: Arc<AtomicBool>,
    metrics: Arc<PipelineMetrics>,
    config: SystemConfig,
) -> anyhow::Result<JoinHandle<()>> {
    let socket = match &config.v2x.target {
        Some(_) => Some(
            UdpSocket::bind("0.0.0.0:0").context("failed to bind V2X output socket")?,
        ),
        None => None,
    };

    let handle = std::thread::Builder::new()
        .name("v2x-output".into())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            let mut last_report = Instant::now();

            while running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));

                let (snapshot, stats) = {
                    let engine = engine.lock().unwrap_or_else(|e| e.into_inner());
                    (engine.snapshot(), engine.stats())
                };
                if last_report.elapsed() >= Duration::from_secs(5) {
                    last_report = Instant::now();
                    let snap = metrics.snapshot(&queue, stats);
                    match serde_json::to_string(&snap) {
                        Ok(json) => info!(metrics = %json, "pipeline metrics"),
                        Err(_) => info!(?snap, "pipeline metrics"),
                    }
                }

                if snapshot.is_empty() {
                    continue;
                }

                let timestamp_ms = (now_micros() / 1000) as u64;
                match v2x::encode_rsm(&snapshot, config.v2x.rsu_id, timestamp_ms, &mut buf) {
                    Ok(len) => {
                        match (&socket, &config.v2x.target) {
                            (Some(socket), Some(target)) => {
                                if let Err(err) = socket.send_to(&buf[..len], target.as_str()) {
                                    warn!(%err, %target, "RSM send failed");
                                }
                            }
                            _ => {
                                debug!(tracks = snapshot.len(), bytes = len, "RSM frame ready");
                                for track in snapshot.iter() {
                                    debug!(
                                        id = track.id,
                                        lat = track.position.latitude,
                                        lon = track.position.longitude,
                                        vel = track.velocity,
                                        heading = track.heading,
                                        conf = track.confidence,
                                        "fused track"
                                    );
                                }
                            }
                        }
                    }
                    Err(err) => warn!(%err, "RSM encode failed"),
                }
            }
        })
        .context("failed to spawn output thread")?;
    Ok(handle)
}
