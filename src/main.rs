//! Unicam + bcm2835 ISP capture with closed-loop camera control

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use color_eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

use isp_capture::capture::{Frame, UnicamIsp};
use isp_capture::pipeline::{run_producer, Consumer, Outlet};
use isp_capture::tuning::Tuning;
use isp_capture::Config;

#[derive(Parser, Debug)]
#[command(name = "isp-capture", version, about = "Capture frames through Unicam and the bcm2835 ISP")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "ISP_CAPTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Debug logging for this crate
    #[arg(short, long)]
    verbose: bool,
}

/// Counts frames and reports the rate once a second.
struct Throughput {
    frames: u64,
    bytes: u64,
    started: Instant,
    window_start: Instant,
    window_frames: u64,
}

impl Throughput {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frames: 0,
            bytes: 0,
            started: now,
            window_start: now,
            window_frames: 0,
        }
    }

    fn summary(&self) {
        let secs = self.started.elapsed().as_secs_f64();
        let fps = if secs > 0.0 { self.frames as f64 / secs } else { 0.0 };
        info!(frames = self.frames, bytes = self.bytes, seconds = secs, fps, "Capture finished");
    }
}

impl Consumer for Throughput {
    type Input = Frame;

    fn consume(&mut self, frame: Frame) {
        self.frames += 1;
        self.window_frames += 1;
        self.bytes += frame.data.len() as u64;

        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let latency = frame.timestamp.elapsed();
            info!(
                fps = self.window_frames as f64 / elapsed.as_secs_f64(),
                sequence = frame.meta.sequence,
                width = frame.meta.width,
                height = frame.meta.height,
                latency_us = latency.as_micros() as u64,
                "Throughput"
            );
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("isp_capture=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("isp_capture=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(uptime())
        .init();

    info!("isp-capture starting");

    let config = Config::load(args.config.as_deref())?;
    let tuning = match &config.tuning_file {
        Some(path) => Tuning::load(path)?,
        None => {
            warn!("No tuning file configured, using built-in defaults");
            Tuning::default()
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let mut outlet = Outlet::new(&config.pipeline);
    let rx = outlet.connect();

    let capture = {
        let running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(core) = core_affinity::get_core_ids().and_then(|ids| ids.last().copied()) {
                if core_affinity::set_for_current(core) {
                    debug!(core = core.id, "Capture thread pinned");
                }
            }
            let mut session = UnicamIsp::open(&config, &tuning)?;
            run_producer(&mut session, &mut outlet, &running)?;
            Ok(())
        })
    };

    let mut throughput = Throughput::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            frame = rx.recv_async() => match frame {
                Ok(frame) => {
                    throughput.consume(frame);
                    if args.frames.is_some_and(|n| throughput.frames >= n) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    drop(rx);
    capture.await??;
    throughput.summary();
    Ok(())
}
