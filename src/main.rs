use stroke_sync::device_link::{DeviceLink, LinkConfig};
use stroke_sync::driver::PlaybackDriver;
use stroke_sync::predictor::SpeedPredictor;
use stroke_sync::scheduler::CommandScheduler;
use stroke_sync::script;
use stroke_sync::segmenter;
use stroke_sync::sim_server::{SimServer, SimServerConfig};
use stroke_sync::types::*;

use clap::Parser;
use crossbeam_channel::bounded;
use log::{error, info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "stroke-sync")]
#[command(about = "Script-synchronized haptic device control engine")]
struct Cli {
    /// Device-control server URL
    #[arg(long, default_value = "ws://127.0.0.1:12345/link")]
    server: String,

    /// Funscript to play
    #[arg(long)]
    script: Option<PathBuf>,

    /// Beat timestamp file: detect rhythmic segments and exit
    #[arg(long)]
    beats: Option<PathBuf>,

    /// Run against the built-in simulator server (no hardware required)
    #[arg(long)]
    simulate: bool,

    /// Start playback from this offset (seconds)
    #[arg(long, default_value_t = 0.0)]
    seek: f64,

    /// Minimum gap between device commands (ms)
    #[arg(long, default_value_t = 100)]
    min_gap_ms: u64,

    /// Playback clock poll interval (ms)
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Device calibration: full strokes per second at top speed
    #[arg(long, default_value_t = 6.0)]
    full_lengths_per_second: f64,

    /// Device calibration: per-move reversal overhead (ms)
    #[arg(long, default_value_t = 20)]
    turnaround_ms: u64,

    /// Target device index (default: first device accepting StrokeCmd)
    #[arg(long)]
    device: Option<u32>,

    /// Enable asymmetric speed smoothing
    #[arg(long)]
    smooth: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    info!("═══════════════════════════════════════════════");
    info!("  STROKE SYNC v{}", env!("CARGO_PKG_VERSION"));
    info!("  Mode: {}", if cli.simulate { "SIMULATOR" } else { "LIVE" });
    info!("═══════════════════════════════════════════════");

    // ─── Beat-file mode: segment and report, no device needed ────────
    if let Some(path) = &cli.beats {
        let beats = match script::load_beat_times(path) {
            Ok(b) => b,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        };
        let segments = segmenter::segment(&beats);
        info!("{} segment(s) detected:", segments.len());
        for seg in &segments {
            info!(
                "  {:>8}ms  {:<14} cycle={:.0}ms beats={} span={:.0}ms",
                seg.start_ms, seg.pattern.name, seg.cycle_ms, seg.beats, seg.total_ms
            );
        }
        return;
    }

    let script_path = match &cli.script {
        Some(p) => p.clone(),
        None => {
            error!("Nothing to do: pass --script or --beats");
            std::process::exit(2);
        }
    };
    let actions = match script::load_funscript(&script_path) {
        Ok(a) => a,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    // ─── Server: real or built-in simulator ──────────────────────────
    // The accept loop runs detached for the life of the process.
    let server_url = if cli.simulate {
        let sim = SimServer::spawn(SimServerConfig::default()).expect("spawn simulator");
        sim.url()
    } else {
        cli.server.clone()
    };

    let link = match DeviceLink::connect(LinkConfig {
        url: server_url,
        ..LinkConfig::default()
    }) {
        Ok(l) => l,
        Err(e) => {
            // Recoverable and reportable, not a panic.
            error!("Cannot reach device server: {}", e);
            std::process::exit(1);
        }
    };

    // ─── Target device ───────────────────────────────────────────────
    let device = pick_device(&link, cli.device);
    let device = match device {
        Some(d) => {
            info!("Target device: {}", d);
            Some(d)
        }
        None => {
            // Degraded playback, not a halt: video keeps going, no haptics.
            warn!("No usable device; playing without output");
            None
        }
    };

    // ─── Pipeline: driver → scheduler → link pump ────────────────────
    let scheduler = CommandScheduler::new(Duration::from_millis(cli.min_gap_ms));
    let (cmd_tx, cmd_rx) = bounded::<DeviceCommand>(64);
    scheduler.start(cmd_tx);

    let predictor = SpeedPredictor {
        full_lengths_per_second: cli.full_lengths_per_second,
        turnaround_delay: cli.turnaround_ms as f64 / 1000.0,
    };
    let mut driver = PlaybackDriver::new(
        actions,
        predictor,
        DeviceLimits::default(),
        scheduler.clone(),
    )
    .with_smoothing(cli.smooth);

    let seek_ms = (cli.seek.max(0.0) * 1000.0) as u64;
    let clock = SessionClock::new();

    thread::scope(|scope| {
        // Pump: paced commands out of the scheduler into the link.
        scope.spawn(|| {
            for cmd in cmd_rx.iter() {
                let Some(target) = &device else { continue };
                if let Err(e) = link.send_stroke(target.index, cmd.position, cmd.speed) {
                    // Keep playing degraded; the device may come back.
                    warn!("Stroke command failed: {}", e);
                    if link.is_closed() {
                        break;
                    }
                }
            }
        });

        driver.play();
        if seek_ms > 0 {
            driver.seek(seek_ms);
        }
        loop {
            let now = clock.now_ms() + seek_ms;
            driver.tick(now);
            if driver.at_end() {
                info!("Script complete");
                break;
            }
            thread::sleep(Duration::from_millis(cli.tick_ms));
        }
        driver.pause();

        // Idle-state hook: park the device before tearing down.
        if let Some(target) = &device {
            if let Err(e) = link.stop_device(target.index) {
                warn!("Stop notification failed: {}", e);
            }
        }
        // Closing the scheduler drops its sender, which ends the pump.
        scheduler.close();
    });

    link.disconnect();
}

/// Pick the playback target: an explicit index, or the first device that
/// accepts stroke commands, waiting briefly for discovery if the roster
/// was empty at connect.
fn pick_device(link: &DeviceLink, requested: Option<u32>) -> Option<DeviceInfo> {
    if let Some(index) = requested {
        return link.devices().into_iter().find(|d| d.index == index);
    }
    if let Some(found) = link.first_device(Some("StrokeCmd")) {
        return Some(found);
    }
    // Connect already kicked off a scan; give discovery a moment.
    info!("Waiting for device discovery...");
    let events = link.events();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(DeviceEvent::Added(_)) | Ok(DeviceEvent::ScanningFinished) => {
                if let Some(found) = link.first_device(Some("StrokeCmd")) {
                    return Some(found);
                }
            }
            Ok(_) => {}
            Err(_) => {}
        }
    }
    link.first_device(Some("StrokeCmd"))
}
