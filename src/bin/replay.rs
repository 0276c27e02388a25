use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use flate2::read::GzDecoder;
use serde_json::json;

use location_pipeline::quality::{AccuracyGate, GateDecision};
use location_pipeline::{LocationTracker, RawFix, RouteRecorder, ScriptedPlatform, TrackingConfig};

/// Replay a recorded fix log through the location pipeline
#[derive(Parser, Debug)]
struct Args {
    /// JSON array or JSON-lines file of raw fixes (optionally .gz)
    #[arg(long)]
    log: PathBuf,

    /// Tracking config JSON; defaults apply to missing keys
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start in network mode instead of high accuracy
    #[arg(long, default_value_t = false)]
    network: bool,

    /// Only print the final summary
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn read_log(path: &Path) -> anyhow::Result<String> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut text = String::new();
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        BufReader::new(GzDecoder::new(file)).read_to_string(&mut text)?;
    } else {
        BufReader::new(file).read_to_string(&mut text)?;
    }
    Ok(text)
}

fn parse_fixes(text: &str) -> anyhow::Result<Vec<RawFix>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<RawFix>(line).with_context(|| format!("line {}", n + 1))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrackingConfig::load(path)?,
        None => TrackingConfig::default(),
    };
    if args.network {
        config.enable_high_accuracy = false;
    }

    let fixes = parse_fixes(&read_log(&args.log)?)?;
    if fixes.is_empty() {
        bail!("{} contains no fixes", args.log.display());
    }

    // The one-shot request gets the first fix the gate would admit
    let gate = AccuracyGate::new(config.min_accuracy_m, config.max_accuracy_m);
    let Some(first_usable) = fixes
        .iter()
        .position(|fix| gate.admit(fix) == GateDecision::Accepted)
    else {
        bail!("no fix in {} passes the accuracy gate", args.log.display());
    };
    if first_usable > 0 {
        log::info!("Skipping {} leading fixes rejected by the accuracy gate", first_usable);
    }

    let platform = Arc::new(ScriptedPlatform::new());
    platform.queue_fix(fixes[first_usable].clone());
    let tracker = LocationTracker::new(platform.clone());

    let quiet = args.quiet;
    let _printer = tracker.subscribe(move |record| {
        if quiet {
            return;
        }
        match serde_json::to_string(record) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("Failed to encode record: {}", e),
        }
    });
    let _errors = tracker.subscribe_to_errors(|err| log::warn!("Tracker error: {}", err));
    let (route, _route_sub) = RouteRecorder::attach(&tracker);

    tracker.start(config).await?;
    for fix in &fixes[first_usable + 1..] {
        platform.emit_fix(fix.clone());
    }

    let status = tracker.status();
    let summary = {
        let route = route.lock().unwrap_or_else(|e| e.into_inner());
        json!({
            "fixesRead": fixes.len(),
            "status": status,
            "route": {
                "points": route.points().len(),
                "distanceM": route.total_distance_m(),
                "skippedSegments": route.skipped_segments(),
            },
        })
    };
    tracker.stop();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
