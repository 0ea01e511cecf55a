use anyhow::{Result, anyhow};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use roadhud::config::EngineConfig;
use roadhud::render::LogRenderer;
use roadhud::sensor::{self, Fix};
use roadhud::session::DriveSession;
use roadhud::source::{OverpassClient, RoadSource, StaticRoadSource};

struct Args {
    trace: Option<String>,
    config: Option<String>,
    roads: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        trace: None,
        config: None,
        roads: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                args.config = Some(iter.next().ok_or_else(|| anyhow!("--config needs a path"))?)
            }
            "--roads" => {
                args.roads = Some(iter.next().ok_or_else(|| anyhow!("--roads needs a path"))?)
            }
            _ if args.trace.is_none() => args.trace = Some(arg),
            _ => return Err(anyhow!("Unexpected argument {}", arg)),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .init();
    info!("Starting roadhud");

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let (tx, rx) = mpsc::channel::<Fix>(config.fix_buffer.max(1));

    // Sensor side: replay a recorded drive, or park at the fallback point
    let trace = match &args.trace {
        Some(path) => match sensor::load_trace(path).await {
            Ok(trace) => Some(trace),
            Err(e) => {
                warn!("{}, using fallback position", e);
                None
            }
        },
        None => None,
    };
    let sensor_task = tokio::spawn(async move {
        match trace {
            Some(trace) => sensor::replay_trace(trace, tx).await,
            None => usize::from(tx.send(sensor::fallback_fix()).await.is_ok()),
        }
    });

    match &args.roads {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| anyhow!("Failed to read road data {}: {}", path, e))?;
            let source = StaticRoadSource::from_overpass_json(&bytes)?;
            info!("Loaded {} road segments from {}", source.len(), path);
            drive(config, source, rx).await;
        }
        None => {
            let source = OverpassClient::new(config.overpass.clone())?;
            drive(config, source, rx).await;
        }
    }

    let delivered = sensor_task.await?;
    info!("Sensor delivered {} fixes", delivered);
    Ok(())
}

async fn drive<S: RoadSource>(config: EngineConfig, source: S, fixes: mpsc::Receiver<Fix>) {
    let session = DriveSession::new(config, Arc::new(source), LogRenderer::default());
    session.run(fixes).await;
}
