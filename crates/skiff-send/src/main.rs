use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use skiff_transfer::{
    FanoutConfig, TracingLogger, load_destinations, parse_destinations, run_fanout,
};
use tracing::{info, warn};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} = {:?}: {}", key, v, e)),
        _ => Ok(default),
    }
}

/// `SKIFF_DESTINATIONS` wins over the `ip port` list in `SKIFF_SERVER_CONFIG`.
fn destinations() -> anyhow::Result<Vec<SocketAddr>> {
    let mut list = if let Ok(inline) = std::env::var("SKIFF_DESTINATIONS") {
        parse_destinations(&inline)?
    } else if let Ok(path) = std::env::var("SKIFF_SERVER_CONFIG") {
        load_destinations(Path::new(&path))?
    } else {
        bail!("set SKIFF_DESTINATIONS or SKIFF_SERVER_CONFIG");
    };

    // SKIFF_SERVER_COUNT keeps only the first N entries of the list
    let count: usize = env_or("SKIFF_SERVER_COUNT", list.len())?;
    if count == 0 || count > list.len() {
        bail!("SKIFF_SERVER_COUNT = {} but {} destinations are configured", count, list.len());
    }
    list.truncate(count);
    Ok(list)
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff_send=debug,skiff_transfer=info".into()),
        )
        .init();

    // Config
    let source: PathBuf = std::env::var("SKIFF_SOURCE")
        .context("SKIFF_SOURCE is not set")?
        .into();
    let dest_name = match std::env::var("SKIFF_DEST_NAME") {
        Ok(name) => name,
        Err(_) => source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("SKIFF_DEST_NAME is not set and the source has no file name")?,
    };

    let mut config = FanoutConfig::new(destinations()?, source.clone(), dest_name);
    config.mss = env_or("SKIFF_MSS", config.mss)?;
    config.window_size = env_or("SKIFF_WINDOW", config.window_size)?;
    // 0 retransmits a slot forever
    let slot_retries: u32 = env_or(
        "SKIFF_MAX_SLOT_RETRIES",
        config.policy.max_slot_retries.unwrap_or(0),
    )?;
    config.policy.max_slot_retries = (slot_retries > 0).then_some(slot_retries);

    info!(
        "Sending {} as {:?} to {} destination(s), mss={} window={}",
        source.display(),
        config.destination_name,
        config.destinations.len(),
        config.mss,
        config.window_size
    );

    let report = run_fanout(config, Arc::new(TracingLogger))?;

    for r in &report.reports {
        match &r.outcome {
            Ok(summary) => info!(
                "{}: done, {} bytes in {} packets, {} retransmits, {:.2}s",
                r.destination,
                summary.bytes,
                summary.data_packets,
                summary.retransmits,
                summary.duration.as_secs_f64()
            ),
            Err(failure) => warn!("{}: {}", r.destination, failure),
        }
    }
    info!(
        "{}/{} destinations done in {:.2}s",
        report.done_count(),
        report.reports.len(),
        report.elapsed.as_secs_f64()
    );

    if !report.all_done() {
        std::process::exit(1);
    }
    Ok(())
}
