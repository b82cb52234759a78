use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use skiff_transfer::{Receiver, ReceiverConfig, TracingLogger};
use tracing::info;

/// Parse a raw variable value. Unset or blank is `None`; anything else must
/// parse.
fn parse_var<T: std::str::FromStr>(key: &str, raw: Option<String>) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} = {:?}: {}", key, v, e)),
        _ => Ok(None),
    }
}

fn env_opt<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    parse_var(key, std::env::var(key).ok())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

/// Seconds from the environment; 0 disables the timer.
fn env_secs(key: &str, default: Option<Duration>) -> anyhow::Result<Option<Duration>> {
    let secs: u64 = env_or(key, default.map_or(0, |d| d.as_secs()))?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff_server=debug,skiff_transfer=info".into()),
        )
        .init();

    // Config
    let defaults = ReceiverConfig::default();
    let bind_addr: SocketAddr = env_or("SKIFF_BIND", "0.0.0.0:5000".parse()?)?;
    let root_dir: PathBuf = env_or("SKIFF_ROOT", defaults.root_dir.clone())?;
    let config = ReceiverConfig {
        bind_addr,
        root_dir,
        data_drop_percent: env_or("SKIFF_DROP_PERCENT", 0u8)?,
        ack_drop_percent: env_or("SKIFF_ACK_DROP_PERCENT", 0u8)?,
        loss_seed: env_opt("SKIFF_LOSS_SEED")?,
        max_sessions: env_or("SKIFF_MAX_SESSIONS", defaults.max_sessions)?,
        idle_timeout: env_secs("SKIFF_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
        exit_when_idle: env_secs("SKIFF_EXIT_WHEN_IDLE_SECS", None)?,
        ..defaults
    };

    std::fs::create_dir_all(&config.root_dir)?;
    info!(
        "Receiving into {} (max {} sessions, data drop {}%, ack drop {}%)",
        config.root_dir.display(),
        config.max_sessions,
        config.data_drop_percent,
        config.ack_drop_percent
    );

    let mut receiver = Receiver::bind(config, Arc::new(TracingLogger))?;
    info!("Skiff receiver listening on {}", receiver.local_addr());

    // Runs until killed, or until idle if SKIFF_EXIT_WHEN_IDLE_SECS is set
    let shutdown = AtomicBool::new(false);
    receiver.run(&shutdown)?;

    let stats = receiver.stats();
    info!(
        "Receiver stopped: {} files, {} bytes, {} acks sent, {} framing errors",
        stats.files_completed.load(Ordering::Relaxed),
        stats.bytes_written.load(Ordering::Relaxed),
        stats.acks_sent.load(Ordering::Relaxed),
        stats.framing_errors.load(Ordering::Relaxed)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_values_are_reported() {
        let seed: anyhow::Result<Option<u64>> = parse_var("SKIFF_LOSS_SEED", Some("12x".into()));
        let err = seed.unwrap_err().to_string();
        assert!(err.starts_with("SKIFF_LOSS_SEED = \"12x\""), "{}", err);

        assert!(parse_var::<u8>("SKIFF_DROP_PERCENT", Some("300".into())).is_err());
    }

    #[test]
    fn blank_or_unset_means_default() {
        assert_eq!(parse_var::<u64>("SKIFF_LOSS_SEED", Some(" 42 ".into())).unwrap(), Some(42));
        assert_eq!(parse_var::<u64>("SKIFF_LOSS_SEED", Some("  ".into())).unwrap(), None);
        assert_eq!(parse_var::<u64>("SKIFF_LOSS_SEED", None).unwrap(), None);
    }
}
