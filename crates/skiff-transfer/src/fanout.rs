//! Fan-out: the same file to many receivers at once.
//!
//! One named thread per destination, each running an independent sender
//! session with its own socket, file handle and window. Workers report on a
//! completion channel as they finish; one failing destination never stops
//! the others.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use crate::config::FanoutConfig;
use crate::error::{ConfigError, FailureReason, Phase, SessionFailure};
use crate::logging::TransferLogger;
use crate::sender::{SessionReport, run_sender};

/// Results of a fan-out run, in the order the destinations were given.
#[derive(Debug)]
pub struct FanoutReport {
    pub reports: Vec<SessionReport>,
    pub elapsed: Duration,
}

impl FanoutReport {
    pub fn all_done(&self) -> bool {
        self.reports.iter().all(SessionReport::is_done)
    }

    pub fn done_count(&self) -> usize {
        self.reports.iter().filter(|r| r.is_done()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SessionFailure> {
        self.reports.iter().filter_map(SessionReport::failure)
    }
}

/// Send `config.source_path` to every destination and block until each
/// session is done or failed.
pub fn run_fanout(
    config: FanoutConfig,
    logger: Arc<dyn TransferLogger>,
) -> Result<FanoutReport, ConfigError> {
    config.validate()?;
    let started = Instant::now();
    let count = config.destinations.len();
    let (done_tx, done_rx) = unbounded::<(usize, SessionReport)>();

    let mut slots: Vec<Option<SessionReport>> = (0..count).map(|_| None).collect();
    let mut handles: Vec<(usize, SocketAddr, JoinHandle<()>)> = Vec::with_capacity(count);

    for (idx, &destination) in config.destinations.iter().enumerate() {
        let sender_config = config.sender_config(destination);
        let logger = logger.clone();
        let done_tx = done_tx.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("skiff-send-{}", idx))
            .spawn(move || {
                let report = run_sender(sender_config, logger);
                // orchestrator gone means nobody is waiting for the result
                let _ = done_tx.send((idx, report));
            });

        match spawned {
            Ok(handle) => handles.push((idx, destination, handle)),
            Err(e) => {
                tracing::warn!(%destination, "cannot spawn sender thread: {}", e);
                slots[idx] = Some(failed(destination, Phase::Setup, e.into()));
            }
        }
    }
    drop(done_tx);

    for (idx, report) in done_rx.iter() {
        match &report.outcome {
            Ok(summary) => tracing::info!(
                destination = %report.destination,
                bytes = summary.bytes,
                retransmits = summary.retransmits,
                "transfer done ({}/{})",
                idx + 1,
                count
            ),
            Err(failure) => tracing::warn!(
                destination = %report.destination,
                "{}",
                failure
            ),
        }
        slots[idx] = Some(report);
    }

    for (idx, destination, handle) in handles {
        if handle.join().is_err() {
            tracing::warn!(%destination, "sender thread panicked");
        }
        if slots[idx].is_none() {
            slots[idx] = Some(failed(destination, Phase::Setup, FailureReason::Panicked));
        }
    }

    let reports = slots
        .into_iter()
        .zip(&config.destinations)
        .map(|(slot, &dest)| {
            slot.unwrap_or_else(|| failed(dest, Phase::Setup, FailureReason::Panicked))
        })
        .collect();

    Ok(FanoutReport {
        reports,
        elapsed: started.elapsed(),
    })
}

fn failed(destination: SocketAddr, phase: Phase, reason: FailureReason) -> SessionReport {
    SessionReport {
        destination,
        outcome: Err(SessionFailure::new(destination, phase, reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogger;

    #[test]
    fn empty_destination_list_is_rejected() {
        let config = FanoutConfig::new(Vec::new(), "in.bin", "out.bin");
        assert!(matches!(
            run_fanout(config, Arc::new(NullLogger)),
            Err(ConfigError::NoDestinations)
        ));
    }

    #[test]
    fn every_destination_gets_a_report_in_order() {
        // missing source: each session fails during setup without touching the network
        let dests: Vec<SocketAddr> = vec![
            "127.0.0.1:9".parse().unwrap(),
            "127.0.0.1:10".parse().unwrap(),
            "127.0.0.1:11".parse().unwrap(),
        ];
        let missing = std::env::temp_dir().join("skiff_fanout_missing_source.bin");
        let config = FanoutConfig::new(dests.clone(), missing, "out.bin");

        let report = run_fanout(config, Arc::new(NullLogger)).unwrap();
        assert!(!report.all_done());
        assert_eq!(report.done_count(), 0);
        let order: Vec<SocketAddr> = report.reports.iter().map(|r| r.destination).collect();
        assert_eq!(order, dests);
        assert!(report.failures().all(|f| f.phase == Phase::Setup));
    }
}
