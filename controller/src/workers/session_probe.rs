//! Session probe worker
//!
//! Pings every host that has an established session so broken sessions are
//! discarded before the next request needs them.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::docker::HostConnectionManager;

/// Session probe worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Probe interval
    pub interval: Duration,

    /// Initial delay before first probe
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Outcome of one probe round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub healthy: usize,
    pub dropped: usize,
    pub idle: usize,
}

/// Probe every registered host once
pub async fn probe_all(manager: &HostConnectionManager) -> ProbeRound {
    let mut round = ProbeRound::default();
    for host_id in manager.registered_hosts() {
        match manager.probe(host_id).await {
            Some(true) => round.healthy += 1,
            Some(false) => {
                warn!("Session to host {} failed its probe and was dropped", host_id);
                round.dropped += 1;
            }
            None => round.idle += 1,
        }
    }
    round
}

/// Run the session probe worker
pub async fn run<S, F>(
    options: &Options,
    manager: &HostConnectionManager,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Session probe worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Session probe worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        let round = probe_all(manager).await;
        debug!(
            "Probe round: {} healthy, {} dropped, {} idle",
            round.healthy, round.dropped, round.idle
        );

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Session probe worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
