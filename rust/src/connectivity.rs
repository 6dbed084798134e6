use std::time::Duration;

use async_trait::async_trait;

use crate::backends::ReachabilityProbe;
use crate::state::{ConnectivityState, NetworkSignal};

pub const DEFAULT_PROBE_URL: &str = "https://clients3.google.com/generate_204";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Offline,
    Online,
    NeedsProbe,
}

/// Maps a raw transport signal to an effective state, leaning offline when unsure.
pub fn assess(signal: NetworkSignal) -> Assessment {
    if !signal.is_connected {
        return Assessment::Offline;
    }
    match signal.is_internet_reachable {
        Some(true) => Assessment::Online,
        Some(false) => Assessment::Offline,
        None => Assessment::NeedsProbe,
    }
}

/// A published change of the effective connected flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub connected: bool,
    /// Set when the transition is into "connected": the epoch the settle timer must report back.
    pub settle_epoch: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Resolved(Option<Transition>),
    /// Caller must run the probe and report through `on_probe_result` with this generation.
    StartProbe(u64),
    /// A probe is already running; the next poll will look again.
    ProbeBusy,
}

#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    state: ConnectivityState,
    probe_in_flight: bool,
    probe_generation: u64,
    epoch: u64,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected
    }

    pub fn on_signal(&mut self, signal: NetworkSignal) -> SignalOutcome {
        match assess(signal) {
            Assessment::NeedsProbe => {
                if self.probe_in_flight {
                    return SignalOutcome::ProbeBusy;
                }
                self.probe_in_flight = true;
                self.probe_generation = self.probe_generation.wrapping_add(1);
                SignalOutcome::StartProbe(self.probe_generation)
            }
            definitive => {
                // A definitive signal supersedes whatever the running probe will say.
                self.probe_in_flight = false;
                self.probe_generation = self.probe_generation.wrapping_add(1);
                SignalOutcome::Resolved(self.apply(definitive == Assessment::Online))
            }
        }
    }

    pub fn on_probe_result(&mut self, generation: u64, reachable: bool) -> Option<Transition> {
        if !self.probe_in_flight || generation != self.probe_generation {
            return None;
        }
        self.probe_in_flight = false;
        self.apply(reachable)
    }

    /// Whether a settle timer armed at `epoch` should still flush the offline queue.
    pub fn settle_elapsed(&self, epoch: u64) -> bool {
        self.state.is_connected && epoch == self.epoch
    }

    fn apply(&mut self, connected: bool) -> Option<Transition> {
        let first = !self.state.is_initialized;
        self.state.is_initialized = true;
        if !first && connected == self.state.is_connected {
            return None;
        }
        self.state.is_connected = connected;
        self.epoch = self.epoch.wrapping_add(1);
        Some(Transition {
            connected,
            settle_epoch: connected.then_some(self.epoch),
        })
    }
}

/// Short-timeout HTTP reachability check against a highly available endpoint.
#[derive(Debug, Clone)]
pub struct HttpReachabilityProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpReachabilityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpReachabilityProbe {
    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.client.get(&self.url).send()).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(e)) => {
                tracing::debug!(%e, url = %self.url, "reachability probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(url = %self.url, "reachability probe timed out");
                false
            }
        }
    }
}
