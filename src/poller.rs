// MIT License - Copyright (c) 2021 TJForc
// Adaptive poll loop for one hub

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use crate::client::DeviceClient;
use crate::config::{HubOptions, PollPolicy};
use crate::constants::WIRELESS_WARMUP_CYCLES;
use crate::devices::alarm::{AlarmKind, AlarmSource, AlarmTransition};
use crate::error::LinkboxError;
use crate::event::{EventSender, HubEvent};
use crate::state::{self, SystemState};
use crate::transport::Transport;

/// Counters the poll loop keeps for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollStats {
    /// Poll cycles attempted
    pub cycles: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Owns the poll schedule of one session and is the only writer of its
/// `SystemState`.
pub struct Poller<T: Transport> {
    client: Arc<DeviceClient<T>>,
    state: Arc<RwLock<SystemState>>,
    stats: Arc<RwLock<PollStats>>,
    options: watch::Receiver<HubOptions>,
    transitions: mpsc::UnboundedSender<AlarmTransition>,
    event_tx: EventSender,
    refresh: Arc<Notify>,
    failure_threshold: u32,
    last_wireless_read: Option<Instant>,
    last_interval: Option<Duration>,
}

impl<T: Transport> Poller<T> {
    pub fn new(
        client: Arc<DeviceClient<T>>,
        state: Arc<RwLock<SystemState>>,
        stats: Arc<RwLock<PollStats>>,
        options: watch::Receiver<HubOptions>,
        transitions: mpsc::UnboundedSender<AlarmTransition>,
        event_tx: EventSender,
        refresh: Arc<Notify>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            client,
            state,
            stats,
            options,
            transitions,
            event_tx,
            refresh,
            failure_threshold: failure_threshold.max(1),
            last_wireless_read: None,
            last_interval: None,
        }
    }

    /// Poll until `shutdown` flips to true. Shutdown cancels the pending
    /// timer; a poll already in progress runs to completion. A refresh
    /// request cuts the current wait short.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = self.poll_once().await;
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.refresh.notified() => {
                    debug!("Hub {}: polling early on request", self.client.device_id());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Poll loop for hub {} stopped", self.client.device_id());
    }

    /// Run one poll cycle and return the delay before the next one.
    pub async fn poll_once(&mut self) -> Duration {
        let policy = self.options.borrow().polling;
        let previous = self.state.read().await.clone();
        let cycle = {
            let mut stats = self.stats.write().await;
            stats.cycles += 1;
            stats.cycles
        };
        let include_wireless = self.wireless_due(&policy, previous.is_alarm_active(), cycle);

        match self.client.read_system_snapshot(include_wireless).await {
            Ok(raw) => {
                if include_wireless {
                    self.last_wireless_read = Some(Instant::now());
                }
                let recovering = previous.connection_lost;
                let (mut next, mut transitions) = if recovering {
                    state::fold_fresh(&previous, &raw)
                } else {
                    state::fold(&previous, &raw)
                };
                if recovering {
                    next.connection_lost = false;
                    transitions.push(AlarmTransition::falling(
                        AlarmKind::ConnectionLost,
                        AlarmSource::Hub,
                        self.client.device_id(),
                    ));
                }

                {
                    let mut stats = self.stats.write().await;
                    stats.consecutive_failures = 0;
                    stats.last_success = Some(Utc::now());
                    stats.last_error = None;
                }
                *self.state.write().await = next.clone();

                if recovering {
                    info!("Hub {} reachable again", self.client.device_id());
                    let _ = self.event_tx.send(HubEvent::ConnectionRestored {
                        device_id: self.client.device_id(),
                    });
                }
                self.emit(transitions);
                let _ = self.event_tx.send(HubEvent::StateUpdated {
                    device_id: self.client.device_id(),
                    state: next.clone(),
                });

                // interval is chosen from the state after this update
                let interval = policy.interval_for(next.is_alarm_active());
                if self.last_interval.is_some_and(|last| last != interval) {
                    info!(
                        "Hub {}: poll interval now {}s",
                        self.client.device_id(),
                        interval.as_secs()
                    );
                }
                self.last_interval = Some(interval);
                interval
            }
            Err(e) => {
                self.record_failure(e).await;
                policy.normal_interval()
            }
        }
    }

    fn wireless_due(&self, policy: &PollPolicy, alarm_active: bool, cycle: u64) -> bool {
        if !policy.poll_wireless {
            return false;
        }
        if cycle <= WIRELESS_WARMUP_CYCLES || alarm_active {
            return true;
        }
        match self.last_wireless_read {
            Some(at) => at.elapsed() >= policy.wireless_interval(),
            None => true,
        }
    }

    async fn record_failure(&mut self, error: LinkboxError) {
        let device_id = self.client.device_id();
        match &error {
            LinkboxError::SessionClosed => {
                debug!("Hub {}: session closed, skipping poll", device_id);
                return;
            }
            // the hub answered, so this is not a connectivity problem
            LinkboxError::Rejected(_) | LinkboxError::Decode { .. } => {
                warn!("Hub {}: poll failed: {}", device_id, error);
                self.stats.write().await.last_error = Some(error.to_string());
                return;
            }
            _ => {}
        }

        let failures = {
            let mut stats = self.stats.write().await;
            stats.consecutive_failures += 1;
            stats.last_error = Some(error.to_string());
            stats.consecutive_failures
        };
        debug!("Hub {}: poll failed ({} in a row): {}", device_id, failures, error);

        let newly_lost = {
            let mut state = self.state.write().await;
            if !state.connection_lost && failures >= self.failure_threshold {
                state.connection_lost = true;
                true
            } else {
                false
            }
        };
        if newly_lost {
            warn!("Hub {}: connection lost after {} failed polls", device_id, failures);
            let _ = self.event_tx.send(HubEvent::ConnectionLost { device_id, failures });
            self.emit(vec![AlarmTransition::rising(
                AlarmKind::ConnectionLost,
                AlarmSource::Hub,
                device_id,
            )]);
        }
    }

    fn emit(&self, transitions: Vec<AlarmTransition>) {
        for t in transitions {
            if t.is_rising() {
                warn!("Hub {}: {} raised by {}", t.device_id, t.kind, t.source);
            } else {
                info!("Hub {}: {} cleared on {}", t.device_id, t.kind, t.source);
            }
            let _ = self.event_tx.send(HubEvent::Alarm(t));
            if self.transitions.send(t).is_err() {
                debug!("Dispatcher gone, dropping {} transition", t.kind);
            }
        }
    }
}
