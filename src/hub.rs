// MIT License - Copyright (c) 2021 TJForc
// One monitored hub: session, poll task and notification dispatch

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::client::DeviceClient;
use crate::config::{HubConfig, HubOptions};
use crate::constants::{CONNECT_RETRIES, CONNECT_RETRY_DELAY_MS};
use crate::devices::alarm::{AlarmKind, AlarmTransition};
use crate::devices::valve::ValveCommand;
use crate::devices::wireless::WirelessReport;
use crate::error::{LinkboxError, Result};
use crate::event::{EventReceiver, EventSender, HubEvent, event_channel};
use crate::notify::{Dispatcher, Notification};
use crate::poller::{PollStats, Poller};
use crate::state::SystemState;
use crate::transport::{Transport, UdpTransport};

/// Snapshot of a session's health, for support and troubleshooting.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub name: String,
    pub address: String,
    pub device_id: u32,
    pub state: SystemState,
    pub options: HubOptions,
    #[serde(flatten)]
    pub poll: PollStats,
    pub supports_read_multiple: bool,
    /// Most recent refusal by the hub, if any
    pub last_rejection: Option<String>,
    /// Alarms notified and not yet cleared, as "kind:source"
    pub active_alarms: Vec<String>,
    /// Fresh per-point read of the wireless sensor node
    pub wireless: WirelessReport,
}

/// The public API for one Waterguard Linkbox hub.
///
/// Polling starts as soon as the session is created and runs until
/// [`disconnect`](Self::disconnect) or drop.
///
/// # Example
///
/// ```no_run
/// use waterguard_linkbox::{HubConfig, LinkboxHub, ValveCommand};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = HubConfig::builder()
///         .host("192.168.1.40")
///         .device_id(2229704)
///         .build();
///
///     let mut hub = LinkboxHub::connect(config).await?;
///
///     let mut events = hub.subscribe();
///     tokio::spawn(async move {
///         while let Ok(event) = events.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     hub.set_valve(1, ValveCommand::Close).await?;
///
///     tokio::signal::ctrl_c().await?;
///     hub.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct LinkboxHub<T: Transport = UdpTransport> {
    config: HubConfig,
    client: Arc<DeviceClient<T>>,
    event_tx: EventSender,
    state: Arc<RwLock<SystemState>>,
    stats: Arc<RwLock<PollStats>>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    options_tx: watch::Sender<HubOptions>,
    shutdown_tx: watch::Sender<bool>,
    /// Wakes the poll loop early after a successful command
    refresh: Arc<Notify>,
    poll_handle: Option<JoinHandle<()>>,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl LinkboxHub<UdpTransport> {
    /// Open a UDP session to the configured hub and start polling.
    ///
    /// Address resolution and socket errors are retried with exponential
    /// backoff. An unreachable hub is not an error here; it shows up as
    /// `connection_lost` once polls start failing.
    pub async fn connect(config: HubConfig) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..=CONNECT_RETRIES {
            if attempt > 0 {
                let delay_ms = CONNECT_RETRY_DELAY_MS * (1 << (attempt - 1).min(4));
                warn!(
                    "Session start attempt {} failed, retrying in {:.1}s...",
                    attempt,
                    delay_ms as f64 / 1000.0
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }

            match UdpTransport::connect(&config).await {
                Ok(transport) => return Ok(Self::with_transport(config, transport)),
                Err(e) => {
                    if !e.is_retryable() || attempt == CONNECT_RETRIES {
                        return Err(e);
                    }
                    warn!("Session start error (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(LinkboxError::SessionClosed))
    }
}

impl<T: Transport> LinkboxHub<T> {
    /// Start a session over an already-open transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(config: HubConfig, transport: T) -> Self {
        let device_id = config.device.id();
        let (event_tx, _event_rx) = event_channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (options_tx, options_rx) = watch::channel(config.options);
        let (transition_tx, transition_rx) = mpsc::unbounded_channel();

        let client = Arc::new(DeviceClient::new(Arc::new(transport), device_id));
        let state = Arc::new(RwLock::new(SystemState::default()));
        let stats = Arc::new(RwLock::new(PollStats::default()));
        let dispatcher = Arc::new(Mutex::new(Dispatcher::new(config.options.notifications)));

        let mut hub = Self {
            config,
            client,
            event_tx,
            state,
            stats,
            dispatcher,
            options_tx,
            shutdown_tx,
            refresh: Arc::new(Notify::new()),
            poll_handle: None,
            dispatch_handle: None,
        };

        hub.start_dispatcher(transition_rx);
        hub.start_poller(options_rx, transition_tx, shutdown_rx);

        info!("Session started for {}", hub.config.display_name());
        let _ = hub.event_tx.send(HubEvent::Connected { device_id });
        hub
    }

    fn start_poller(
        &mut self,
        options_rx: watch::Receiver<HubOptions>,
        transition_tx: mpsc::UnboundedSender<AlarmTransition>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let poller = Poller::new(
            self.client.clone(),
            self.state.clone(),
            self.stats.clone(),
            options_rx,
            transition_tx,
            self.event_tx.clone(),
            self.refresh.clone(),
            self.config.failure_threshold,
        );
        self.poll_handle = Some(tokio::spawn(poller.run(shutdown_rx)));
    }

    /// Transitions are consumed by this single task, in the order the
    /// poller produced them.
    fn start_dispatcher(&mut self, mut transition_rx: mpsc::UnboundedReceiver<AlarmTransition>) {
        let dispatcher = self.dispatcher.clone();
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(transition) = transition_rx.recv().await {
                let notifications = dispatcher.lock().await.dispatch(&transition);
                for n in notifications {
                    let _ = event_tx.send(HubEvent::Notification(n));
                }
            }
            debug!("Dispatcher stopped");
        });
        self.dispatch_handle = Some(handle);
    }

    /// Subscribe to hub events.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    pub fn device_id(&self) -> u32 {
        self.client.device_id()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get a snapshot of the current state.
    pub async fn state(&self) -> SystemState {
        self.state.read().await.clone()
    }

    pub fn options(&self) -> HubOptions {
        *self.options_tx.borrow()
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        self.client.transport()
    }

    // --- Commands ---

    /// Drive a valve. The write waits behind any request already on the
    /// wire; on failure the cached valve status is left as it was. A
    /// successful write schedules an immediate poll.
    pub async fn set_valve(&self, index: u8, command: ValveCommand) -> Result<()> {
        self.client.write_valve_command(index, command).await?;
        self.request_refresh();
        Ok(())
    }

    /// Clear a latched water alarm on the hub, then poll right away.
    pub async fn reset_alarm(&self) -> Result<()> {
        self.client.reset_alarm().await?;
        self.request_refresh();
        Ok(())
    }

    /// Poll now instead of waiting out the current interval. Requests made
    /// while a poll is running are folded into one extra poll.
    pub fn request_refresh(&self) {
        debug!("Hub {}: refresh requested", self.device_id());
        self.refresh.notify_one();
    }

    /// Send a synthetic alarm of `kind` straight to the notification sinks.
    pub async fn test_notification(&self, kind: AlarmKind) -> Vec<Notification> {
        let notifications = self
            .dispatcher
            .lock()
            .await
            .test_notification(kind, self.device_id());
        for n in &notifications {
            let _ = self.event_tx.send(HubEvent::Notification(n.clone()));
        }
        notifications
    }

    /// Apply new polling and notification options without restarting.
    pub async fn update_options(&self, mut options: HubOptions) {
        options.polling = options.polling.clamped();
        self.dispatcher.lock().await.set_options(options.notifications);
        let previous = self.options_tx.send_replace(options);
        if previous.polling != options.polling {
            info!(
                "Hub {}: polling every {}s ({}s during alarms)",
                self.device_id(),
                options.polling.scan_interval_secs,
                options.polling.fast_poll_interval_secs
            );
        }
    }

    /// Health report. Reads every wireless point once, so this queues
    /// behind any request already on the wire.
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut active_alarms: Vec<String> = self
            .dispatcher
            .lock()
            .await
            .active()
            .map(|(_, kind, source)| format!("{kind}:{source}"))
            .collect();
        active_alarms.sort();

        Diagnostics {
            name: self.config.display_name(),
            address: self.config.address.to_string(),
            device_id: self.device_id(),
            state: self.state().await,
            options: self.options(),
            poll: self.stats.read().await.clone(),
            supports_read_multiple: self.client.supports_read_multiple(),
            last_rejection: self.client.last_rejection().await.map(|r| r.description()),
            active_alarms,
            wireless: self.client.check_wireless().await,
        }
    }

    /// Stop polling and release the transport.
    ///
    /// A request already on the wire is allowed to finish or time out
    /// first; commands issued afterwards fail with `SessionClosed`.
    pub async fn disconnect(&mut self) {
        info!("Disconnecting from {}", self.config.display_name());
        let _ = self.shutdown_tx.send(true);

        self.client.transport().close().await;

        if let Some(h) = self.poll_handle.take() {
            let _ = h.await;
        }
        if let Some(h) = self.dispatch_handle.take() {
            let _ = h.await;
        }

        let _ = self.event_tx.send(HubEvent::Disconnected {
            device_id: self.device_id(),
        });
    }
}

impl<T: Transport> Drop for LinkboxHub<T> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(h) = self.poll_handle.take() {
            h.abort();
        }
        if let Some(h) = self.dispatch_handle.take() {
            h.abort();
        }
    }
}
