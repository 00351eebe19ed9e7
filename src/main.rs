// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, error, info, warn};

use waterguard_linkbox::constants::{DEFAULT_DISCOVERY_WINDOW, DEFAULT_PORT, MAX_VALVES};
use waterguard_linkbox::{
    AlarmKind, AlarmTransition, HubAddress, HubConfig, HubEvent, HubOptions, HubRegistry,
    LinkboxHub, Notification, NotificationOptions, PollPolicy, SystemState, ValveCommand, setup,
};

/// Commands waiting for the worker; further commands are dropped.
const COMMAND_QUEUE_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "waterguard2mqtt")]
#[command(about = "Bridge between Waterguard Linkbox hubs and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Look for hubs at an address and print their device ids
    Discover {
        /// Hub IP, host name or broadcast address
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// How long to listen for replies
        #[arg(long, default_value_t = DEFAULT_DISCOVERY_WINDOW.as_secs())]
        window_secs: u64,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct Config {
    #[serde(rename = "hub")]
    hubs: Vec<HubToml>,
    mqtt: MqttToml,
    #[serde(default)]
    polling: PollPolicy,
    #[serde(default)]
    notifications: NotificationOptions,
}

impl Config {
    fn options(&self) -> HubOptions {
        HubOptions {
            polling: self.polling,
            notifications: self.notifications,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct HubToml {
    host: String,
    #[serde(default = "default_hub_port")]
    port: u16,
    /// Discovered at startup when omitted
    #[serde(default)]
    device_id: Option<u32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_request_timeout")]
    request_timeout_ms: u64,
    #[serde(default = "default_request_retries")]
    request_retries: u32,
    #[serde(default = "default_failure_threshold")]
    failure_threshold: u32,
    /// 0 binds an ephemeral port
    #[serde(default)]
    local_port: u16,
}

fn default_hub_port() -> u16 {
    DEFAULT_PORT
}
fn default_request_timeout() -> u64 {
    5000
}
fn default_request_retries() -> u32 {
    2
}
fn default_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
    #[serde(default = "default_snapshot_interval")]
    snapshot_interval_secs: u64,
}

fn default_client_id() -> String {
    "waterguard-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "waterguard/cmd".to_string()
}
fn default_publish_topic() -> String {
    "waterguard".to_string()
}
fn default_snapshot_interval() -> u64 {
    60
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;
    if config.hubs.is_empty() {
        anyhow::bail!("Config must contain at least one [[hub]] entry");
    }
    Ok(config)
}

/// Build the library config for one hub, discovering its device id if the
/// entry has none.
async fn build_hub_config(toml: &HubToml, options: HubOptions) -> Result<HubConfig> {
    let address = HubAddress::new(&toml.host, toml.port);
    let device_id = match toml.device_id {
        Some(id) => id,
        None => {
            info!("No device_id configured for {address}; discovering");
            let identity = setup::resolve_device_id(&address, DEFAULT_DISCOVERY_WINDOW)
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Could not determine device id for {address} ({}): {e}. Set device_id for this hub.",
                        e.code()
                    )
                })?;
            info!("Using device id {identity} for {address}");
            identity.id()
        }
    };

    let mut builder = HubConfig::builder()
        .address(address)
        .device_id(device_id)
        .request_timeout_ms(toml.request_timeout_ms)
        .request_retries(toml.request_retries)
        .failure_threshold(toml.failure_threshold)
        .local_port(toml.local_port)
        .polling(options.polling)
        .notifications(options.notifications);
    if let Some(name) = &toml.name {
        builder = builder.name(name);
    }
    Ok(builder.build())
}

async fn build_registry(config: &Config) -> Result<HubRegistry> {
    let mut hubs = Vec::with_capacity(config.hubs.len());
    for entry in &config.hubs {
        let hub_config = build_hub_config(entry, config.options()).await?;
        info!("Starting session for {}", hub_config.display_name());
        hubs.push(LinkboxHub::connect(hub_config).await?);
    }
    Ok(HubRegistry::new(hubs))
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages: all share a flat {now, op, ...} structure

#[derive(Serialize)]
struct MqttSnapshot {
    now: u64,
    op: String,
    hubs: Vec<MqttHubState>,
}

#[derive(Serialize)]
struct MqttHubState {
    device_id: u32,
    name: String,
    connected: bool,
    alarm_active: bool,
    water_alarm: Option<bool>,
    sensor_tape_leak: Option<bool>,
    valve_count: Option<u32>,
    valve_system_disconnected: bool,
    valves: Vec<MqttValveState>,
    valve_control: Option<String>,
    wireless: MqttWirelessState,
}

#[derive(Serialize)]
struct MqttValveState {
    index: u8,
    status: String,
}

#[derive(Serialize)]
struct MqttWirelessState {
    leak_1: Option<bool>,
    leak_2: Option<bool>,
    temperature: Option<f32>,
    humidity: Option<f32>,
    battery_voltage: Option<f32>,
    battery_percentage: Option<u8>,
}

// Alarm edges: {now, op, device_id, kind, source}
#[derive(Serialize)]
struct MqttAlarmEvent {
    now: u64,
    op: String,
    device_id: u32,
    kind: AlarmKind,
    source: String,
}

// Hub connectivity: {now, op, device_id}
#[derive(Serialize)]
struct MqttHubEvent {
    now: u64,
    op: String,
    device_id: u32,
}

#[derive(Serialize)]
struct MqttNotification {
    now: u64,
    op: String,
    device_id: u32,
    kind: AlarmKind,
    source: String,
    channel: String,
    action: String,
    notification_id: String,
    title: String,
    message: String,
    priority: String,
    icon: String,
    test: bool,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    #[allow(dead_code)]
    op_id: Option<String>,
    #[serde(default)]
    device_id: Option<u32>,
    #[serde(default)]
    valve: Option<u8>,
    #[serde(default)]
    alarm_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn to_label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    success: bool,
    src: Option<serde_json::Value>,
    data: Option<serde_json::Value>,
    error: Option<String>,
) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
        error,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_hub_event(client: &AsyncClient, topic: &str, op: &str, device_id: u32) {
    let msg = MqttHubEvent {
        now: now_epoch_ms(),
        op: op.to_string(),
        device_id,
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_alarm(client: &AsyncClient, topic: &str, t: &AlarmTransition) {
    let op = if t.is_rising() { "ALARM_RAISED" } else { "ALARM_CLEARED" };
    let msg = MqttAlarmEvent {
        now: now_epoch_ms(),
        op: op.to_string(),
        device_id: t.device_id,
        kind: t.kind,
        source: t.source.label(),
    };
    publish_json(client, topic, &msg, false).await;
}

async fn publish_notification(client: &AsyncClient, topic: &str, n: &Notification) {
    let msg = MqttNotification {
        now: now_epoch_ms(),
        op: "NOTIFICATION".to_string(),
        device_id: n.device_id,
        kind: n.kind,
        source: n.source.label(),
        channel: to_label(&n.channel),
        action: to_label(&n.action),
        notification_id: n.notification_id.clone(),
        title: n.title.clone(),
        message: n.message.clone(),
        priority: to_label(&n.priority),
        icon: n.icon.to_string(),
        test: n.is_test,
    };
    publish_json(client, topic, &msg, false).await;
}

fn hub_state(device_id: u32, name: String, state: &SystemState) -> MqttHubState {
    // a hub that has not reported its valve count still shows valve 1
    let fitted = state.valve_count.unwrap_or(1).clamp(1, MAX_VALVES as u32) as u8;
    MqttHubState {
        device_id,
        name,
        connected: state.hub_connected(),
        alarm_active: state.is_alarm_active(),
        water_alarm: state.system_alarm,
        sensor_tape_leak: state.sensor_tape_leak,
        valve_count: state.valve_count,
        valve_system_disconnected: state.valve_system_disconnected,
        valves: (1..=fitted)
            .filter_map(|i| {
                state.valve(i).map(|s| MqttValveState {
                    index: i,
                    status: s.to_string(),
                })
            })
            .collect(),
        valve_control: state.valve_control.as_ref().map(to_label),
        wireless: MqttWirelessState {
            leak_1: state.wireless_leak[0],
            leak_2: state.wireless_leak[1],
            temperature: state.wireless_temperature,
            humidity: state.wireless_humidity,
            battery_voltage: state.wireless_battery_voltage,
            battery_percentage: state.battery_percentage(),
        },
    }
}

async fn build_snapshot(registry: &HubRegistry) -> MqttSnapshot {
    let mut hubs = Vec::with_capacity(registry.len());
    for hub in registry.hubs() {
        let state = hub.state().await;
        hubs.push(hub_state(hub.device_id(), hub.config().display_name(), &state));
    }
    MqttSnapshot {
        now: now_epoch_ms(),
        op: "SNAPSHOT".to_string(),
        hubs,
    }
}

async fn publish_snapshot(client: &AsyncClient, topic: &str, registry: &HubRegistry) {
    let snapshot = build_snapshot(registry).await;
    publish_json(client, topic, &snapshot, true).await;
}

// ---------------------------------------------------------------------------
// Hub event → MQTT
// ---------------------------------------------------------------------------

/// Forward one hub's events. A snapshot is republished only when a poll
/// actually changed the state.
fn spawn_event_forwarder(
    registry: Arc<HubRegistry>,
    device_id: u32,
    client: AsyncClient,
    topic: String,
) -> Option<JoinHandle<()>> {
    let mut rx = registry.hub(Some(device_id)).ok()?.subscribe();
    Some(tokio::spawn(async move {
        let mut last_state: Option<SystemState> = None;
        loop {
            match rx.recv().await {
                Ok(HubEvent::StateUpdated { state, .. }) => {
                    if last_state.as_ref() != Some(&state) {
                        last_state = Some(state);
                        publish_snapshot(&client, &topic, &registry).await;
                    }
                }
                Ok(HubEvent::Alarm(t)) => publish_alarm(&client, &topic, &t).await,
                Ok(HubEvent::Notification(n)) => publish_notification(&client, &topic, &n).await,
                Ok(HubEvent::ConnectionLost { device_id, failures }) => {
                    warn!("Hub {device_id} unreachable after {failures} polls");
                    publish_hub_event(&client, &topic, "HUB_CONNECTION_LOST", device_id).await;
                    publish_snapshot(&client, &topic, &registry).await;
                }
                Ok(HubEvent::ConnectionRestored { device_id }) => {
                    publish_hub_event(&client, &topic, "HUB_CONNECTION_RESTORED", device_id).await;
                }
                Ok(HubEvent::Connected { device_id }) | Ok(HubEvent::Disconnected { device_id }) => {
                    debug!("Hub {device_id} session event");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged, missed {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("Event channel for hub {device_id} closed");
                    break;
                }
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

/// Run a hub command and log the outcome. Returns the error text on failure.
async fn exec_hub_cmd<E: std::fmt::Display>(
    op: &str,
    fut: impl std::future::Future<Output = std::result::Result<(), E>>,
) -> Option<String> {
    match fut.await {
        Ok(()) => {
            info!("{op}: success");
            None
        }
        Err(e) => {
            error!("{op} failed: {e}");
            Some(e.to_string())
        }
    }
}

/// Raw payload (echoed back in CMD_ACK) and the parsed command.
type QueuedCommand = (String, MqttCommand);

/// Parse an inbound command and hand it to the command worker without
/// waiting. Returns whether it was queued.
fn queue_command(payload: &[u8], queue: &mpsc::Sender<QueuedCommand>) -> bool {
    let payload = String::from_utf8_lossy(payload);
    let cmd = match serde_json::from_str::<MqttCommand>(&payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("Failed to parse MQTT command: {e}");
            return false;
        }
    };
    if cmd.op == "SNAPSHOT" {
        debug!("MQTT command received: {payload}");
    } else {
        info!("MQTT command received: {payload}");
    }
    match queue.try_send((payload.into_owned(), cmd)) {
        Ok(()) => true,
        Err(e) => {
            warn!("Dropping MQTT command, queue unavailable: {e}");
            false
        }
    }
}

async fn handle_command(
    payload_str: &str,
    cmd: MqttCommand,
    client: &AsyncClient,
    topic: &str,
    registry: &HubRegistry,
) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    match cmd.op.as_str() {
        "SNAPSHOT" => {
            debug!("Command: SNAPSHOT");
            let snapshot = build_snapshot(registry).await;
            let snapshot_value = serde_json::to_value(&snapshot).ok();
            publish_json(client, topic, &snapshot, true).await;
            publish_cmd_ack(client, topic, true, src_json, snapshot_value, None).await;
        }

        "PING" => {
            info!("Command: PING");
            publish_cmd_ack(client, topic, true, src_json, None, None).await;
        }

        "VALVE_OPEN" | "VALVE_CLOSE" => {
            let op = cmd.op.as_str();
            let command = if op == "VALVE_OPEN" {
                ValveCommand::Open
            } else {
                ValveCommand::Close
            };
            let valve = cmd.valve.unwrap_or(1);
            info!("Command: {op} valve {valve}");
            let failure = exec_hub_cmd(op, registry.set_valve(cmd.device_id, valve, command)).await;
            publish_cmd_ack(client, topic, failure.is_none(), src_json, None, failure).await;
        }

        "RESET_ALARM" => {
            info!("Command: RESET_ALARM");
            let failure = exec_hub_cmd("RESET_ALARM", registry.reset_alarm(cmd.device_id)).await;
            publish_cmd_ack(client, topic, failure.is_none(), src_json, None, failure).await;
        }

        "TEST_NOTIFICATION" => {
            let kind = match cmd.alarm_type.as_deref().map(str::parse::<AlarmKind>) {
                Some(Ok(kind)) => kind,
                Some(Err(e)) => {
                    warn!("TEST_NOTIFICATION: {e}");
                    publish_cmd_ack(client, topic, false, src_json, None, Some(e)).await;
                    return;
                }
                None => {
                    warn!("TEST_NOTIFICATION: missing alarm_type");
                    let error = Some("missing alarm_type".to_string());
                    publish_cmd_ack(client, topic, false, src_json, None, error).await;
                    return;
                }
            };
            info!("Command: TEST_NOTIFICATION {kind}");
            // notifications reach MQTT through the hub's event stream
            match registry.test_notification(kind, cmd.device_id).await {
                Ok(sent) => {
                    let data = Some(serde_json::json!({ "sent": sent.len() }));
                    publish_cmd_ack(client, topic, true, src_json, data, None).await;
                }
                Err(e) => {
                    error!("TEST_NOTIFICATION failed: {e}");
                    publish_cmd_ack(client, topic, false, src_json, None, Some(e.to_string())).await;
                }
            }
        }

        "DIAGNOSTICS" => {
            info!("Command: DIAGNOSTICS");
            match registry.diagnostics(cmd.device_id).await {
                Ok(diag) => {
                    let data = serde_json::to_value(&diag).ok();
                    publish_cmd_ack(client, topic, true, src_json, data, None).await;
                }
                Err(e) => {
                    publish_cmd_ack(client, topic, false, src_json, None, Some(e.to_string())).await;
                }
            }
        }

        other => {
            warn!("Unknown command: {other}");
            publish_cmd_ack(client, topic, false, src_json, None, None).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Discover subcommand
// ---------------------------------------------------------------------------

async fn run_discover(host: String, port: u16, window_secs: u64) -> Result<()> {
    let address = HubAddress::new(host, port);
    let window = Duration::from_secs(window_secs.max(1));
    println!("Discovering Waterguard hubs at {address} ({}s)...", window.as_secs());

    let ids = match setup::discover(&address, window).await {
        Ok(ids) => ids,
        Err(e) => anyhow::bail!("Discovery failed ({}): {e}", e.code()),
    };
    if ids.is_empty() {
        println!("No hubs answered. Enter the device id manually in config.toml.");
        return Ok(());
    }

    for id in ids {
        match setup::validate(&address, id).await {
            Ok(info) => println!(
                "Device ID: {id}  name: {}  firmware: {}",
                info.device.name.as_deref().unwrap_or("-"),
                info.device.firmware_revision.as_deref().unwrap_or("-")
            ),
            Err(e) => println!("Device ID: {id}  (validation failed: {})", e.code()),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=waterguard_linkbox=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    if let Some(Command::Discover { host, port, window_secs }) = cli.command {
        return run_discover(host, port, window_secs).await;
    }

    let mut config = load_config(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
        let publish_topic = config.mqtt.publish_topic.clone();
        let subscribe_topic = config.mqtt.subscribe_topic.clone();

        let registry = Arc::new(build_registry(&config).await?);
        info!("{} hub session(s) running", registry.len());

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {subscribe_topic}");

        publish_snapshot(&client, &publish_topic, &registry).await;

        let mut handles: Vec<JoinHandle<()>> = registry
            .hubs()
            .iter()
            .filter_map(|hub| {
                spawn_event_forwarder(
                    Arc::clone(&registry),
                    hub.device_id(),
                    client.clone(),
                    publish_topic.clone(),
                )
            })
            .collect();

        // Commands run on their own task so a slow hub never stalls the
        // MQTT event loop (and with it the keepalive)
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<QueuedCommand>(COMMAND_QUEUE_DEPTH);
        let registry_cmds = Arc::clone(&registry);
        let client_cmds = client.clone();
        let topic_cmds = publish_topic.clone();
        handles.push(tokio::spawn(async move {
            while let Some((payload, cmd)) = cmd_rx.recv().await {
                handle_command(&payload, cmd, &client_cmds, &topic_cmds, &registry_cmds).await;
            }
        }));

        // MQTT event loop (receives messages, queues commands)
        let client_sub = client.clone();
        let sub_topic = subscribe_topic.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_sub.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            queue_command(&msg.payload, &cmd_tx);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }));

        // Periodic retained snapshot
        let registry_snap = Arc::clone(&registry);
        let client_snap = client.clone();
        let topic_snap = publish_topic.clone();
        let snapshot_interval_secs = config.mqtt.snapshot_interval_secs.max(1);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(snapshot_interval_secs));
            // Skip the first immediate tick (an initial snapshot was already published)
            ticker.tick().await;
            loop {
                ticker.tick().await;
                publish_snapshot(&client_snap, &topic_snap, &registry_snap).await;
            }
        }));

        info!("MQTT bridge running. Send SIGHUP to reload, SIGINT/SIGTERM to stop.");
        let restart = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down...");
                    break false;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break false;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading config from {}", cli.config);
                    let new_config = match load_config(&cli.config) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("Failed to reload config, keeping previous: {e:#}");
                            continue;
                        }
                    };
                    if let Err(e) = parse_mqtt_url(&new_config.mqtt.url) {
                        warn!("Invalid MQTT URL in new config, keeping previous: {e}");
                        continue;
                    }
                    let restart = new_config.hubs != config.hubs || new_config.mqtt != config.mqtt;
                    if !restart {
                        let options = new_config.options();
                        for hub in registry.hubs() {
                            hub.update_options(options).await;
                        }
                        info!("Options applied without restart");
                    }
                    config = new_config;
                    if restart {
                        info!("Hub or MQTT settings changed, restarting sessions");
                        break true;
                    }
                }
            }
        };

        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }

        match Arc::try_unwrap(registry) {
            Ok(mut registry) => registry.shutdown().await,
            Err(_arc) => {
                warn!("Could not unwrap hub registry for clean shutdown (tasks still hold references)");
            }
        }

        if !restart {
            break;
        }
        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}
