//! Example: Watch one hub and print alarms, notifications and state changes.

use waterguard_linkbox::{HubConfig, HubEvent, LinkboxHub, PollPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = HubConfig::builder()
        .host("192.168.1.40")
        .device_id(2229704)
        .name("Kitchen hub")
        .polling(PollPolicy::new(5, 1))
        .build();

    let mut hub = LinkboxHub::connect(config).await?;
    let mut events = hub.subscribe();

    println!("Listening for hub events (Ctrl+C to stop)...\n");

    let mut last = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(HubEvent::StateUpdated { state, .. }) => {
                        if last.as_ref() != Some(&state) {
                            println!(
                                "State: alarm={} valve1={} temp={:?} battery={:?}%",
                                state.is_alarm_active(),
                                state.valves[0],
                                state.wireless_temperature,
                                state.battery_percentage(),
                            );
                            last = Some(state);
                        }
                    }
                    Ok(HubEvent::Alarm(t)) => {
                        let mark = if t.is_rising() { "+" } else { "-" };
                        println!("{} {} on {}", mark, t.kind, t.source);
                    }
                    Ok(HubEvent::Notification(n)) => {
                        println!("  [{:?}/{:?}] {}: {}", n.channel, n.action, n.title, n.message);
                    }
                    Ok(HubEvent::ConnectionLost { failures, .. }) => {
                        println!("Hub unreachable ({} failed polls)", failures);
                    }
                    Ok(HubEvent::ConnectionRestored { .. }) => println!("Hub reachable again"),
                    Ok(_) => {}
                    Err(e) => {
                        println!("Event channel error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    let diag = hub.diagnostics().await;
    println!("{}", serde_json::to_string_pretty(&diag)?);
    hub.disconnect().await;
    Ok(())
}
