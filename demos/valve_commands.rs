//! Example: Close and reopen the main valve, then reset the alarm latch.

use waterguard_linkbox::{HubConfig, LinkboxHub, ValveCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = HubConfig::builder()
        .host("192.168.1.40")
        .device_id(2229704)
        .build();

    let mut hub = LinkboxHub::connect(config).await?;

    // Give the first poll time to land
    tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
    let state = hub.state().await;
    println!("Valve 1 is {} ({:?} valve(s) fitted)", state.valves[0], state.valve_count);

    println!("\nClosing valve 1...");
    match hub.set_valve(1, ValveCommand::Close).await {
        Ok(()) => println!("Close command accepted"),
        Err(e) => println!("Error closing valve: {}", e),
    }

    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
    println!("Valve 1 is now {}", hub.state().await.valves[0]);

    println!("\nOpening valve 1...");
    match hub.set_valve(1, ValveCommand::Open).await {
        Ok(()) => println!("Open command accepted"),
        Err(e) => println!("Error opening valve: {}", e),
    }

    println!("\nResetting alarm latch...");
    if let Err(e) = hub.reset_alarm().await {
        println!("Error resetting alarm: {}", e);
    }

    hub.disconnect().await;
    Ok(())
}
