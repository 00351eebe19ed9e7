//! Example: Find hubs on the local network and read their identity.

use waterguard_linkbox::constants::DEFAULT_DISCOVERY_WINDOW;
use waterguard_linkbox::{HubAddress, setup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // A unicast address works too; the broadcast address reaches every hub on the segment
    let address = HubAddress::new("192.168.1.255", 47808);

    println!("Sending Who-Is to {}...", address);
    let ids = setup::discover(&address, DEFAULT_DISCOVERY_WINDOW).await?;
    if ids.is_empty() {
        println!("No hubs answered");
        return Ok(());
    }

    for id in ids {
        match setup::validate(&address, id).await {
            Ok(info) => println!(
                "  {} device={} name={:?} firmware={:?} app={:?}",
                info.title,
                id,
                info.device.name,
                info.device.firmware_revision,
                info.device.application_version,
            ),
            Err(e) => println!("  device={} did not validate: {} ({})", id, e, e.code()),
        }
    }
    Ok(())
}
