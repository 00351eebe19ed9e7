// MIT License - Copyright (c) 2021 TJForc
// Hub discovery: Who-Is broadcast and the wildcard device read

use std::net::SocketAddr;

use serde::Serialize;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use crate::codec::{Apdu, ObjectId, PropertyValue};
use crate::config::HubAddress;
use crate::constants::{ObjectType, WILDCARD_DEVICE_INSTANCE, property};
use crate::error::{LinkboxError, Result};
use crate::protocol::{Ack, ConfirmedRequest, decode_i_am, decode_read_property_ack, encode_who_is};
use crate::transport::{Transport, broadcast};

/// One hub that answered a Who-Is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DiscoveredHub {
    pub address: SocketAddr,
    pub device_id: u32,
    pub vendor_id: u32,
    pub max_apdu: u32,
}

/// Broadcast a Who-Is at `target` and collect I-Am replies for the whole
/// window.
///
/// Replies are deduplicated by (address, device id) and kept in arrival
/// order. No replies is an empty list, not an error. Replies arriving after
/// the window closes are discarded.
pub async fn discover(target: &HubAddress, window: Duration) -> Result<Vec<DiscoveredHub>> {
    let addr = target.resolve().await?;
    info!("Discovering hubs via {} ({}s window)", addr, window.as_secs_f32());

    let replies = broadcast(addr, &encode_who_is(None), window).await?;
    let hubs = collect_hubs(replies);

    if hubs.is_empty() {
        info!("No hubs answered");
    } else {
        for hub in &hubs {
            info!("Found hub {} at {}", hub.device_id, hub.address);
        }
    }
    Ok(hubs)
}

fn collect_hubs(replies: Vec<(SocketAddr, Apdu)>) -> Vec<DiscoveredHub> {
    let mut hubs: Vec<DiscoveredHub> = Vec::new();
    for (from, apdu) in replies {
        let Apdu::UnconfirmedRequest { service, body } = apdu else {
            debug!("Ignoring non-announcement from {}", from);
            continue;
        };
        match decode_i_am(service, &body) {
            Ok(i_am) => {
                let seen = hubs
                    .iter()
                    .any(|h| h.address == from && h.device_id == i_am.device_id);
                if !seen {
                    hubs.push(DiscoveredHub {
                        address: from,
                        device_id: i_am.device_id,
                        vendor_id: i_am.vendor_id,
                        max_apdu: i_am.max_apdu,
                    });
                }
            }
            Err(e) => debug!("Ignoring reply from {}: {}", from, e),
        }
    }
    hubs
}

/// Ask a hub for its own device id by reading the object identifier of the
/// wildcard device instance.
///
/// Returns `None` if the hub does not answer within `wait` or refuses the
/// read.
pub async fn query_device_id<T: Transport>(transport: &T, wait: Duration) -> Result<Option<u32>> {
    let request = ConfirmedRequest::ReadProperty {
        object: ObjectId::device(WILDCARD_DEVICE_INSTANCE),
        property: property::OBJECT_IDENTIFIER,
    };
    let ack = match timeout(wait, transport.send_and_wait(&request)).await {
        Err(_) | Ok(Err(LinkboxError::Timeout { .. })) => {
            debug!("Wildcard read timed out");
            return Ok(None);
        }
        Ok(Err(LinkboxError::Rejected(rejection))) => {
            warn!("Wildcard read refused: {}", rejection);
            return Ok(None);
        }
        Ok(Err(e)) => return Err(e),
        Ok(Ok(ack)) => ack,
    };
    let Ack::Complex(body) = ack else {
        return Err(LinkboxError::decode("wildcard read answered with simple ack"));
    };
    match decode_read_property_ack(&body)?.2 {
        PropertyValue::ObjectId(id) if id.object_type == ObjectType::Device => Ok(Some(id.instance)),
        other => Err(LinkboxError::decode(format!(
            "wildcard read returned {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SERVICE_I_AM;

    fn i_am(device_id: u32) -> Apdu {
        let mut body = Vec::new();
        crate::codec::encode_application_value(
            &mut body,
            &PropertyValue::ObjectId(ObjectId::device(device_id)),
        );
        crate::codec::encode_application_value(&mut body, &PropertyValue::Unsigned(1476));
        crate::codec::encode_application_value(&mut body, &PropertyValue::Enumerated(3));
        crate::codec::encode_application_value(&mut body, &PropertyValue::Unsigned(260));
        Apdu::UnconfirmedRequest {
            service: SERVICE_I_AM,
            body,
        }
    }

    #[test]
    fn test_collect_dedupes_by_address_and_id() {
        let a: SocketAddr = "192.168.1.20:47808".parse().unwrap();
        let b: SocketAddr = "192.168.1.21:47808".parse().unwrap();
        let hubs = collect_hubs(vec![
            (a, i_am(100)),
            (a, i_am(100)),
            (b, i_am(200)),
            (a, Apdu::SimpleAck { invoke_id: 0, service: 15 }),
        ]);
        assert_eq!(hubs.len(), 2);
        assert_eq!(hubs[0].device_id, 100);
        assert_eq!(hubs[0].vendor_id, 260);
        assert_eq!(hubs[1].address, b);
    }

    #[test]
    fn test_same_id_different_address_kept() {
        let a: SocketAddr = "10.0.0.1:47808".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:47808".parse().unwrap();
        assert_eq!(collect_hubs(vec![(a, i_am(5)), (b, i_am(5))]).len(), 2);
    }

    #[tokio::test]
    async fn test_discover_with_no_replies_is_empty() {
        // nothing listens on this socket's port once it is dropped
        let port = {
            let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            s.local_addr().unwrap().port()
        };
        let hubs = discover(&HubAddress::new("127.0.0.1", port), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(hubs.is_empty());
    }
}
