// MIT License - Copyright (c) 2021 TJForc
// BACnet/IP over UDP: unicast session to one hub, and local broadcast

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use crate::codec::{Apdu, decode_frame, reply_invoke_id};
use crate::config::HubConfig;
use crate::constants::MAX_FRAME_LEN;
use crate::error::Result;
use crate::protocol::{Ack, ConfirmedRequest};
use crate::transport::Transport;
use crate::transport::engine::{PendingReplies, RequestEngine};

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// UDP transport bound to one hub address.
pub struct UdpTransport {
    engine: Arc<RequestEngine>,
    local_addr: SocketAddr,
    reader_handle: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Resolve the hub address, bind a local socket and start the reader task.
    ///
    /// UDP is connectionless, so this succeeds even if the hub is down; the
    /// first request will time out instead.
    pub async fn connect(config: &HubConfig) -> Result<Self> {
        let peer = config.address.resolve().await?;
        let bind: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, config.local_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, config.local_port).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let local_addr = socket.local_addr()?;
        info!("Bound {} for hub {}", local_addr, peer);

        let engine = Arc::new(RequestEngine::new(
            socket.clone(),
            peer,
            config.request_timeout,
            config.request_retries,
        ));
        let reader_handle = spawn_reader_task(socket, peer, engine.pending_replies());

        Ok(Self {
            engine,
            local_addr,
            reader_handle: Some(reader_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer(&self) -> SocketAddr {
        self.engine.peer()
    }
}

impl Transport for UdpTransport {
    async fn send_and_wait(&self, request: &ConfirmedRequest) -> Result<Ack> {
        self.engine.send_and_wait(request).await
    }

    async fn close(&self) {
        self.engine.close().await;
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}

/// Spawn the reader task that hands replies from the hub to waiting requests.
fn spawn_reader_task(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    pending: PendingReplies,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if from != peer {
                debug!("Dropping datagram from unexpected sender {}", from);
                continue;
            }
            let apdu = match decode_frame(&buf[..n]) {
                Ok(apdu) => apdu,
                Err(e) => match reply_invoke_id(&buf[..n]) {
                    Some(invoke_id) => {
                        if let Some(tx) = pending.lock().await.remove(&invoke_id) {
                            let _ = tx.send(Err(e));
                        } else {
                            debug!("Undecodable reply for idle invoke id {}: {}", invoke_id, e);
                        }
                        continue;
                    }
                    None => {
                        debug!("Dropping undecodable frame from {}: {}", from, e);
                        continue;
                    }
                },
            };
            let invoke_id = match &apdu {
                Apdu::SimpleAck { invoke_id, .. }
                | Apdu::ComplexAck { invoke_id, .. }
                | Apdu::Error { invoke_id, .. }
                | Apdu::Reject { invoke_id, .. }
                | Apdu::Abort { invoke_id, .. } => *invoke_id,
                other => {
                    debug!("Ignoring unsolicited {:?}", other);
                    continue;
                }
            };
            match pending.lock().await.remove(&invoke_id) {
                Some(tx) => {
                    let _ = tx.send(Ok(apdu));
                }
                None => debug!("No request waiting on invoke id {}, dropping reply", invoke_id),
            }
        }
    })
}

/// Send one frame as a broadcast and collect every decodable reply that
/// arrives within `window`.
///
/// Uses its own socket so it never interferes with hub sessions.
pub async fn broadcast(
    target: SocketAddr,
    frame: &[u8],
    window: Duration,
) -> Result<Vec<(SocketAddr, Apdu)>> {
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.set_broadcast(true)?;
    socket.send_to(frame, target).await?;
    debug!("Broadcast {} bytes to {}", frame.len(), target);

    let deadline = Instant::now() + window;
    let replies = collect_replies(deadline, || {
        let socket = &socket;
        async move {
            let mut buf = vec![0u8; MAX_FRAME_LEN];
            let (n, from) = socket.recv_from(&mut buf).await?;
            buf.truncate(n);
            Ok::<_, io::Error>((from, buf))
        }
    })
    .await;
    Ok(replies)
}

/// Receive until `deadline`, keeping every datagram that decodes.
///
/// Receive errors (an ICMP port-unreachable from an earlier send, for
/// instance) are logged and the window keeps running.
async fn collect_replies<F, Fut>(deadline: Instant, mut recv: F) -> Vec<(SocketAddr, Apdu)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(SocketAddr, Vec<u8>)>>,
{
    let mut replies = Vec::new();
    loop {
        match timeout_at(deadline, recv()).await {
            Ok(Ok((from, datagram))) => match decode_frame(&datagram) {
                Ok(apdu) => replies.push((from, apdu)),
                Err(e) => debug!("Dropping undecodable reply from {}: {}", from, e),
            },
            Ok(Err(e)) => {
                warn!("Receive error during broadcast: {}", e);
                // a persistent error would otherwise spin until the deadline
                let pause = (Instant::now() + RECV_ERROR_BACKOFF).min(deadline);
                sleep_until(pause).await;
            }
            Err(_) => break,
        }
    }
    replies
}
