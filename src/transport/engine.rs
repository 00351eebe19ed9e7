// MIT License - Copyright (c) 2021 TJForc
// Confirmed-request engine: invoke ids, pending replies, retries

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, error, warn};

use crate::codec::Apdu;
use crate::error::{LinkboxError, Rejection, Result};
use crate::protocol::{Ack, ConfirmedRequest};

/// Replies waiting to be claimed, keyed by invoke id. A reply that could
/// not be decoded arrives as `LinkboxError::Decode`.
pub type PendingReplies = Arc<Mutex<HashMap<u8, oneshot::Sender<Result<Apdu>>>>>;

/// Tracks outstanding requests and routes replies back to callers via
/// oneshot channels.
///
/// Only one request is in flight at a time: the hub has a single request
/// slot, so callers queue on `slot`.
pub struct RequestEngine {
    /// Next invoke id (wraps at 255)
    invoke_id: Mutex<u8>,
    pending: PendingReplies,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    slot: Mutex<()>,
    closed: Arc<RwLock<bool>>,
    request_timeout: Duration,
    retries: u32,
}

impl RequestEngine {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        request_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            invoke_id: Mutex::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            socket,
            peer,
            slot: Mutex::new(()),
            closed: Arc::new(RwLock::new(false)),
            request_timeout,
            retries,
        }
    }

    /// Shared pending map for the reader task.
    pub fn pending_replies(&self) -> PendingReplies {
        self.pending.clone()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    /// Send a request, retrying on timeout up to the configured count.
    pub async fn send_and_wait(&self, request: &ConfirmedRequest) -> Result<Ack> {
        if self.is_closed().await {
            return Err(LinkboxError::SessionClosed);
        }
        let _slot = self.slot.lock().await;
        // close() may have run while we were queued
        if self.is_closed().await {
            return Err(LinkboxError::SessionClosed);
        }

        let mut attempt = 0;
        loop {
            match self.exchange(request).await {
                Err(e @ LinkboxError::Timeout { .. }) if attempt < self.retries => {
                    if self.is_closed().await {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(
                        "{} timed out, retrying ({}/{})",
                        request.describe(),
                        attempt,
                        self.retries
                    );
                }
                other => return other,
            }
        }
    }

    async fn exchange(&self, request: &ConfirmedRequest) -> Result<Ack> {
        let invoke_id = self.next_invoke_id().await;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(invoke_id, tx);

        let frame = request.encode(invoke_id);
        debug!("Sending {} (invoke {})", request.describe(), invoke_id);

        if let Err(e) = self.socket.send_to(&frame, self.peer).await {
            error!("Failed to send to {}: {}", self.peer, e);
            self.pending.lock().await.remove(&invoke_id);
            return Err(LinkboxError::Io(e));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(apdu))) => {
                debug!("Reply for invoke {}: {:?}", invoke_id, apdu);
                ack_from_apdu(apdu)
            }
            Ok(Ok(Err(e))) => {
                warn!("Unreadable reply to {}: {}", request.describe(), e);
                Err(e)
            }
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&invoke_id);
                if self.is_closed().await {
                    Err(LinkboxError::SessionClosed)
                } else {
                    Err(LinkboxError::ChannelClosed)
                }
            }
            Err(_) => {
                // a late reply finds no pending entry and is dropped by the reader
                self.pending.lock().await.remove(&invoke_id);
                debug!("Timeout waiting for invoke {}", invoke_id);
                Err(LinkboxError::Timeout {
                    request: request.describe(),
                })
            }
        }
    }

    async fn next_invoke_id(&self) -> u8 {
        let mut id = self.invoke_id.lock().await;
        let current = *id;
        *id = id.wrapping_add(1);
        current
    }

    /// Refuse further requests, then wait for the in-flight exchange (if
    /// any) to finish or time out. Requests still queued fail with
    /// `SessionClosed`.
    pub async fn close(&self) {
        *self.closed.write().await = true;
        let _slot = self.slot.lock().await;
        debug!("Request engine for {} closed", self.peer);
    }
}

/// Map a reply APDU to the caller's result.
pub(crate) fn ack_from_apdu(apdu: Apdu) -> Result<Ack> {
    match apdu {
        Apdu::SimpleAck { .. } => Ok(Ack::Simple),
        Apdu::ComplexAck { body, .. } => Ok(Ack::Complex(body)),
        Apdu::Error { class, code, .. } => Err(LinkboxError::Rejected(Rejection::Error { class, code })),
        Apdu::Reject { reason, .. } => Err(LinkboxError::Rejected(Rejection::Reject { reason })),
        Apdu::Abort { reason, .. } => Err(LinkboxError::Rejected(Rejection::Abort { reason })),
        other => Err(LinkboxError::decode(format!("unexpected reply {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ObjectId, decode_frame};
    use crate::constants::{ObjectType, SERVICE_READ_PROPERTY, property};

    async fn pair() -> (Arc<UdpSocket>, UdpSocket) {
        let hub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        (client, hub)
    }

    fn read_request() -> ConfirmedRequest {
        ConfirmedRequest::ReadProperty {
            object: ObjectId::new(ObjectType::AnalogInput, 7),
            property: property::PRESENT_VALUE,
        }
    }

    #[test]
    fn test_ack_mapping() {
        assert_eq!(
            ack_from_apdu(Apdu::SimpleAck { invoke_id: 1, service: 15 }).unwrap(),
            Ack::Simple
        );
        match ack_from_apdu(Apdu::Reject { invoke_id: 1, reason: 9 }) {
            Err(LinkboxError::Rejected(Rejection::Reject { reason: 9 })) => {}
            other => panic!("unexpected {other:?}"),
        }
        match ack_from_apdu(Apdu::Error { invoke_id: 1, service: 12, class: 2, code: 32 }) {
            Err(LinkboxError::Rejected(r)) => assert!(r.is_unknown_point()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_retries_then_fails() {
        let (client, hub) = pair().await;
        let engine = RequestEngine::new(
            client,
            hub.local_addr().unwrap(),
            Duration::from_millis(50),
            2,
        );

        let err = engine.send_and_wait(&read_request()).await.unwrap_err();
        assert!(matches!(err, LinkboxError::Timeout { .. }));

        // one original attempt plus two retries, each with a fresh invoke id
        let mut buf = [0u8; 64];
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (n, _) = hub.recv_from(&mut buf).await.unwrap();
            ids.push(decode_frame(&buf[..n]).unwrap().invoke_id().unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(engine.pending_replies().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_reply_routed_by_invoke_id() {
        let (client, hub) = pair().await;
        let engine = Arc::new(RequestEngine::new(
            client,
            hub.local_addr().unwrap(),
            Duration::from_secs(2),
            0,
        ));
        let pending = engine.pending_replies();

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.send_and_wait(&read_request()).await })
        };

        let mut buf = [0u8; 64];
        let (n, _) = hub.recv_from(&mut buf).await.unwrap();
        let id = decode_frame(&buf[..n]).unwrap().invoke_id().unwrap();

        // stand in for the reader task
        let tx = pending.lock().await.remove(&id).unwrap();
        tx.send(Ok(Apdu::ComplexAck {
            invoke_id: id,
            service: SERVICE_READ_PROPERTY,
            body: vec![0xAA],
        }))
        .unwrap();

        assert_eq!(task.await.unwrap().unwrap(), Ack::Complex(vec![0xAA]));
    }

    #[tokio::test]
    async fn test_unreadable_reply_is_not_retried() {
        let (client, hub) = pair().await;
        let engine = Arc::new(RequestEngine::new(
            client,
            hub.local_addr().unwrap(),
            Duration::from_secs(2),
            2,
        ));
        let pending = engine.pending_replies();

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.send_and_wait(&read_request()).await })
        };
        let mut buf = [0u8; 64];
        let (n, _) = hub.recv_from(&mut buf).await.unwrap();
        let id = decode_frame(&buf[..n]).unwrap().invoke_id().unwrap();

        let tx = pending.lock().await.remove(&id).unwrap();
        tx.send(Err(LinkboxError::decode("truncated complex ack"))).unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(LinkboxError::Decode { .. })
        ));
        // no retry went out
        let again = tokio::time::timeout(Duration::from_millis(100), hub.recv_from(&mut buf)).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_second_request_waits_for_first_exchange() {
        let (client, hub) = pair().await;
        let engine = Arc::new(RequestEngine::new(
            client,
            hub.local_addr().unwrap(),
            Duration::from_secs(2),
            0,
        ));
        let pending = engine.pending_replies();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.send_and_wait(&read_request()).await })
        };
        let mut buf = [0u8; 64];
        let (n, _) = hub.recv_from(&mut buf).await.unwrap();
        let first_id = decode_frame(&buf[..n]).unwrap().invoke_id().unwrap();

        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let write = ConfirmedRequest::WriteProperty {
                    object: ObjectId::new(ObjectType::MultiStateOutput, 10),
                    property: property::PRESENT_VALUE,
                    value: crate::codec::PropertyValue::Unsigned(2),
                    priority: None,
                };
                engine.send_and_wait(&write).await
            })
        };

        // the write stays queued while the read is outstanding
        let quiet = tokio::time::timeout(Duration::from_millis(150), hub.recv_from(&mut buf)).await;
        assert!(quiet.is_err());

        let tx = pending.lock().await.remove(&first_id).unwrap();
        tx.send(Ok(Apdu::ComplexAck {
            invoke_id: first_id,
            service: SERVICE_READ_PROPERTY,
            body: vec![],
        }))
        .unwrap();
        first.await.unwrap().unwrap();

        let (n, _) = hub.recv_from(&mut buf).await.unwrap();
        let second_id = decode_frame(&buf[..n]).unwrap().invoke_id().unwrap();
        assert_eq!(second_id, first_id.wrapping_add(1));
        let tx = pending.lock().await.remove(&second_id).unwrap();
        tx.send(Ok(Apdu::SimpleAck {
            invoke_id: second_id,
            service: 15,
        }))
        .unwrap();
        assert_eq!(second.await.unwrap().unwrap(), Ack::Simple);
    }

    #[tokio::test]
    async fn test_close_lets_in_flight_request_finish() {
        let (client, hub) = pair().await;
        let engine = Arc::new(RequestEngine::new(
            client,
            hub.local_addr().unwrap(),
            Duration::from_millis(200),
            3,
        ));

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.send_and_wait(&read_request()).await })
        };
        let mut buf = [0u8; 64];
        hub.recv_from(&mut buf).await.unwrap();

        // close waits for the exchange to time out and stops further retries
        engine.close().await;
        assert!(matches!(
            task.await.unwrap(),
            Err(LinkboxError::Timeout { .. })
        ));
        assert!(matches!(
            engine.send_and_wait(&read_request()).await,
            Err(LinkboxError::SessionClosed)
        ));
    }
}
