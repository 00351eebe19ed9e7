// MIT License - Copyright (c) 2021 TJForc
// Transport seam between the device client and the network

pub mod discovery;
pub mod engine;
pub mod udp;

use std::future::Future;

use crate::error::Result;
use crate::protocol::{Ack, ConfirmedRequest};

pub use udp::{UdpTransport, broadcast};

/// Something that can carry a confirmed request to one hub and bring back
/// its reply.
///
/// `UdpTransport` is the real implementation; tests plug in scripted ones.
pub trait Transport: Send + Sync + 'static {
    /// Send a request and wait for the matching acknowledgement.
    ///
    /// Error, Reject and Abort replies come back as `LinkboxError::Rejected`.
    fn send_and_wait(&self, request: &ConfirmedRequest) -> impl Future<Output = Result<Ack>> + Send;

    /// Stop accepting requests. Outstanding and later calls fail with
    /// `LinkboxError::SessionClosed`.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
