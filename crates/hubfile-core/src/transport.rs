//! Session/transport interface consumed by the engine.
//!
//! The engine never owns a socket. A host session delivers inbound frames
//! as [`TransportEvent`]s and sends outbound payloads through
//! [`Transport::send`]. Routing, login and reconnection are the host's
//! business.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::Result;

static MSG_ID: AtomicU32 = AtomicU32::new(1);

/// Frame class on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    /// Command frames, used for control messages
    Cmd,
    /// Message frames, used for data and acks
    Msg,
}

/// Addressing for one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Frame class
    pub major: Major,
    /// Sub-protocol number
    pub sub_proto: u8,
    /// Sending node
    pub source_id: u32,
    /// Receiving node (or the hub)
    pub target_id: u32,
    /// Per-process sequence number
    pub msg_id: u32,
}

impl Route {
    /// A command route on the file sub-protocol.
    pub fn command(source_id: u32, target_id: u32) -> Self {
        Self::new(Major::Cmd, source_id, target_id)
    }

    /// A message route on the file sub-protocol.
    pub fn message(source_id: u32, target_id: u32) -> Self {
        Self::new(Major::Msg, source_id, target_id)
    }

    fn new(major: Major, source_id: u32, target_id: u32) -> Self {
        Self {
            major,
            sub_proto: crate::SUB_PROTO_FILE,
            source_id,
            target_id,
            msg_id: MSG_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One frame delivered by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Frame class as a raw byte
    pub major: u8,
    /// Sub-protocol number
    pub sub_proto: u8,
    /// Node that sent the frame
    pub source_id: u32,
    /// Node the frame was addressed to
    pub target_id: u32,
    /// Sub-protocol payload
    pub payload: Vec<u8>,
}

/// Events the host session feeds into the engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound frame
    Frame(InboundFrame),
    /// The session (re)connected
    Connected,
    /// The session dropped
    Disconnected(String),
    /// The session reported an error
    Error(String),
}

/// Outbound half of the session.
pub trait Transport: Send + Sync + 'static {
    /// Send one payload along `route`.
    ///
    /// Frames sent to the same target must be delivered in send order.
    fn send(&self, route: Route, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn send(&self, route: Route, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send {
        (**self).send(route, payload)
    }
}
