//! Socket transport for audio frames and control messages
//!
//! [`TransportChannel`] owns the single connection to the voice endpoint and
//! reports what happens on it as [`ChannelEvent`]s. The socket itself is
//! produced by a [`Connector`], which lets tests replace the WebSocket with
//! in-memory queues.

pub mod channel;
pub mod websocket;

pub use channel::{ChannelSettings, ChannelStats, TransportChannel};
pub use websocket::WsConnector;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{InboundControl, OutboundControl};

/// Lifecycle of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What the channel reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Closed,
    Binary(Bytes),
    Control(InboundControl),
}

/// One socket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
}

/// Inbound socket activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(WireMessage),
    Error(String),
}

/// An open socket, seen as a pair of queues.
///
/// Dropping `outbound` closes the socket; the end of `inbound` means the
/// socket is gone.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<WireMessage>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Handshake in progress
pub type PendingLink = BoxFuture<'static, Result<SocketLink, TransportError>>;

/// Builds sockets to the voice endpoint
pub trait Connector: Send + Sync + 'static {
    /// Construct a socket for `url`. Fails synchronously if no socket can be
    /// built at all; the returned future performs the handshake.
    fn open(&self, url: &str) -> Result<PendingLink, TransportError>;
}

/// What the client needs from a transport
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> Result<(), TransportError>;

    fn disconnect(&self);

    fn is_open(&self) -> bool;

    /// Resolves `true` once open, `false` after `timeout`
    fn wait_until_connected(&self, timeout: Duration) -> BoxFuture<'static, bool>;

    /// Send one binary frame. Dropped unless open.
    fn send(&self, frame: Bytes);

    /// Send a control message. Dropped unless open.
    fn send_control(&self, message: &OutboundControl);
}
