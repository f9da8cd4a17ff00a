//! The simulated peers of the system under test: clients on the downstream
//! side, origin servers upstream. Drivers never touch sockets directly, they
//! own reactor tokens and react to its notifications.

pub mod client;
pub mod server;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use mio::Token;

use crate::{
    endpoint::EndpointError,
    message::Message,
    pairing::PairingTracker,
    reactor::{Notification, Reactor, ReactorError},
};

pub use crate::driver::{
    client::{Client, DeproxyClient, H2Client},
    server::{ServerResponse, StaticServer},
};

/// connection ids are unique in the process so pairing keys never collide
static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
    #[error("{0} is not connected")]
    NotConnected(String),
}

/// Result of a nonblocking receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(Message),
    /// nothing yet
    WouldBlock,
    /// nothing left and the connection is closed
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    BeginStart,
    Started,
    Error,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::BeginStart => "begin_start",
            ServiceState::Started => "started",
            ServiceState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub usize);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server {}", self.0)
    }
}

/// Lifecycle and event handling shared by every driver
pub trait Service {
    fn name(&self) -> String;

    fn state(&self) -> ServiceState;

    fn start(&mut self, reactor: &mut Reactor) -> Result<(), DriverError>;

    /// Release every endpoint, pending requests become evictions
    fn stop(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker);

    /// whether the token is one of this driver's endpoints
    fn owns(&self, token: Token) -> bool;

    fn handle(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker, notification: &Notification);
}
