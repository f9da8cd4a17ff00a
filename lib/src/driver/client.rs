//! Simulated clients.
//!
//! [`DeproxyClient`] speaks HTTP/1.x over one connection, [`H2Client`] speaks
//! HTTP/2 with one stream per request. Both hand every request to the
//! pairing tracker as it is queued, and every parsed response as it is
//! received.

use std::{
    collections::VecDeque,
    net::SocketAddr,
};

use mio::Token;

use crate::{
    driver::{next_connection_id, DriverError, Received, Service, ServiceState},
    endpoint::{ConnectOptions, Endpoint},
    message::{
        frame::{self, settings},
        h1::ResponseParser,
        h2::{H2Connection, H2Event},
        Message, Parsed,
    },
    pairing::{ConnectionKey, Pairing, PairingTracker, RequestId},
    reactor::{Notification, Reactor},
};

/// State shared by both clients: one connection and what came back on it
#[derive(Debug)]
struct ClientConnection {
    name: String,
    address: SocketAddr,
    options: ConnectOptions,
    state: ServiceState,
    token: Option<Token>,
    connection: u64,
    connected: bool,
    closed: bool,
    next_request: RequestId,
    responses: VecDeque<Message>,
    last_response: Option<Message>,
    responses_received: usize,
    malformed: Vec<String>,
}

impl ClientConnection {
    fn new(name: String, address: SocketAddr, options: ConnectOptions) -> Self {
        ClientConnection {
            name,
            address,
            options,
            state: ServiceState::Stopped,
            token: None,
            connection: 0,
            connected: false,
            closed: true,
            next_request: 1,
            responses: VecDeque::new(),
            last_response: None,
            responses_received: 0,
            malformed: Vec::new(),
        }
    }

    fn start(&mut self, reactor: &mut Reactor) -> Result<(), DriverError> {
        if self.token.is_some() {
            return Ok(());
        }
        self.state = ServiceState::BeginStart;
        let endpoint = match Endpoint::connect(self.address, &self.options) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!("CLIENT\t{}: could not connect to {}: {}", self.name, self.address, e);
                self.state = ServiceState::Error;
                return Err(e.into());
            }
        };
        let token = match reactor.register(endpoint) {
            Ok(token) => token,
            Err(e) => {
                self.state = ServiceState::Error;
                return Err(e.into());
            }
        };
        self.token = Some(token);
        self.connection = next_connection_id();
        self.connected = false;
        self.closed = false;
        info!(
            "CLIENT\t{}: connecting to {} as connection {}",
            self.name, self.address, self.connection
        );
        Ok(())
    }

    fn stop(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker) {
        if let Some(token) = self.token.take() {
            if let Some(mut endpoint) = reactor.unregister(token) {
                endpoint.close();
            }
            tracker.on_connection_closed(self.connection);
            info!("CLIENT\t{}: stopped", self.name);
        }
        self.connected = false;
        self.closed = true;
        self.state = ServiceState::Stopped;
    }

    fn token(&self) -> Result<Token, DriverError> {
        self.token
            .ok_or_else(|| DriverError::NotConnected(self.name.clone()))
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    fn on_connected(&mut self) {
        debug!("CLIENT\t{}: connected", self.name);
        self.connected = true;
        self.state = ServiceState::Started;
    }

    fn on_closed(&mut self, tracker: &mut PairingTracker) {
        let evicted = tracker.on_connection_closed(self.connection);
        if !evicted.is_empty() {
            info!(
                "CLIENT\t{}: connection closed with {} requests pending",
                self.name,
                evicted.len()
            );
        } else {
            debug!("CLIENT\t{}: connection closed", self.name);
        }
        if self.state == ServiceState::BeginStart {
            self.state = ServiceState::Error;
        }
        self.token = None;
        self.connected = false;
        self.closed = true;
    }

    fn push_response(&mut self, message: Message) {
        self.responses_received += 1;
        self.last_response = Some(message.clone());
        self.responses.push_back(message);
    }

    fn receive(&mut self) -> Received {
        match self.responses.pop_front() {
            Some(message) => Received::Message(message),
            None if self.closed => Received::Closed,
            None => Received::WouldBlock,
        }
    }
}

/// HTTP/1.x client. With a correlation header configured, requests are
/// tagged with their id and responses carrying it pair by id instead of by
/// order.
#[derive(Debug)]
pub struct DeproxyClient {
    connection: ClientConnection,
    buffer: Vec<u8>,
    max_message_size: usize,
    /// requests waiting for a response and whether they are HEAD requests,
    /// whose responses have no body
    heads: VecDeque<(RequestId, bool)>,
    correlation_header: Option<String>,
}

impl DeproxyClient {
    pub fn new(
        name: impl Into<String>,
        address: SocketAddr,
        options: ConnectOptions,
        max_message_size: usize,
        correlation_header: Option<String>,
    ) -> Self {
        DeproxyClient {
            connection: ClientConnection::new(name.into(), address, options),
            buffer: Vec::new(),
            max_message_size,
            heads: VecDeque::new(),
            correlation_header,
        }
    }

    /// Queue a request. The message is consumed: once handed over it can no
    /// longer change.
    pub fn send(
        &mut self,
        reactor: &mut Reactor,
        tracker: &mut PairingTracker,
        mut message: Message,
    ) -> Result<RequestId, DriverError> {
        let token = self.connection.token()?;
        let id = self.connection.next_request_id();
        if let Some(header) = &self.correlation_header {
            message.headers.set(header.as_str(), id.to_string());
        }
        let head = message.method() == Some("HEAD");
        reactor.queue(token, &message.serialize())?;
        debug!("CLIENT\t{}: request {} queued: {}", self.connection.name, id, message);

        self.heads.push_back((id, head));
        tracker.on_request_sent(ConnectionKey::connection(self.connection.connection), id);
        Ok(id)
    }

    /// Queue bytes as they are, expecting one response to them
    pub fn send_raw(
        &mut self,
        reactor: &mut Reactor,
        tracker: &mut PairingTracker,
        bytes: &[u8],
    ) -> Result<RequestId, DriverError> {
        let token = self.connection.token()?;
        let id = self.connection.next_request_id();
        reactor.queue(token, bytes)?;
        debug!("CLIENT\t{}: {} raw bytes queued as request {}", self.connection.name, bytes.len(), id);

        self.heads.push_back((id, bytes.starts_with(b"HEAD ")));
        tracker.on_request_sent(ConnectionKey::connection(self.connection.connection), id);
        Ok(id)
    }

    /// Parse what the buffer holds, returns false when the stream cannot be
    /// resynchronized
    fn parse_responses(&mut self, tracker: &mut PairingTracker, at_eof: bool) -> bool {
        while !self.buffer.is_empty() {
            let head = self.heads.front().map_or(false, |(_, head)| *head);
            let parser = ResponseParser::new(head);
            let parsed = if at_eof {
                parser.parse_at_eof(&self.buffer)
            } else {
                parser.parse(&self.buffer)
            };

            match parsed {
                Parsed::Complete(message, size) => {
                    self.buffer.drain(..size);
                    self.on_response(tracker, message);
                }
                Parsed::Incomplete if self.buffer.len() > self.max_message_size => {
                    let diagnostic = format!(
                        "response exceeds {} bytes without completing",
                        self.max_message_size
                    );
                    warn!("CLIENT\t{}: {}", self.connection.name, diagnostic);
                    self.connection.malformed.push(diagnostic);
                    self.buffer.clear();
                    return false;
                }
                Parsed::Incomplete => break,
                Parsed::Malformed(diagnostic) => {
                    warn!("CLIENT\t{}: malformed response: {}", self.connection.name, diagnostic);
                    self.connection.malformed.push(diagnostic);
                    self.buffer.clear();
                    return false;
                }
            }
        }
        true
    }

    fn on_response(&mut self, tracker: &mut PairingTracker, message: Message) {
        if message.status().map_or(false, |status| (100..200).contains(&status) && status != 101) {
            debug!("CLIENT\t{}: skipping interim response {}", self.connection.name, message);
            return;
        }

        let key = ConnectionKey::connection(self.connection.connection);
        let correlated = self
            .correlation_header
            .as_deref()
            .and_then(|header| message.headers.get(header))
            .and_then(|value| value.trim().parse::<RequestId>().ok());
        let pairing = match correlated {
            Some(id) => tracker.on_response_for(key, id),
            None => tracker.on_response_received(key),
        };
        match pairing {
            Pairing::Paired(id) | Pairing::OutOfOrder { received: id, .. } => {
                self.heads.retain(|(request, _)| *request != id)
            }
            Pairing::Orphan => {}
        }

        debug!("CLIENT\t{}: response {}", self.connection.name, message);
        self.connection.push_response(message);
    }

    pub fn correlation_header(&self) -> Option<&str> {
        self.correlation_header.as_deref()
    }
}

impl Service for DeproxyClient {
    fn name(&self) -> String {
        self.connection.name.clone()
    }

    fn state(&self) -> ServiceState {
        self.connection.state
    }

    fn start(&mut self, reactor: &mut Reactor) -> Result<(), DriverError> {
        if self.connection.token.is_none() {
            self.buffer.clear();
            self.heads.clear();
        }
        self.connection.start(reactor)
    }

    fn stop(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker) {
        self.connection.stop(reactor, tracker);
        self.buffer.clear();
        self.heads.clear();
    }

    fn owns(&self, token: Token) -> bool {
        self.connection.token == Some(token)
    }

    fn handle(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker, notification: &Notification) {
        match notification {
            Notification::Connected(_) => self.connection.on_connected(),
            Notification::Received(token, data) => {
                self.buffer.extend_from_slice(data);
                if !self.parse_responses(tracker, false) {
                    reactor.close(*token);
                }
            }
            Notification::Closed(_) => {
                self.parse_responses(tracker, true);
                self.buffer.clear();
                self.heads.clear();
                self.connection.on_closed(tracker);
            }
            Notification::Accepted { .. } => {}
        }
    }
}

/// HTTP/2 client, prior knowledge over TCP or ALPN over TLS
pub struct H2Client {
    connection: ClientConnection,
    h2: H2Connection,
    resets: Vec<(u32, u32)>,
    goaway: Option<(u32, u32)>,
}

impl std::fmt::Debug for H2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Client")
            .field("connection", &self.connection)
            .field("open_streams", &self.h2.open_streams())
            .field("resets", &self.resets)
            .field("goaway", &self.goaway)
            .finish()
    }
}

impl H2Client {
    pub fn new(name: impl Into<String>, address: SocketAddr, options: ConnectOptions) -> Self {
        H2Client {
            connection: ClientConnection::new(name.into(), address, options),
            h2: H2Connection::new(),
            resets: Vec::new(),
            goaway: None,
        }
    }

    /// Encode a request on the next stream
    pub fn send(
        &mut self,
        reactor: &mut Reactor,
        tracker: &mut PairingTracker,
        message: Message,
    ) -> Result<RequestId, DriverError> {
        let token = self.connection.token()?;
        let id = self.connection.next_request_id();
        let stream_id = self.h2.next_stream_id();
        reactor.queue(token, &self.h2.encode(&message, stream_id))?;
        debug!(
            "CLIENT\t{}: request {} queued on stream {}: {}",
            self.connection.name, id, stream_id, message
        );
        tracker.on_request_sent(ConnectionKey::stream(self.connection.connection, stream_id), id);
        Ok(id)
    }

    /// Queue raw frames. They are not tracked: responses to them are orphans
    /// unless a tracked request uses the same stream.
    pub fn send_raw(&mut self, reactor: &mut Reactor, bytes: &[u8]) -> Result<(), DriverError> {
        let token = self.connection.token()?;
        reactor.queue(token, bytes)?;
        Ok(())
    }

    /// streams reset by the peer, with their error code
    pub fn resets(&self) -> &[(u32, u32)] {
        &self.resets
    }

    /// last stream id and error code of a received GOAWAY
    pub fn goaway(&self) -> Option<(u32, u32)> {
        self.goaway
    }

    fn on_data(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker, token: Token, data: &[u8]) {
        let events = match self.h2.receive(data) {
            Ok(events) => events,
            Err(e) => {
                warn!("CLIENT\t{}: invalid HTTP/2 traffic: {}", self.connection.name, e);
                self.connection.malformed.push(e.to_string());
                reactor.close(token);
                return;
            }
        };

        for event in events {
            match event {
                H2Event::Message { stream_id, message } => {
                    let key = ConnectionKey::stream(self.connection.connection, stream_id);
                    tracker.on_response_received(key);
                    debug!("CLIENT\t{}: response on stream {}: {}", self.connection.name, stream_id, message);
                    self.connection.push_response(message);
                }
                H2Event::Reset {
                    stream_id,
                    error_code,
                } => {
                    info!(
                        "CLIENT\t{}: stream {} reset with error {:#x}",
                        self.connection.name, stream_id, error_code
                    );
                    self.resets.push((stream_id, error_code));
                }
                H2Event::GoAway {
                    last_stream_id,
                    error_code,
                } => {
                    info!(
                        "CLIENT\t{}: GOAWAY after stream {} with error {:#x}",
                        self.connection.name, last_stream_id, error_code
                    );
                    self.goaway = Some((last_stream_id, error_code));
                }
                other => trace!("CLIENT\t{}: {:?}", self.connection.name, other),
            }
        }

        let output = self.h2.take_output();
        if !output.is_empty() {
            if let Err(e) = reactor.queue(token, &output) {
                warn!("CLIENT\t{}: could not answer control frames: {}", self.connection.name, e);
            }
        }
    }
}

impl Service for H2Client {
    fn name(&self) -> String {
        self.connection.name.clone()
    }

    fn state(&self) -> ServiceState {
        self.connection.state
    }

    fn start(&mut self, reactor: &mut Reactor) -> Result<(), DriverError> {
        if self.connection.token.is_some() {
            return Ok(());
        }
        self.h2 = H2Connection::new();
        self.resets.clear();
        self.goaway = None;
        self.connection.start(reactor)?;

        let preface = H2Connection::client_preface(&[
            (settings::ENABLE_PUSH, 0),
            (settings::INITIAL_WINDOW_SIZE, frame::DEFAULT_WINDOW_SIZE),
        ]);
        reactor.queue(self.connection.token()?, &preface)?;
        Ok(())
    }

    fn stop(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker) {
        self.connection.stop(reactor, tracker);
    }

    fn owns(&self, token: Token) -> bool {
        self.connection.token == Some(token)
    }

    fn handle(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker, notification: &Notification) {
        match notification {
            Notification::Connected(_) => self.connection.on_connected(),
            Notification::Received(token, data) => self.on_data(reactor, tracker, *token, data),
            Notification::Closed(_) => self.connection.on_closed(tracker),
            Notification::Accepted { .. } => {}
        }
    }
}

/// Either client, as held by the orchestrator
#[derive(Debug)]
pub enum Client {
    Http1(DeproxyClient),
    Http2(H2Client),
}

impl Client {
    fn connection(&self) -> &ClientConnection {
        match self {
            Client::Http1(client) => &client.connection,
            Client::Http2(client) => &client.connection,
        }
    }

    fn connection_mut(&mut self) -> &mut ClientConnection {
        match self {
            Client::Http1(client) => &mut client.connection,
            Client::Http2(client) => &mut client.connection,
        }
    }

    pub fn send(
        &mut self,
        reactor: &mut Reactor,
        tracker: &mut PairingTracker,
        message: Message,
    ) -> Result<RequestId, DriverError> {
        match self {
            Client::Http1(client) => client.send(reactor, tracker, message),
            Client::Http2(client) => client.send(reactor, tracker, message),
        }
    }

    /// For HTTP/1 the bytes count as one request, for HTTP/2 they are not
    /// tracked
    pub fn send_raw(
        &mut self,
        reactor: &mut Reactor,
        tracker: &mut PairingTracker,
        bytes: &[u8],
    ) -> Result<Option<RequestId>, DriverError> {
        match self {
            Client::Http1(client) => client.send_raw(reactor, tracker, bytes).map(Some),
            Client::Http2(client) => client.send_raw(reactor, bytes).map(|()| None),
        }
    }

    /// pop the oldest unread response
    pub fn receive(&mut self) -> Received {
        self.connection_mut().receive()
    }

    pub fn last_response(&self) -> Option<&Message> {
        self.connection().last_response.as_ref()
    }

    /// responses received since the client was created
    pub fn responses_received(&self) -> usize {
        self.connection().responses_received
    }

    /// responses received and not read yet
    pub fn unread_responses(&self) -> usize {
        self.connection().responses.len()
    }

    pub fn malformed(&self) -> &[String] {
        &self.connection().malformed
    }

    pub fn connection_id(&self) -> u64 {
        self.connection().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection().connected
    }

    pub fn is_closed(&self) -> bool {
        self.connection().closed
    }

    pub fn token(&self) -> Option<Token> {
        self.connection().token
    }
}

impl Service for Client {
    fn name(&self) -> String {
        self.connection().name.clone()
    }

    fn state(&self) -> ServiceState {
        self.connection().state
    }

    fn start(&mut self, reactor: &mut Reactor) -> Result<(), DriverError> {
        match self {
            Client::Http1(client) => client.start(reactor),
            Client::Http2(client) => client.start(reactor),
        }
    }

    fn stop(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker) {
        match self {
            Client::Http1(client) => client.stop(reactor, tracker),
            Client::Http2(client) => client.stop(reactor, tracker),
        }
    }

    fn owns(&self, token: Token) -> bool {
        self.connection().token == Some(token)
    }

    fn handle(&mut self, reactor: &mut Reactor, tracker: &mut PairingTracker, notification: &Notification) {
        match self {
            Client::Http1(client) => client.handle(reactor, tracker, notification),
            Client::Http2(client) => client.handle(reactor, tracker, notification),
        }
    }
}
