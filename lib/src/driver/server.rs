//! Simulated origin server.

use std::net::SocketAddr;

use mio::Token;

use crate::{
    driver::{DriverError, Service, ServiceState},
    endpoint::{Endpoint, StreamOptions},
    message::{h1::parse_request, Message, Parsed},
    pairing::PairingTracker,
    reactor::{Notification, Reactor},
};

/// What the origin answers to every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    Message(Message),
    /// sent verbatim, for malformed or hand crafted answers
    Raw(Vec<u8>),
    /// read requests and never answer
    Silent,
}

impl ServerResponse {
    fn bytes(&self, request: &Message, correlation_header: Option<&str>) -> Option<Vec<u8>> {
        match self {
            ServerResponse::Message(response) => {
                let echoed = correlation_header
                    .and_then(|header| request.headers.get(header).map(|value| (header, value)));
                match echoed {
                    Some((header, value)) => {
                        let mut response = response.clone();
                        response.headers.set(header, value);
                        Some(response.serialize())
                    }
                    None => Some(response.serialize()),
                }
            }
            ServerResponse::Raw(bytes) => Some(bytes.clone()),
            ServerResponse::Silent => None,
        }
    }
}

#[derive(Debug)]
struct ServerConnection {
    token: Token,
    buffer: Vec<u8>,
    served: usize,
}

/// Answers every request with the same configured response and records what
/// it received.
#[derive(Debug)]
pub struct StaticServer {
    name: String,
    address: SocketAddr,
    options: StreamOptions,
    state: ServiceState,
    listener: Option<Token>,
    connections: Vec<ServerConnection>,
    /// connections the system under test is expected to open
    conns_n: usize,
    /// close a connection after that many responses
    keep_alive: Option<usize>,
    max_message_size: usize,
    correlation_header: Option<String>,
    response: ServerResponse,
    requests: Vec<Message>,
    malformed: Vec<String>,
    accepted: usize,
}

impl StaticServer {
    pub fn new(
        name: impl Into<String>,
        address: SocketAddr,
        options: StreamOptions,
        conns_n: usize,
        keep_alive: Option<usize>,
        max_message_size: usize,
        correlation_header: Option<String>,
    ) -> Self {
        StaticServer {
            name: name.into(),
            address,
            options,
            state: ServiceState::Stopped,
            listener: None,
            connections: Vec::new(),
            conns_n,
            keep_alive,
            max_message_size,
            correlation_header,
            response: ServerResponse::Silent,
            requests: Vec::new(),
            malformed: Vec::new(),
            accepted: 0,
        }
    }

    pub fn set_response(&mut self, response: ServerResponse) {
        self.response = response;
    }

    /// bound address, with the actual port once started
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn requests(&self) -> &[Message] {
        &self.requests
    }

    pub fn last_request(&self) -> Option<&Message> {
        self.requests.last()
    }

    pub fn malformed(&self) -> &[String] {
        &self.malformed
    }

    pub fn connections(&self) -> usize {
        self.connections.len()
    }

    /// connections accepted since the start
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn conns_n(&self) -> usize {
        self.conns_n
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
        self.malformed.clear();
    }

    fn on_data(&mut self, reactor: &mut Reactor, token: Token, data: &[u8]) {
        let index = match self.connections.iter().position(|c| c.token == token) {
            Some(index) => index,
            None => return,
        };
        self.connections[index].buffer.extend_from_slice(data);

        loop {
            let connection = &mut self.connections[index];
            if connection.buffer.is_empty() {
                break;
            }
            match parse_request(&connection.buffer) {
                Parsed::Complete(request, size) => {
                    connection.buffer.drain(..size);
                    connection.served += 1;
                    let served = connection.served;
                    debug!("SERVER\t{}: request {}", self.name, request);

                    if let Some(bytes) = self.response.bytes(&request, self.correlation_header.as_deref()) {
                        if let Err(e) = reactor.queue(token, &bytes) {
                            warn!("SERVER\t{}: could not queue the response: {}", self.name, e);
                        }
                    }
                    self.requests.push(request);

                    if self.keep_alive.map_or(false, |limit| served >= limit) {
                        debug!("SERVER\t{}: closing after {} responses", self.name, served);
                        if let Some(endpoint) = reactor.endpoint_mut(token) {
                            endpoint.close_after_flush();
                        }
                        break;
                    }
                }
                Parsed::Incomplete if connection.buffer.len() > self.max_message_size => {
                    let diagnostic =
                        format!("request exceeds {} bytes without completing", self.max_message_size);
                    self.drop_connection(reactor, index, diagnostic);
                    break;
                }
                Parsed::Incomplete => break,
                Parsed::Malformed(diagnostic) => {
                    self.drop_connection(reactor, index, diagnostic);
                    break;
                }
            }
        }
    }

    fn drop_connection(&mut self, reactor: &mut Reactor, index: usize, diagnostic: String) {
        warn!("SERVER\t{}: malformed request: {}", self.name, diagnostic);
        self.malformed.push(diagnostic);
        let connection = &mut self.connections[index];
        connection.buffer.clear();
        reactor.close(connection.token);
    }
}

impl Service for StaticServer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn state(&self) -> ServiceState {
        self.state
    }

    fn start(&mut self, reactor: &mut Reactor) -> Result<(), DriverError> {
        if self.listener.is_some() {
            return Ok(());
        }
        self.state = ServiceState::BeginStart;
        let listener = Endpoint::listen(self.address, self.options).map_err(|e| {
            self.state = ServiceState::Error;
            e
        })?;
        let address = listener.address();
        let token = reactor.register(listener).map_err(|e| {
            self.state = ServiceState::Error;
            e
        })?;

        self.address = address;
        self.listener = Some(token);
        self.state = ServiceState::Started;
        info!("SERVER\t{}: listening on {}", self.name, address);
        Ok(())
    }

    fn stop(&mut self, reactor: &mut Reactor, _tracker: &mut PairingTracker) {
        let tokens = self
            .listener
            .take()
            .into_iter()
            .chain(self.connections.drain(..).map(|connection| connection.token));
        for token in tokens {
            if let Some(mut endpoint) = reactor.unregister(token) {
                endpoint.close();
            }
        }
        if self.state != ServiceState::Stopped {
            info!("SERVER\t{}: stopped", self.name);
        }
        self.state = ServiceState::Stopped;
    }

    fn owns(&self, token: Token) -> bool {
        self.listener == Some(token) || self.connections.iter().any(|c| c.token == token)
    }

    fn handle(&mut self, reactor: &mut Reactor, _tracker: &mut PairingTracker, notification: &Notification) {
        match notification {
            Notification::Accepted { connection, .. } => {
                self.accepted += 1;
                debug!("SERVER\t{}: connection {} accepted", self.name, self.accepted);
                self.connections.push(ServerConnection {
                    token: *connection,
                    buffer: Vec::new(),
                    served: 0,
                });
            }
            Notification::Received(token, data) => self.on_data(reactor, *token, data),
            Notification::Closed(token) => {
                if self.listener == Some(*token) {
                    error!("SERVER\t{}: listener closed", self.name);
                    self.listener = None;
                    self.state = ServiceState::Error;
                }
                self.connections.retain(|c| c.token != *token);
            }
            Notification::Connected(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        time::{Duration, Instant},
    };

    use serial_test::serial;

    use super::*;

    fn pump<F>(reactor: &mut Reactor, server: &mut StaticServer, mut done: F)
    where
        F: FnMut(&StaticServer) -> bool,
    {
        let mut tracker = PairingTracker::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            for notification in reactor.run_once(Duration::from_millis(10)).unwrap() {
                let token = match &notification {
                    Notification::Connected(token)
                    | Notification::Received(token, _)
                    | Notification::Closed(token) => *token,
                    Notification::Accepted { listener, .. } => *listener,
                };
                if server.owns(token) {
                    server.handle(reactor, &mut tracker, &notification);
                }
            }
            if done(server) {
                return;
            }
        }
        panic!("condition not reached: {server:?}");
    }

    fn server(keep_alive: Option<usize>) -> StaticServer {
        StaticServer::new(
            "origin",
            "127.0.0.1:0".parse().unwrap(),
            StreamOptions::default(),
            1,
            keep_alive,
            65536,
            Some("x-tandem-id".to_owned()),
        )
    }

    #[test]
    #[serial]
    fn answers_and_echoes_the_correlation_id() {
        let mut reactor = Reactor::new().unwrap();
        let mut server = server(Some(1));
        server.set_response(ServerResponse::Message(
            Message::response(200).header("Content-Length", "0"),
        ));
        server.start(&mut reactor).unwrap();
        assert_eq!(server.state(), ServiceState::Started);
        assert_ne!(server.address().port(), 0);

        let mut peer = TcpStream::connect(server.address()).unwrap();
        peer.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nx-tandem-id: 42\r\n\r\n")
            .unwrap();
        pump(&mut reactor, &mut server, |server| server.requests().len() == 1);
        assert_eq!(server.last_request().unwrap().uri(), Some("/"));
        assert_eq!(server.accepted(), 1);

        let mut response = Vec::new();
        peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !response.ends_with(b"\r\n\r\n") {
            reactor.run_once(Duration::from_millis(10)).unwrap();
            let mut buffer = [0; 256];
            if let Ok(size) = peer.read(&mut buffer) {
                response.extend_from_slice(&buffer[..size]);
            }
        }
        assert_eq!(
            response,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nx-tandem-id: 42\r\n\r\n"
        );
    }

    #[test]
    #[serial]
    fn malformed_request_drops_the_connection() {
        let mut reactor = Reactor::new().unwrap();
        let mut server = server(None);
        server.start(&mut reactor).unwrap();

        let mut peer = TcpStream::connect(server.address()).unwrap();
        pump(&mut reactor, &mut server, |server| server.connections() == 1);
        peer.write_all(b"GET / HTTP/1.1\r\nbad header\r\n\r\n").unwrap();
        pump(&mut reactor, &mut server, |server| server.connections() == 0);
        assert_eq!(server.malformed().len(), 1);
        assert!(server.requests().is_empty());

        server.stop(&mut reactor, &mut PairingTracker::new());
        assert_eq!(server.state(), ServiceState::Stopped);
        assert!(reactor.is_empty());
    }
}
