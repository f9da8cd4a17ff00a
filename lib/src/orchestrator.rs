//! Runs scenarios: owns the reactor, the drivers, the pairing tracker and the
//! comparison strategies, and advances everything one tick at a time until a
//! condition holds or a deadline passes.

use std::{
    fmt,
    net::SocketAddr,
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use mio::Token;
use tandem_command_lib::config::{ClientConfig, Config, ServerConfig};

use crate::{
    chain::Chain,
    driver::{
        Client, ClientId, DeproxyClient, DriverError, H2Client, Received, ServerId,
        ServerResponse, Service, ServiceState, StaticServer,
    },
    endpoint::{ConnectOptions, StreamOptions},
    expectation::{Comparator, ExpectationResult, FieldComparator, Mismatch, Subject},
    message::Message,
    pairing::{PairingTracker, RequestId},
    reactor::{Notification, Reactor, ReactorError},
};

/// ticks a step that expects no response waits for one to show up anyway
const QUIET_TICKS: u32 = 10;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("unknown {0}")]
    UnknownClient(ClientId),
    #[error("unknown {0}")]
    UnknownServer(ServerId),
    #[error("{name} did not start within {timeout:?}, state {state}")]
    StartTimeout {
        name: String,
        state: ServiceState,
        timeout: Duration,
    },
}

/// Outcome of a chain run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioReport {
    pub results: Vec<ExpectationResult>,
    /// steps whose exchange did not complete before the deadline
    pub unmatched: Vec<usize>,
    /// pairing violations, and evictions past the tolerated count
    pub violations: Vec<String>,
    pub evictions: usize,
}

impl ScenarioReport {
    pub fn is_success(&self) -> bool {
        self.unmatched.is_empty()
            && self.violations.is_empty()
            && self.results.iter().all(ExpectationResult::is_pass)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExpectationResult> {
        self.results.iter().filter(|result| !result.is_pass())
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let passed = self.results.iter().filter(|result| result.is_pass()).count();
        write!(
            f,
            "{passed}/{} steps passed, {} evictions",
            self.results.len(),
            self.evictions
        )?;
        for result in self.failures() {
            write!(f, "\n{result}")?;
        }
        if !self.unmatched.is_empty() {
            write!(f, "\nunmatched steps: {:?}", self.unmatched)?;
        }
        for violation in &self.violations {
            write!(f, "\nviolation: {violation}")?;
        }
        Ok(())
    }
}

pub struct Orchestrator {
    config: Config,
    reactor: Reactor,
    tracker: PairingTracker,
    default_comparator: FieldComparator,
    comparators: Vec<Box<dyn Comparator>>,
    clients: Vec<Client>,
    servers: Vec<StaticServer>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self, OrchestratorError> {
        let mut default_comparator = FieldComparator::new(config.date_tolerance);
        // the tag is added on the wire, declared messages never carry it
        if let Some(header) = &config.correlation_header {
            default_comparator = default_comparator.ignore_header(header);
        }
        Ok(Orchestrator {
            default_comparator,
            config,
            reactor: Reactor::new()?,
            tracker: PairingTracker::new(),
            comparators: Vec::new(),
            clients: Vec::new(),
            servers: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &PairingTracker {
        &self.tracker
    }

    pub fn add_client(&mut self, config: ClientConfig) -> ClientId {
        let id = ClientId(self.clients.len());
        let max = self.config.max_message_size;
        self.clients.push(Client::Http1(DeproxyClient::new(
            id.to_string(),
            config.address,
            ConnectOptions::from_client_config(&config, max),
            max,
            self.config.correlation_header.clone(),
        )));
        id
    }

    pub fn add_h2_client(&mut self, config: ClientConfig) -> ClientId {
        let id = ClientId(self.clients.len());
        self.clients.push(Client::Http2(H2Client::new(
            id.to_string(),
            config.address,
            ConnectOptions::from_client_config(&config, self.config.max_message_size),
        )));
        id
    }

    pub fn add_server(&mut self, config: ServerConfig) -> ServerId {
        let id = ServerId(self.servers.len());
        let max = self.config.max_message_size;
        self.servers.push(StaticServer::new(
            id.to_string(),
            config.address,
            StreamOptions::from_server_config(&config, max),
            config.conns_n,
            config.keep_alive,
            max,
            self.config.correlation_header.clone(),
        ));
        id
    }

    pub fn client(&self, id: ClientId) -> Result<&Client, OrchestratorError> {
        self.clients
            .get(id.0)
            .ok_or(OrchestratorError::UnknownClient(id))
    }

    fn client_mut(&mut self, id: ClientId) -> Result<&mut Client, OrchestratorError> {
        self.clients
            .get_mut(id.0)
            .ok_or(OrchestratorError::UnknownClient(id))
    }

    pub fn server(&self, id: ServerId) -> Result<&StaticServer, OrchestratorError> {
        self.servers
            .get(id.0)
            .ok_or(OrchestratorError::UnknownServer(id))
    }

    pub fn server_mut(&mut self, id: ServerId) -> Result<&mut StaticServer, OrchestratorError> {
        self.servers
            .get_mut(id.0)
            .ok_or(OrchestratorError::UnknownServer(id))
    }

    /// Start the servers, then the clients, and wait for every client to be
    /// connected
    pub fn start(&mut self) -> Result<(), OrchestratorError> {
        for index in 0..self.servers.len() {
            self.start_server(ServerId(index))?;
        }
        for index in 0..self.clients.len() {
            self.clients[index].start(&mut self.reactor)?;
        }
        for index in 0..self.clients.len() {
            self.wait_started(ClientId(index))?;
        }
        Ok(())
    }

    /// Stop every service, pending requests become evictions
    pub fn stop(&mut self) {
        for client in &mut self.clients {
            client.stop(&mut self.reactor, &mut self.tracker);
        }
        for server in &mut self.servers {
            server.stop(&mut self.reactor, &mut self.tracker);
        }
        self.reactor.close_all();
    }

    pub fn start_client(&mut self, id: ClientId) -> Result<(), OrchestratorError> {
        let reactor = &mut self.reactor;
        self.clients
            .get_mut(id.0)
            .ok_or(OrchestratorError::UnknownClient(id))?
            .start(reactor)?;
        self.wait_started(id)
    }

    pub fn stop_client(&mut self, id: ClientId) -> Result<(), OrchestratorError> {
        let (reactor, tracker) = (&mut self.reactor, &mut self.tracker);
        self.clients
            .get_mut(id.0)
            .ok_or(OrchestratorError::UnknownClient(id))?
            .stop(reactor, tracker);
        Ok(())
    }

    /// Close the connection and open a new one
    pub fn restart_client(&mut self, id: ClientId) -> Result<(), OrchestratorError> {
        self.stop_client(id)?;
        self.start_client(id)
    }

    pub fn start_server(&mut self, id: ServerId) -> Result<(), OrchestratorError> {
        let reactor = &mut self.reactor;
        self.servers
            .get_mut(id.0)
            .ok_or(OrchestratorError::UnknownServer(id))?
            .start(reactor)?;
        Ok(())
    }

    pub fn stop_server(&mut self, id: ServerId) -> Result<(), OrchestratorError> {
        let (reactor, tracker) = (&mut self.reactor, &mut self.tracker);
        self.servers
            .get_mut(id.0)
            .ok_or(OrchestratorError::UnknownServer(id))?
            .stop(reactor, tracker);
        Ok(())
    }

    fn wait_started(&mut self, id: ClientId) -> Result<(), OrchestratorError> {
        let timeout = self.config.chain_timeout;
        self.client(id)?;
        self.tick_until(timeout, |o| {
            o.clients[id.0].state() != ServiceState::BeginStart
        })?;
        let client = self.client(id)?;
        match client.state() {
            ServiceState::Started => Ok(()),
            state => Err(OrchestratorError::StartTimeout {
                name: client.name(),
                state,
                timeout,
            }),
        }
    }

    /// One reactor iteration, notifications go to the driver owning the
    /// endpoint
    pub fn tick(&mut self, timeout: Duration) -> Result<(), OrchestratorError> {
        for notification in self.reactor.run_once(timeout)? {
            let token = match &notification {
                Notification::Connected(token)
                | Notification::Received(token, _)
                | Notification::Closed(token) => *token,
                Notification::Accepted { listener, .. } => *listener,
            };
            self.dispatch(token, &notification);
        }
        Ok(())
    }

    fn dispatch(&mut self, token: Token, notification: &Notification) {
        if let Some(client) = self.clients.iter_mut().find(|client| client.owns(token)) {
            client.handle(&mut self.reactor, &mut self.tracker, notification);
        } else if let Some(server) = self.servers.iter_mut().find(|server| server.owns(token)) {
            server.handle(&mut self.reactor, &mut self.tracker, notification);
        } else {
            trace!("ORCHESTRATOR\tno driver for {:?}: {:?}", token, notification);
        }
    }

    /// Tick until `done` holds, false if the timeout passed first
    pub fn tick_until<F>(&mut self, timeout: Duration, mut done: F) -> Result<bool, OrchestratorError>
    where
        F: FnMut(&Orchestrator) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.tick(self.config.tick.min(deadline - now))?;
        }
    }

    pub fn send(&mut self, client: ClientId, message: Message) -> Result<RequestId, OrchestratorError> {
        let (reactor, tracker) = (&mut self.reactor, &mut self.tracker);
        Ok(self
            .clients
            .get_mut(client.0)
            .ok_or(OrchestratorError::UnknownClient(client))?
            .send(reactor, tracker, message)?)
    }

    /// Send bytes as they are, see [`Client::send_raw`]
    pub fn send_raw(&mut self, client: ClientId, bytes: &[u8]) -> Result<Option<RequestId>, OrchestratorError> {
        let (reactor, tracker) = (&mut self.reactor, &mut self.tracker);
        Ok(self
            .clients
            .get_mut(client.0)
            .ok_or(OrchestratorError::UnknownClient(client))?
            .send_raw(reactor, tracker, bytes)?)
    }

    /// Send all messages at once when pipelined, otherwise wait for each
    /// response before sending the next request
    pub fn make_requests(
        &mut self,
        client: ClientId,
        messages: Vec<Message>,
        pipelined: bool,
    ) -> Result<Vec<RequestId>, OrchestratorError> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.send(client, message)?);
            if !pipelined && !self.wait_for_response(client, self.config.chain_timeout)? {
                warn!("ORCHESTRATOR\t{}: no response to request {:?}", client, ids.last());
            }
        }
        Ok(ids)
    }

    /// Wait for the next unread response of the client
    pub fn receive(&mut self, client: ClientId, timeout: Duration) -> Result<Received, OrchestratorError> {
        self.client(client)?;
        self.tick_until(timeout, |o| {
            let client = &o.clients[client.0];
            client.unread_responses() > 0 || client.is_closed()
        })?;
        Ok(self.client_mut(client)?.receive())
    }

    /// Wait for the server to hold the number of connections it expects
    pub fn wait_for_connections(&mut self, server: ServerId, timeout: Duration) -> Result<bool, OrchestratorError> {
        self.server(server)?;
        self.tick_until(timeout, |o| {
            let server = &o.servers[server.0];
            server.connections() >= server.conns_n()
        })
    }

    /// Wait for every request of the client to be answered, or the connection
    /// to close
    pub fn wait_for_response(&mut self, client: ClientId, timeout: Duration) -> Result<bool, OrchestratorError> {
        self.client(client)?;
        self.tick_until(timeout, |o| {
            let client = &o.clients[client.0];
            client.is_closed() || o.tracker.outstanding_on(client.connection_id()) == 0
        })
    }

    pub fn wait_for_requests(
        &mut self,
        server: ServerId,
        count: usize,
        timeout: Duration,
    ) -> Result<bool, OrchestratorError> {
        self.server(server)?;
        self.tick_until(timeout, |o| o.servers[server.0].requests().len() >= count)
    }

    pub fn wait_for_connection_close(&mut self, client: ClientId, timeout: Duration) -> Result<bool, OrchestratorError> {
        self.client(client)?;
        self.tick_until(timeout, |o| o.clients[client.0].is_closed())
    }

    /// Answer every request with these bytes
    pub fn set_server_response(&mut self, server: ServerId, bytes: impl Into<Vec<u8>>) -> Result<(), OrchestratorError> {
        self.server_mut(server)?
            .set_response(ServerResponse::Raw(bytes.into()));
        Ok(())
    }

    pub fn set_server_message(&mut self, server: ServerId, message: Message) -> Result<(), OrchestratorError> {
        self.server_mut(server)?
            .set_response(ServerResponse::Message(message));
        Ok(())
    }

    /// address the server listens on, with the actual port once started
    pub fn server_address(&self, server: ServerId) -> Result<SocketAddr, OrchestratorError> {
        Ok(self.server(server)?.address())
    }

    /// Compare with `comparator` until the guard is dropped
    pub fn with_comparator(&mut self, comparator: Box<dyn Comparator>) -> ComparatorGuard<'_> {
        self.comparators.push(comparator);
        ComparatorGuard { orchestrator: self }
    }

    pub fn comparator(&self) -> &dyn Comparator {
        match self.comparators.last() {
            Some(comparator) => comparator.as_ref(),
            None => &self.default_comparator,
        }
    }

    /// Run a chain with the first client and the first server
    pub fn run(&mut self, chain: &Chain, timeout: Duration) -> Result<ScenarioReport, OrchestratorError> {
        let server = if self.servers.is_empty() {
            None
        } else {
            Some(ServerId(0))
        };
        self.run_on(ClientId(0), server, chain, timeout)
    }

    /// Run every step of the chain within `timeout`. Each step installs its
    /// origin response, sends its request and waits for the exchange to
    /// complete, then compares. Steps left when the deadline passes are
    /// reported unmatched.
    pub fn run_on(
        &mut self,
        client: ClientId,
        server: Option<ServerId>,
        chain: &Chain,
        timeout: Duration,
    ) -> Result<ScenarioReport, OrchestratorError> {
        self.client(client)?;
        if let Some(server) = server {
            self.server(server)?;
        }
        let deadline = Instant::now() + timeout;
        let violations_before = self.tracker.violations().len();
        let evictions_before = self.tracker.evicted_requests();
        let mut report = ScenarioReport::default();
        info!("ORCHESTRATOR\trunning a chain of {} steps on {}", chain.len(), client);

        for index in 0..chain.len() {
            let step = match chain.prepared_step(index) {
                Some(Ok(step)) => step,
                Some(Err(e)) => {
                    warn!("ORCHESTRATOR\tstep {}: {}", index, e);
                    let mut result = ExpectationResult::new(index);
                    result.diffs.push(Mismatch::Violation(e.to_string()));
                    report.results.push(result);
                    continue;
                }
                None => break,
            };

            if self.clients[client.0].is_closed() {
                debug!("ORCHESTRATOR\tstep {}: reconnecting {}", index, client);
                self.start_client(client)?;
            }
            while let Received::Message(stale) = self.clients[client.0].receive() {
                warn!("ORCHESTRATOR\tstep {}: dropping unread response {}", index, stale);
            }

            let (requests_before, server_malformed_before) = match server {
                Some(server) => {
                    let server = &mut self.servers[server.0];
                    server.set_response(
                        step.server_response
                            .clone()
                            .map_or(ServerResponse::Silent, ServerResponse::Message),
                    );
                    (server.requests().len(), server.malformed().len())
                }
                None => (0, 0),
            };
            let client_malformed_before = self.clients[client.0].malformed().len();

            self.send(client, step.request.clone())?;
            let expects_forward = step.forwarded_request.is_some() && server.is_some();
            let expects_response = step.response.is_some();
            let quiet_until = Instant::now() + self.config.tick * QUIET_TICKS;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let completed = self.tick_until(remaining, |o| {
                let c = &o.clients[client.0];
                let forwarded = !expects_forward
                    || server.map_or(true, |s| o.servers[s.0].requests().len() > requests_before);
                let settled = c.unread_responses() > 0
                    || (!expects_response && Instant::now() >= quiet_until);
                (settled && forwarded)
                    || c.is_closed()
                    || c.malformed().len() > client_malformed_before
            })?;

            let mut result = ExpectationResult::new(index);
            let received = match self.clients[client.0].receive() {
                Received::Message(message) => Some(message),
                Received::WouldBlock | Received::Closed => None,
            };
            match (&step.response, received) {
                (Some(expected), Some(received)) => result.push_diffs(
                    Subject::Response,
                    self.comparator().compare(expected, &received),
                ),
                (Some(_), None) => result.diffs.push(Mismatch::Missing(Subject::Response)),
                (None, Some(_)) => result.diffs.push(Mismatch::Unexpected(Subject::Response)),
                (None, None) => {}
            }
            for diagnostic in &self.clients[client.0].malformed()[client_malformed_before..] {
                result.diffs.push(Mismatch::Malformed {
                    subject: Subject::Response,
                    diagnostic: diagnostic.clone(),
                });
            }

            if let Some(server) = server {
                let server = &self.servers[server.0];
                let forwarded = server.requests().get(requests_before);
                match (&step.forwarded_request, forwarded) {
                    (Some(expected), Some(received)) => result.push_diffs(
                        Subject::ForwardedRequest,
                        self.comparator().compare(expected, received),
                    ),
                    (Some(_), None) => result
                        .diffs
                        .push(Mismatch::Missing(Subject::ForwardedRequest)),
                    (None, Some(_)) => result
                        .diffs
                        .push(Mismatch::Unexpected(Subject::ForwardedRequest)),
                    (None, None) => {}
                }
                for diagnostic in &server.malformed()[server_malformed_before..] {
                    result.diffs.push(Mismatch::Malformed {
                        subject: Subject::ForwardedRequest,
                        diagnostic: diagnostic.clone(),
                    });
                }
            }

            if result.is_pass() {
                debug!("ORCHESTRATOR\t{}", result);
            } else {
                warn!("ORCHESTRATOR\t{}", result);
            }
            let unmatched = !completed && result.is_unmatched();
            report.results.push(result);
            if unmatched {
                warn!("ORCHESTRATOR\tdeadline passed at step {}", index);
                report.unmatched.extend(index..chain.len());
                break;
            }
        }

        report.violations = self.tracker.violations()[violations_before..]
            .iter()
            .map(ToString::to_string)
            .collect();
        report.evictions = self.tracker.evicted_requests() - evictions_before;
        if let Some(max) = self.config.max_evictions {
            if report.evictions > max {
                report.violations.push(format!(
                    "{} requests evicted, at most {} tolerated",
                    report.evictions, max
                ));
            }
        }
        info!("ORCHESTRATOR\t{}", report);
        Ok(report)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps a comparison strategy active, it is removed when the guard drops.
/// The orchestrator is reachable through the guard meanwhile.
pub struct ComparatorGuard<'a> {
    orchestrator: &'a mut Orchestrator,
}

impl Deref for ComparatorGuard<'_> {
    type Target = Orchestrator;

    fn deref(&self) -> &Orchestrator {
        self.orchestrator
    }
}

impl DerefMut for ComparatorGuard<'_> {
    fn deref_mut(&mut self) -> &mut Orchestrator {
        self.orchestrator
    }
}

impl Drop for ComparatorGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.comparators.pop();
    }
}
