//! The event loop.
//!
//! One [`Reactor`] owns a `mio::Poll` and every registered [`Endpoint`].
//! Nothing else holds a reference to its registry: drivers and the
//! orchestrator address endpoints by [`Token`] and go through the reactor's
//! API, so several reactors can live in the same process.

use std::{
    collections::HashMap,
    io,
    os::unix::io::RawFd,
    time::{Duration, Instant},
};

use mio::{Events, Poll, Token};
use slab::Slab;

use crate::{
    endpoint::{Endpoint, EndpointError, EndpointState, Role},
    ready::Ready,
};

const EVENTS_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ReactorError {
    #[error("could not create the poller: {0}")]
    CreatePoll(io::Error),
    #[error("poll failed: {0}")]
    Poll(io::Error),
    #[error("descriptor {0} is already registered")]
    DuplicateDescriptor(RawFd),
    #[error("could not register descriptor {fd}: {error}")]
    Register { fd: RawFd, error: io::Error },
    #[error("no endpoint for token {0:?}")]
    UnknownToken(Token),
    #[error("fatal error on endpoint {token:?}: {error}")]
    Fatal { token: Token, error: EndpointError },
}

/// What happened during one tick, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// a client endpoint finished its connection
    Connected(Token),
    /// a listener spawned a new server endpoint, already registered
    Accepted { listener: Token, connection: Token },
    Received(Token, Vec<u8>),
    /// the endpoint is gone from the registry
    Closed(Token),
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    endpoints: Slab<Endpoint>,
    descriptors: HashMap<RawFd, Token>,
    /// notifications produced outside of a tick, delivered with the next one
    pending: Vec<Notification>,
    /// first fatal error of the last tick, returned by the next one
    fatal: Option<ReactorError>,
}

impl Reactor {
    pub fn new() -> Result<Reactor, ReactorError> {
        Ok(Reactor {
            poll: Poll::new().map_err(ReactorError::CreatePoll)?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            endpoints: Slab::with_capacity(64),
            descriptors: HashMap::new(),
            pending: Vec::new(),
            fatal: None,
        })
    }

    /// Take ownership of an endpoint. A descriptor can only be registered
    /// once.
    pub fn register(&mut self, mut endpoint: Endpoint) -> Result<Token, ReactorError> {
        let fd = endpoint.raw_fd();
        if self.descriptors.contains_key(&fd) {
            error!("REACTOR\trefusing to register descriptor {} twice", fd);
            return Err(ReactorError::DuplicateDescriptor(fd));
        }

        let entry = self.endpoints.vacant_entry();
        let token = Token(entry.key());
        endpoint
            .register(self.poll.registry(), token)
            .map_err(|error| ReactorError::Register { fd, error })?;

        // a connection that completed synchronously is reported like the others
        if endpoint.role() == Role::Client && endpoint.state() == EndpointState::Connected {
            self.pending.push(Notification::Connected(token));
        }

        debug!("REACTOR\tregistered {:?} as {:?}", endpoint, token);
        entry.insert(endpoint);
        self.descriptors.insert(fd, token);
        Ok(token)
    }

    /// Remove an endpoint from the registry and hand it back, `None` if the
    /// token is not registered anymore
    pub fn unregister(&mut self, token: Token) -> Option<Endpoint> {
        let mut endpoint = self.endpoints.try_remove(token.0)?;
        self.descriptors.remove(&endpoint.raw_fd());
        if let Err(e) = endpoint.deregister(self.poll.registry()) {
            warn!("REACTOR\tcould not deregister {:?}: {}", token, e);
        }
        Some(endpoint)
    }

    pub fn endpoint(&self, token: Token) -> Option<&Endpoint> {
        self.endpoints.get(token.0)
    }

    pub fn endpoint_mut(&mut self, token: Token) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(token.0)
    }

    pub fn queue(&mut self, token: Token, bytes: &[u8]) -> Result<(), ReactorError> {
        self.endpoints
            .get_mut(token.0)
            .ok_or(ReactorError::UnknownToken(token))?
            .queue(bytes);
        Ok(())
    }

    /// Mark an endpoint closed, it is released during the next tick
    pub fn close(&mut self, token: Token) {
        if let Some(endpoint) = self.endpoints.get_mut(token.0) {
            endpoint.close();
        }
    }

    /// Close and release every endpoint, without notifications
    pub fn close_all(&mut self) {
        let tokens: Vec<Token> = self.endpoints.iter().map(|(key, _)| Token(key)).collect();
        for token in tokens {
            if let Some(mut endpoint) = self.unregister(token) {
                endpoint.close();
            }
        }
        self.pending.clear();
        self.fatal = None;
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Wait up to `timeout` for readiness, then let every endpoint act on
    /// its accumulated readiness.
    ///
    /// An endpoint failing fatally is closed and the tick goes on: its
    /// notifications are returned, the error comes with the next call.
    pub fn run_once(&mut self, timeout: Duration) -> Result<Vec<Notification>, ReactorError> {
        if let Some(error) = self.fatal.take() {
            return Err(error);
        }
        let wait = self.wait_time(timeout, Instant::now());
        trace!("REACTOR\tpolling for {:?}, {} endpoints", wait, self.endpoints.len());

        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("REACTOR\tpoll interrupted");
                self.events.clear();
            }
            Err(e) => {
                error!("REACTOR\tpoll failed: {}", e);
                return Err(ReactorError::Poll(e));
            }
        }

        for event in self.events.iter() {
            if let Some(endpoint) = self.endpoints.get_mut(event.token().0) {
                endpoint.readiness.event.insert(Ready::from(event));
            }
        }

        let mut notifications = std::mem::take(&mut self.pending);
        let now = Instant::now();
        let keys: Vec<usize> = self.endpoints.iter().map(|(key, _)| key).collect();
        for key in keys {
            let accepted = match self.dispatch(Token(key), now, &mut notifications) {
                Ok(accepted) => accepted,
                Err(error) => {
                    self.close(Token(key));
                    self.record_fatal(error);
                    continue;
                }
            };
            for endpoint in accepted {
                match self.register(endpoint) {
                    Ok(connection) => notifications.push(Notification::Accepted {
                        listener: Token(key),
                        connection,
                    }),
                    Err(error) => self.record_fatal(error),
                }
            }
        }
        self.sweep(&mut notifications);

        Ok(notifications)
    }

    fn record_fatal(&mut self, error: ReactorError) {
        error!("REACTOR	{}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }

    fn dispatch(
        &mut self,
        token: Token,
        now: Instant,
        notifications: &mut Vec<Notification>,
    ) -> Result<Vec<Endpoint>, ReactorError> {
        let mut accepted = Vec::new();
        let endpoint = match self.endpoints.get_mut(token.0) {
            Some(endpoint) => endpoint,
            None => return Ok(accepted),
        };
        let ready = endpoint.readiness.filter_interest();
        if ready.is_empty() || endpoint.is_closed() {
            return Ok(accepted);
        }
        let fatal = |error| ReactorError::Fatal { token, error };

        if ready.is_error() {
            endpoint.handle_error().map_err(fatal)?;
        }

        if endpoint.is_listener() {
            if ready.is_readable() {
                while let Some(connection) = endpoint.accept().map_err(fatal)? {
                    accepted.push(connection);
                }
            }
            return Ok(accepted);
        }

        if ready.is_writable() && !endpoint.is_closed() && endpoint.handle_write(now).map_err(fatal)? {
            notifications.push(Notification::Connected(token));
        }

        if (ready.is_readable() || ready.is_hup()) && !endpoint.is_closed() {
            let data = endpoint.handle_read().map_err(fatal)?;
            if !data.is_empty() {
                notifications.push(Notification::Received(token, data));
            }
        }

        Ok(accepted)
    }

    /// release the endpoints closed during this tick or since the last one
    fn sweep(&mut self, notifications: &mut Vec<Notification>) {
        let closed: Vec<Token> = self
            .endpoints
            .iter()
            .filter(|(_, endpoint)| endpoint.is_closed())
            .map(|(key, _)| Token(key))
            .collect();
        for token in closed {
            if self.unregister(token).is_some() {
                debug!("REACTOR\treleased {:?}", token);
                notifications.push(Notification::Closed(token));
            }
        }
    }

    /// Zero when some endpoint can act without the poller, otherwise the
    /// timeout, shortened to the next segment of a throttled writer
    fn wait_time(&self, timeout: Duration, now: Instant) -> Duration {
        if !self.pending.is_empty() || self.fatal.is_some() {
            return Duration::ZERO;
        }
        let mut wait = timeout;
        for (_, endpoint) in self.endpoints.iter() {
            if endpoint.is_closed() || endpoint.has_ready_work(now) {
                return Duration::ZERO;
            }
            if let Some(at) = endpoint.throttled_until(now) {
                wait = wait.min(at.saturating_duration_since(now));
            }
        }
        wait
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener as StdListener, TcpStream as StdStream},
        thread,
    };

    use serial_test::serial;

    use super::*;
    use crate::endpoint::{ConnectOptions, StreamOptions};

    fn tick_until<F>(reactor: &mut Reactor, mut done: F) -> Vec<Notification>
    where
        F: FnMut(&[Notification]) -> bool,
    {
        let mut all = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            all.extend(reactor.run_once(Duration::from_millis(10)).expect("fatal error"));
            if done(&all) {
                return all;
            }
        }
        panic!("condition not reached, notifications: {all:?}");
    }

    #[test]
    #[serial]
    fn idle_loop_waits_for_the_timeout() {
        let mut reactor = Reactor::new().unwrap();
        let listener =
            Endpoint::listen("127.0.0.1:0".parse().unwrap(), StreamOptions::default()).unwrap();
        reactor.register(listener).unwrap();
        // drain the registration events, if any
        reactor.run_once(Duration::ZERO).unwrap();

        let start = Instant::now();
        let notifications = reactor.run_once(Duration::from_millis(100)).unwrap();
        let elapsed = start.elapsed();
        assert!(notifications.is_empty());
        assert!(elapsed >= Duration::from_millis(90), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn unregister_twice() {
        let mut reactor = Reactor::new().unwrap();
        let listener =
            Endpoint::listen("127.0.0.1:0".parse().unwrap(), StreamOptions::default()).unwrap();
        let token = reactor.register(listener).unwrap();
        assert_eq!(reactor.len(), 1);
        assert!(reactor.unregister(token).is_some());
        assert!(reactor.unregister(token).is_none());
        assert!(reactor.is_empty());
    }

    #[test]
    #[serial]
    fn accept_receive_and_close() {
        let mut reactor = Reactor::new().unwrap();
        let listener =
            Endpoint::listen("127.0.0.1:0".parse().unwrap(), StreamOptions::default()).unwrap();
        let address = listener.address();
        let listener_token = reactor.register(listener).unwrap();

        let mut peer = StdStream::connect(address).unwrap();
        let notifications = tick_until(&mut reactor, |n| {
            n.iter().any(|n| matches!(n, Notification::Accepted { .. }))
        });
        let connection = notifications
            .iter()
            .find_map(|n| match n {
                Notification::Accepted {
                    listener,
                    connection,
                } if *listener == listener_token => Some(*connection),
                _ => None,
            })
            .unwrap();

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let notifications = tick_until(&mut reactor, |n| {
            n.iter().any(|n| matches!(n, Notification::Received(..)))
        });
        let received: Vec<u8> = notifications
            .into_iter()
            .filter_map(|n| match n {
                Notification::Received(token, data) if token == connection => Some(data),
                _ => None,
            })
            .flatten()
            .collect();
        assert!(received.starts_with(b"GET /"));

        reactor.queue(connection, b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        for _ in 0..500 {
            reactor.run_once(Duration::from_millis(10)).unwrap();
            let flushed = reactor
                .endpoint(connection)
                .map_or(true, |endpoint| !endpoint.has_pending_output());
            if flushed {
                break;
            }
        }
        let mut buffer = [0; 19];
        peer.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer, b"HTTP/1.1 200 OK\r\n\r\n");

        drop(peer);
        tick_until(&mut reactor, |n| n.contains(&Notification::Closed(connection)));
        assert!(reactor.endpoint(connection).is_none());
    }

    #[test]
    #[serial]
    fn fatal_error_keeps_the_tick_notifications() {
        let mut reactor = Reactor::new().unwrap();
        let listener =
            Endpoint::listen("127.0.0.1:0".parse().unwrap(), StreamOptions::default()).unwrap();
        let address = listener.address();
        let listener_token = reactor.register(listener).unwrap();

        let refused = StdListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let client = match Endpoint::connect(refused, &ConnectOptions::default()) {
            Ok(client) => client,
            // refused synchronously, no fatal error can reach the loop
            Err(_) => return,
        };
        let client_token = reactor.register(client).unwrap();
        let _peer = StdStream::connect(address).unwrap();
        // let both events land in the same tick
        thread::sleep(Duration::from_millis(50));

        let mut notifications = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let error = loop {
            assert!(Instant::now() < deadline, "no fatal error: {notifications:?}");
            match reactor.run_once(Duration::from_millis(10)) {
                Ok(tick) => notifications.extend(tick),
                Err(error) => break error,
            }
        };

        assert!(matches!(error, ReactorError::Fatal { token, .. } if token == client_token));
        assert!(notifications.iter().any(|n| matches!(
            n,
            Notification::Accepted { listener, .. } if *listener == listener_token
        )));
        assert!(notifications.contains(&Notification::Closed(client_token)));
        assert!(reactor.endpoint(client_token).is_none());
        // reported once
        assert!(reactor.run_once(Duration::ZERO).is_ok());
    }

    #[test]
    #[serial]
    fn client_connects_and_is_closed() {
        let mut reactor = Reactor::new().unwrap();
        let listener =
            Endpoint::listen("127.0.0.1:0".parse().unwrap(), StreamOptions::default()).unwrap();
        let address = listener.address();
        reactor.register(listener).unwrap();

        let client = Endpoint::connect(address, &ConnectOptions::default()).unwrap();
        let token = reactor.register(client).unwrap();
        tick_until(&mut reactor, |n| n.contains(&Notification::Connected(token)));

        reactor.close(token);
        let notifications = reactor.run_once(Duration::from_millis(10)).unwrap();
        assert!(notifications.contains(&Notification::Closed(token)));
        reactor.close_all();
        assert!(reactor.is_empty());
    }
}
