use std::{
    cmp::min,
    io,
    net::SocketAddr,
    os::unix::io::{AsRawFd, RawFd},
    time::{Duration, Instant},
};

use mio::{net::TcpListener, Interest, Registry, Token};
use tandem_command_lib::config::{ClientConfig, ServerConfig, TlsSettings};

use crate::{
    ready::{Readiness, Ready},
    socket::{self, SocketHandler, SocketResult, Transport, TransportProtocol},
    tls::{TlsClientStream, TlsError},
};

/// reads attempted for one readable event before yielding to other endpoints
const MAX_READS_PER_EVENT: usize = 16;

/// Tracks one endpoint across log lines
macro_rules! log_context {
    ($self:expr) => {
        format!(
            "ENDPOINT\t{}\t{:?}({:?}) {}\treadiness={}\t >>>",
            $self
                .token
                .map(|token| token.0.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            $self.role,
            $self.state,
            $self.address,
            $self.readiness,
        )
    };
}

#[derive(thiserror::Error, Debug)]
pub enum EndpointError {
    #[error("could not connect to {address}: {error}")]
    Connect {
        address: SocketAddr,
        error: io::Error,
    },
    #[error("could not listen on {address}: {error}")]
    Listen {
        address: SocketAddr,
        error: io::Error,
    },
    #[error("could not set up TLS: {0}")]
    Tls(#[from] TlsError),
    #[error("I/O error with {address}: {error}")]
    Io {
        address: SocketAddr,
        error: io::Error,
    },
    #[error("invalid operation {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: EndpointState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Init,
    Connecting,
    /// listening socket, spawns connected server endpoints
    Accepting,
    Connected,
    Closed,
}

/// How bytes leave a connected endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// write at most that many bytes per syscall, 0 means no limit
    pub segment_size: usize,
    /// wait between two segments
    pub segment_gap: Duration,
    /// size of one read
    pub max_read: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            segment_size: 0,
            segment_gap: Duration::ZERO,
            max_read: tandem_command_lib::config::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl StreamOptions {
    pub fn from_client_config(config: &ClientConfig, max_read: usize) -> Self {
        StreamOptions {
            segment_size: config.segment_size,
            segment_gap: config.segment_gap,
            max_read,
        }
    }

    pub fn from_server_config(config: &ServerConfig, max_read: usize) -> Self {
        StreamOptions {
            segment_size: config.segment_size,
            segment_gap: config.segment_gap,
            max_read,
        }
    }

    fn nodelay(&self) -> bool {
        self.segment_size > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub bind_address: Option<SocketAddr>,
    pub tls: Option<TlsSettings>,
    pub stream: StreamOptions,
}

impl ConnectOptions {
    pub fn from_client_config(config: &ClientConfig, max_read: usize) -> Self {
        ConnectOptions {
            bind_address: config.bind_address,
            tls: config.tls.clone(),
            stream: StreamOptions::from_client_config(config, max_read),
        }
    }
}

enum Socket {
    Stream(Transport),
    Listener(TcpListener),
}

/// One simulated connection, or a listening socket, owned by the reactor
/// once registered
pub struct Endpoint {
    role: Role,
    state: EndpointState,
    /// peer address of a stream, local address of a listener
    address: SocketAddr,
    socket: Socket,
    token: Option<Token>,
    pub readiness: Readiness,
    options: StreamOptions,
    output: Vec<u8>,
    next_write: Option<Instant>,
    close_after_flush: bool,
}

impl Endpoint {
    fn new(role: Role, state: EndpointState, address: SocketAddr, socket: Socket, options: StreamOptions) -> Self {
        let mut endpoint = Endpoint {
            role,
            state,
            address,
            socket,
            token: None,
            readiness: Readiness::new(),
            options,
            output: Vec::new(),
            next_write: None,
            close_after_flush: false,
        };
        endpoint.update_interest();
        endpoint
    }

    /// Start a nonblocking connection, the endpoint is `Connected` if it
    /// completed synchronously and `Connecting` otherwise
    pub fn connect(address: SocketAddr, options: &ConnectOptions) -> Result<Endpoint, EndpointError> {
        let (stream, connected) =
            socket::connect(address, options.bind_address, options.stream.nodelay())
                .map_err(|error| EndpointError::Connect { address, error })?;

        let transport = match &options.tls {
            Some(settings) => Transport::Tls(Box::new(TlsClientStream::new(stream, settings)?)),
            None => Transport::Plain(stream),
        };
        let state = if connected {
            EndpointState::Connected
        } else {
            EndpointState::Connecting
        };

        let endpoint = Endpoint::new(Role::Client, state, address, Socket::Stream(transport), options.stream);
        debug!("{} connection started", log_context!(endpoint));
        Ok(endpoint)
    }

    pub fn listen(address: SocketAddr, options: StreamOptions) -> Result<Endpoint, EndpointError> {
        let listener =
            socket::server_bind(address).map_err(|error| EndpointError::Listen { address, error })?;
        let local = listener
            .local_addr()
            .map_err(|error| EndpointError::Listen { address, error })?;

        let endpoint = Endpoint::new(
            Role::Server,
            EndpointState::Accepting,
            local,
            Socket::Listener(listener),
            options,
        );
        info!("{} listening", log_context!(endpoint));
        Ok(endpoint)
    }

    /// Accept one pending connection without blocking
    pub fn accept(&mut self) -> Result<Option<Endpoint>, EndpointError> {
        let listener = match &mut self.socket {
            Socket::Listener(listener) => listener,
            Socket::Stream(_) => {
                return Err(EndpointError::InvalidState {
                    operation: "accept",
                    state: self.state,
                })
            }
        };

        match listener.accept() {
            Ok((stream, address)) => {
                if self.options.nodelay() {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("{} could not set nodelay: {}", log_context!(self), e);
                    }
                }
                let endpoint = Endpoint::new(
                    Role::Server,
                    EndpointState::Connected,
                    address,
                    Socket::Stream(Transport::Plain(stream)),
                    self.options,
                );
                debug!("{} accepted {}", log_context!(self), address);
                Ok(Some(endpoint))
            }
            Err(e) => match socket::classify(e) {
                SocketResult::WouldBlock => {
                    self.readiness.event.remove(Ready::READABLE);
                    Ok(None)
                }
                // the connection died in the backlog
                SocketResult::Closed | SocketResult::Continue => Ok(None),
                SocketResult::Fatal(error) => Err(EndpointError::Io {
                    address: self.address,
                    error,
                }),
            },
        }
    }

    /// One nonblocking write bypassing the output buffer. Returns 0 on
    /// would-block, and when the peer is gone (the endpoint is then closed).
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, EndpointError> {
        let address = self.address;
        let transport = self.transport_mut("send")?;
        let (size, result) = transport.socket_write(bytes);
        match result {
            SocketResult::Continue => {}
            SocketResult::WouldBlock => self.readiness.event.remove(Ready::WRITABLE),
            SocketResult::Closed => {
                self.close();
                return Ok(0);
            }
            SocketResult::Fatal(error) => return Err(EndpointError::Io { address, error }),
        }
        debug!("{} sent {} bytes", log_context!(self), size);
        self.update_interest();
        Ok(size)
    }

    /// One nonblocking read of at most `max` bytes. An empty result is either
    /// would-block or a closed peer, `is_closed` tells them apart.
    pub fn recv(&mut self, max: usize) -> Result<Vec<u8>, EndpointError> {
        let address = self.address;
        let transport = self.transport_mut("recv")?;
        let mut buffer = vec![0; max];
        let (size, result) = transport.socket_read(&mut buffer);
        buffer.truncate(size);
        match result {
            SocketResult::Continue => {}
            SocketResult::WouldBlock => self.readiness.event.remove(Ready::READABLE),
            SocketResult::Closed => self.close(),
            SocketResult::Fatal(error) => return Err(EndpointError::Io { address, error }),
        }
        Ok(buffer)
    }

    /// Buffer bytes to be written on the next writable events
    pub fn queue(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
        self.update_interest();
    }

    /// close once the output buffer is drained
    pub fn close_after_flush(&mut self) {
        self.close_after_flush = true;
        if self.output.is_empty() && self.state == EndpointState::Connected {
            self.close();
        }
    }

    /// Idempotent. The reactor releases the socket on its next tick.
    pub fn close(&mut self) {
        if self.state == EndpointState::Closed {
            return;
        }
        if let Socket::Stream(transport) = &mut self.socket {
            transport.shutdown();
        }
        debug!("{} closing", log_context!(self));
        self.state = EndpointState::Closed;
        self.output.clear();
        self.readiness.reset();
    }

    /// Drain the socket until it would block, the peer closes or the per event
    /// budget is spent
    pub fn handle_read(&mut self) -> Result<Vec<u8>, EndpointError> {
        trace!("{} ============== readable", log_context!(self));
        let address = self.address;
        let max_read = self.options.max_read;
        let mut data = Vec::new();
        let mut buffer = vec![0; max_read];

        for _ in 0..MAX_READS_PER_EVENT {
            let transport = self.transport_mut("read")?;
            let (size, result) = transport.socket_read(&mut buffer);
            data.extend_from_slice(&buffer[..size]);
            match result {
                SocketResult::Continue => {}
                SocketResult::WouldBlock => {
                    self.readiness.event.remove(Ready::READABLE | Ready::HUP);
                    break;
                }
                SocketResult::Closed => {
                    self.close();
                    break;
                }
                SocketResult::Fatal(error) => return Err(EndpointError::Io { address, error }),
            }
        }

        if !data.is_empty() {
            debug!("{} read {} bytes", log_context!(self), data.len());
        }
        Ok(data)
    }

    /// Confirm a pending connection, then flush the output buffer. Returns
    /// true when the connection was confirmed by this call.
    pub fn handle_write(&mut self, now: Instant) -> Result<bool, EndpointError> {
        trace!("{} ============== writable", log_context!(self));
        let mut connected = false;
        if self.state == EndpointState::Connecting {
            connected = self.confirm_connection()?;
            if !connected {
                return Ok(false);
            }
        }
        if self.state != EndpointState::Connected {
            return Ok(connected);
        }
        if self.next_write.map_or(false, |at| at > now) {
            return Ok(connected);
        }
        self.next_write = None;

        let address = self.address;
        let segment_size = self.options.segment_size;
        let segment_gap = self.options.segment_gap;
        let mut written = 0;
        loop {
            let length = match segment_size {
                0 => self.output.len(),
                size => min(size, self.output.len()),
            };
            let transport = match &mut self.socket {
                Socket::Stream(transport) => transport,
                Socket::Listener(_) => break,
            };
            if length == 0 && !transport.wants_write() {
                break;
            }

            let (size, result) = transport.socket_write(&self.output[..length]);
            self.output.drain(..size);
            written += size;
            match result {
                SocketResult::Continue => {
                    if size == 0 {
                        break;
                    }
                    if segment_size > 0 && !segment_gap.is_zero() {
                        self.next_write = Some(now + segment_gap);
                        break;
                    }
                }
                SocketResult::WouldBlock => {
                    self.readiness.event.remove(Ready::WRITABLE);
                    break;
                }
                SocketResult::Closed => {
                    self.close();
                    return Ok(connected);
                }
                SocketResult::Fatal(error) => return Err(EndpointError::Io { address, error }),
            }
        }

        if written > 0 {
            debug!("{} wrote {} bytes", log_context!(self), written);
        }
        if self.close_after_flush && !self.has_pending_output() {
            self.close();
        }
        self.update_interest();
        Ok(connected)
    }

    /// An error event: a failed connection is fatal, a vanished peer closes
    /// the endpoint
    pub fn handle_error(&mut self) -> Result<(), EndpointError> {
        let address = self.address;
        let pending = match &self.socket {
            Socket::Stream(transport) => transport.socket_ref().take_error(),
            Socket::Listener(listener) => listener.take_error(),
        };
        self.readiness.event.remove(Ready::ERROR);

        let error = match pending {
            Ok(Some(error)) | Err(error) => error,
            Ok(None) => return Ok(()),
        };
        if self.state == EndpointState::Connecting {
            error!("{} connection failed: {}", log_context!(self), error);
            self.close();
            return Err(EndpointError::Connect { address, error });
        }
        match socket::classify(error) {
            SocketResult::Fatal(error) => {
                error!("{} socket error: {}", log_context!(self), error);
                Err(EndpointError::Io { address, error })
            }
            _ => {
                self.close();
                Ok(())
            }
        }
    }

    /// A failed connection closes the endpoint, the reactor releases it on
    /// its next sweep
    fn confirm_connection(&mut self) -> Result<bool, EndpointError> {
        let confirmed = self.check_connection();
        if confirmed.is_err() {
            self.close();
        }
        confirmed
    }

    fn check_connection(&mut self) -> Result<bool, EndpointError> {
        let address = self.address;
        let stream = self.transport_mut("connect")?.socket_ref();
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(error)) | Err(error) => {
                error!("ENDPOINT\tconnection to {} failed: {}", address, error);
                return Err(EndpointError::Connect { address, error });
            }
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.state = EndpointState::Connected;
                info!("{} connected", log_context!(self));
                self.update_interest();
                Ok(true)
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::ENOTCONN) =>
            {
                // spurious wakeup, the handshake is still running
                self.readiness.event.remove(Ready::WRITABLE);
                Ok(false)
            }
            Err(error) => Err(EndpointError::Connect { address, error }),
        }
    }

    fn update_interest(&mut self) {
        let mut interest = Ready::HUP | Ready::ERROR;
        match self.state {
            EndpointState::Accepting => interest.insert(Ready::READABLE),
            EndpointState::Connecting => interest.insert(Ready::WRITABLE),
            EndpointState::Connected => {
                interest.insert(Ready::READABLE);
                if self.has_pending_output() {
                    interest.insert(Ready::WRITABLE);
                }
            }
            EndpointState::Init | EndpointState::Closed => interest = Ready::EMPTY,
        }
        self.readiness.interest = interest;
    }

    fn transport_mut(&mut self, operation: &'static str) -> Result<&mut Transport, EndpointError> {
        match &mut self.socket {
            Socket::Stream(transport) => Ok(transport),
            Socket::Listener(_) => Err(EndpointError::InvalidState {
                operation,
                state: self.state,
            }),
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match &mut self.socket {
            Socket::Stream(transport) => registry.register(
                transport.socket_mut(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?,
            Socket::Listener(listener) => registry.register(listener, token, Interest::READABLE)?,
        }
        self.token = Some(token);
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.token = None;
        match &mut self.socket {
            Socket::Stream(transport) => registry.deregister(transport.socket_mut()),
            Socket::Listener(listener) => registry.deregister(listener),
        }
    }

    /// Work the reactor can do right now without waiting for the poller
    pub fn has_ready_work(&self, now: Instant) -> bool {
        let ready = self.readiness.filter_interest();
        if ready.is_readable() || ready.is_error() || ready.is_hup() {
            return true;
        }
        ready.is_writable() && self.next_write.map_or(true, |at| at <= now)
    }

    /// when a throttled writer may write its next segment
    pub fn throttled_until(&self, now: Instant) -> Option<Instant> {
        let ready = self.readiness.filter_interest();
        match self.next_write {
            Some(at) if ready.is_writable() && at > now => Some(at),
            _ => None,
        }
    }

    pub fn has_pending_output(&self) -> bool {
        if !self.output.is_empty() {
            return true;
        }
        match &self.socket {
            Socket::Stream(transport) => transport.wants_write(),
            Socket::Listener(_) => false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.socket {
            Socket::Stream(transport) => transport.socket_ref().as_raw_fd(),
            Socket::Listener(listener) => listener.as_raw_fd(),
        }
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        match &self.socket {
            Socket::Stream(transport) => transport.socket_ref().local_addr().ok(),
            Socket::Listener(listener) => listener.local_addr().ok(),
        }
    }

    /// ALPN protocol negotiated on a TLS endpoint
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match &self.socket {
            Socket::Stream(Transport::Tls(stream)) => stream.alpn_protocol().map(<[u8]>::to_vec),
            _ => None,
        }
    }

    pub fn protocol(&self) -> Option<TransportProtocol> {
        match &self.socket {
            Socket::Stream(transport) => Some(transport.protocol()),
            Socket::Listener(_) => None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.socket, Socket::Listener(_))
    }

    pub fn is_closed(&self) -> bool {
        self.state == EndpointState::Closed
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("address", &self.address)
            .field("token", &self.token)
            .field("readiness", &self.readiness)
            .field("pending_output", &self.output.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener as StdListener,
        thread,
    };

    use serial_test::serial;

    use super::*;

    fn wait_connected(endpoint: &mut Endpoint) {
        for _ in 0..200 {
            endpoint.readiness.event.insert(Ready::WRITABLE);
            if endpoint.state() == EndpointState::Connected
                || endpoint.handle_write(Instant::now()).expect("connection failed")
            {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("connection not confirmed");
    }

    #[test]
    #[serial]
    fn connect_send_recv_close() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let mut client =
            Endpoint::connect(address, &ConnectOptions::default()).expect("could not connect");
        assert_eq!(client.role(), Role::Client);
        let (mut peer, _) = listener.accept().unwrap();
        wait_connected(&mut client);

        let mut sent = 0;
        while sent == 0 {
            sent = client.send(b"ping").unwrap();
        }
        assert_eq!(sent, 4);
        let mut buffer = [0; 4];
        peer.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer, b"ping");

        // nothing to read yet: would-block, the endpoint stays open
        assert!(client.recv(16).unwrap().is_empty());
        assert!(!client.is_closed());

        peer.write_all(b"pong").unwrap();
        let mut received = Vec::new();
        for _ in 0..200 {
            received.extend(client.recv(16).unwrap());
            if received.len() == 4 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(received, b"pong");

        drop(peer);
        for _ in 0..200 {
            if client.recv(16).unwrap().is_empty() && client.is_closed() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(client.is_closed());

        // idempotent
        client.close();
        assert_eq!(client.state(), EndpointState::Closed);
    }

    #[test]
    #[serial]
    fn refused_connection_is_closed() {
        // nothing listens on this port once the listener is dropped
        let address = StdListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let mut endpoint = match Endpoint::connect(address, &ConnectOptions::default()) {
            Ok(endpoint) => endpoint,
            // refused synchronously, the endpoint never existed
            Err(EndpointError::Connect { .. }) => return,
            Err(e) => panic!("unexpected error: {e}"),
        };
        assert_eq!(endpoint.state(), EndpointState::Connecting);

        for _ in 0..200 {
            endpoint.readiness.event.insert(Ready::WRITABLE);
            match endpoint.handle_write(Instant::now()) {
                Ok(false) => thread::sleep(Duration::from_millis(5)),
                Ok(true) => panic!("connected to a closed port"),
                Err(EndpointError::Connect { .. }) => {
                    assert_eq!(endpoint.state(), EndpointState::Closed);
                    assert!(endpoint.is_closed());
                    return;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        panic!("connection neither confirmed nor refused");
    }

    #[test]
    #[serial]
    fn listen_and_accept() {
        let mut listener =
            Endpoint::listen("127.0.0.1:0".parse().unwrap(), StreamOptions::default()).unwrap();
        assert_eq!(listener.state(), EndpointState::Accepting);
        assert!(listener.accept().unwrap().is_none());

        let _stream = std::net::TcpStream::connect(listener.address()).unwrap();
        let mut accepted = None;
        for _ in 0..200 {
            accepted = listener.accept().unwrap();
            if accepted.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let accepted = accepted.expect("no connection accepted");
        assert_eq!(accepted.role(), Role::Server);
        assert_eq!(accepted.state(), EndpointState::Connected);
        assert!(matches!(
            listener.send(b"x"),
            Err(EndpointError::InvalidState { .. })
        ));
    }

    #[test]
    #[serial]
    fn segmented_output_waits_for_the_gap() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let options = ConnectOptions {
            stream: StreamOptions {
                segment_size: 2,
                segment_gap: Duration::from_millis(50),
                max_read: 1024,
            },
            ..ConnectOptions::default()
        };
        let mut client = Endpoint::connect(listener.local_addr().unwrap(), &options).unwrap();
        let _peer = listener.accept().unwrap();
        wait_connected(&mut client);

        client.queue(b"abcdef");
        client.readiness.event.insert(Ready::WRITABLE);
        let now = Instant::now();
        client.handle_write(now).unwrap();
        assert!(client.has_pending_output());
        assert!(client.throttled_until(now).is_some());
        assert!(!client.has_ready_work(now));

        // writing again before the gap does nothing
        client.handle_write(now).unwrap();
        let later = now + Duration::from_millis(60);
        assert!(client.has_ready_work(later));
        client.handle_write(later).unwrap();
        client.handle_write(later + Duration::from_millis(60)).unwrap();
        assert!(!client.has_pending_output());
    }
}
