use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr},
};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use crate::tls::TlsClientStream;

/// Outcome of one nonblocking operation on a socket
#[derive(Debug)]
pub enum SocketResult {
    /// progress was made, the operation can be tried again
    Continue,
    /// nothing to do until the next readiness event
    WouldBlock,
    /// the peer went away, this is a normal end of life for the endpoint
    Closed,
    /// any other OS error, it aborts the current run
    Fatal(io::Error),
}

impl SocketResult {
    pub fn is_closed(&self) -> bool {
        matches!(self, SocketResult::Closed)
    }
}

/// Errors meaning the other side is gone: reset, not connected, shut down,
/// aborted, broken pipe, bad descriptor
pub fn is_peer_gone(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    ) {
        return true;
    }
    matches!(
        error.raw_os_error(),
        Some(libc::ECONNRESET)
            | Some(libc::ENOTCONN)
            | Some(libc::ESHUTDOWN)
            | Some(libc::ECONNABORTED)
            | Some(libc::EPIPE)
            | Some(libc::EBADF)
    )
}

pub fn classify(error: io::Error) -> SocketResult {
    match error.kind() {
        ErrorKind::WouldBlock => SocketResult::WouldBlock,
        ErrorKind::Interrupted => SocketResult::Continue,
        _ if is_peer_gone(&error) => SocketResult::Closed,
        _ => SocketResult::Fatal(error),
    }
}

/// One read or one write on a nonblocking socket, never more
pub trait SocketHandler {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult);
    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult);
    fn socket_ref(&self) -> &TcpStream;
    fn socket_mut(&mut self) -> &mut TcpStream;
    /// bytes buffered below the application layer that still need a write
    fn wants_write(&self) -> bool {
        false
    }
    fn protocol(&self) -> TransportProtocol;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Tls,
}

impl SocketHandler for TcpStream {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        match self.read(buf) {
            Ok(0) if !buf.is_empty() => (0, SocketResult::Closed),
            Ok(size) => (size, SocketResult::Continue),
            Err(e) => {
                let result = classify(e);
                if let SocketResult::Fatal(e) = &result {
                    error!("SOCKET\tread error on {:?}: {}", self.peer_addr().ok(), e);
                }
                (0, result)
            }
        }
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        if buf.is_empty() {
            return (0, SocketResult::Continue);
        }
        match self.write(buf) {
            Ok(size) => (size, SocketResult::Continue),
            Err(e) => {
                let result = classify(e);
                if let SocketResult::Fatal(e) = &result {
                    error!("SOCKET\twrite error on {:?}: {}", self.peer_addr().ok(), e);
                }
                (0, result)
            }
        }
    }

    fn socket_ref(&self) -> &TcpStream {
        self
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        self
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }
}

/// The byte stream of a connected endpoint
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsClientStream>),
}

impl Transport {
    pub fn shutdown(&mut self) {
        if let Transport::Tls(stream) = self {
            stream.send_close_notify();
        }
        // the socket may already be gone, nothing to report then
        let _ = self.socket_ref().shutdown(Shutdown::Both);
    }
}

impl SocketHandler for Transport {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        match self {
            Transport::Plain(stream) => stream.socket_read(buf),
            Transport::Tls(stream) => stream.socket_read(buf),
        }
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        match self {
            Transport::Plain(stream) => stream.socket_write(buf),
            Transport::Tls(stream) => stream.socket_write(buf),
        }
    }

    fn socket_ref(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.socket_ref(),
        }
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.socket_mut(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(stream) => stream.wants_write(),
        }
    }

    fn protocol(&self) -> TransportProtocol {
        match self {
            Transport::Plain(_) => TransportProtocol::Tcp,
            Transport::Tls(_) => TransportProtocol::Tls,
        }
    }
}

/// Start a nonblocking connection. The boolean tells whether it completed
/// right away, otherwise it is confirmed on the first writable event.
pub fn connect(
    address: SocketAddr,
    bind_address: Option<SocketAddr>,
    nodelay: bool,
) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if nodelay {
        socket.set_nodelay(true)?;
    }
    if let Some(bind_address) = bind_address {
        socket.set_reuse_address(true)?;
        socket.bind(&bind_address.into())?;
    }

    let connected = match socket.connect(&address.into()) {
        Ok(()) => true,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
        Err(e) if e.kind() == ErrorKind::WouldBlock => false,
        Err(e) => return Err(e),
    };

    Ok((TcpStream::from_std(socket.into()), connected))
}

pub fn server_bind(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;

    // set so_reuseaddr, but only on unix (mirrors what libstd does)
    if cfg!(unix) {
        socket.set_reuse_address(true)?;
    }

    socket.bind(&address.into())?;
    socket.set_nonblocking(true)?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}
