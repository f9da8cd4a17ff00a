use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use futures::channel::mpsc;

use crate::BUFFER_SIZE;

/// How the relay treats the traffic it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMode {
    /// forward bytes unchanged both ways
    Transparent,
    /// forward at most that many response bytes per connection, then close
    /// both sides
    Truncate(usize),
    /// never contact the upstream, answer every read with these bytes
    Answer(Vec<u8>),
}

/// What went through the relay
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub connections: usize,
    /// bytes read from clients
    pub bytes_up: usize,
    /// bytes written to clients
    pub bytes_down: usize,
}

/// Handle to a detached thread where a relay runs
pub struct RelayHandle {
    pub name: String,
    /// where clients connect
    pub address: SocketAddr,
    /// Allows to stop the relay within the thread
    stop_tx: mpsc::Sender<()>,
    stats_rx: mpsc::Receiver<RelayStats>,
}

enum Pumped {
    Data(usize),
    Empty,
    Closed,
}

struct Pair {
    downstream: TcpStream,
    upstream: Option<TcpStream>,
    forwarded: usize,
    closed: bool,
}

impl Pair {
    fn pump(&mut self, mode: &RelayMode, stats: &mut RelayStats) {
        let mut buf = [0u8; BUFFER_SIZE];

        match read(&mut self.downstream, &mut buf) {
            Pumped::Data(n) => {
                stats.bytes_up += n;
                let written = match (mode, self.upstream.as_mut()) {
                    (RelayMode::Answer(answer), _) => {
                        stats.bytes_down += answer.len();
                        write_all(&mut self.downstream, answer)
                    }
                    (_, Some(upstream)) => write_all(upstream, &buf[..n]),
                    (_, None) => Ok(()),
                };
                if let Err(e) = written {
                    println!("relay write error: {e}");
                    return self.close();
                }
            }
            Pumped::Closed => return self.close(),
            Pumped::Empty => {}
        }

        let upstream = match self.upstream.as_mut() {
            Some(upstream) => upstream,
            None => return,
        };
        match read(upstream, &mut buf) {
            Pumped::Data(n) => {
                let n = match mode {
                    RelayMode::Truncate(limit) => n.min(limit.saturating_sub(self.forwarded)),
                    _ => n,
                };
                if let Err(e) = write_all(&mut self.downstream, &buf[..n]) {
                    println!("relay write error: {e}");
                    return self.close();
                }
                self.forwarded += n;
                stats.bytes_down += n;
                if matches!(mode, RelayMode::Truncate(limit) if self.forwarded >= *limit) {
                    self.close();
                }
            }
            Pumped::Closed => self.close(),
            Pumped::Empty => {}
        }
    }

    fn close(&mut self) {
        let _ = self.downstream.shutdown(Shutdown::Both);
        if let Some(upstream) = &self.upstream {
            let _ = upstream.shutdown(Shutdown::Both);
        }
        self.closed = true;
    }
}

fn read(stream: &mut TcpStream, buf: &mut [u8]) -> Pumped {
    match stream.read(buf) {
        Ok(0) => Pumped::Closed,
        Ok(n) => Pumped::Data(n),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Pumped::Empty,
        Err(e) => {
            println!("relay read error: {e}");
            Pumped::Closed
        }
    }
}

fn write_all(stream: &mut TcpStream, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(1)),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl RelayHandle {
    /// Listen on an ephemeral local port and relay every accepted connection
    /// to `upstream_address` on its own connection
    pub fn spawn_detached<S: Into<String>>(
        name: S,
        upstream_address: SocketAddr,
        mode: RelayMode,
    ) -> Self {
        let name = name.into();
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (mut stats_tx, stats_rx) = mpsc::channel::<RelayStats>(1);

        let listener = TcpListener::bind("127.0.0.1:0").expect("could not bind the relay");
        let address = listener.local_addr().expect("could not get the relay address");
        listener
            .set_nonblocking(true)
            .expect("could not set nonblocking on the relay listener");
        println!("{name}: relaying {address} to {upstream_address} ({mode:?})");

        let thread_name = name.clone();
        thread::spawn(move || {
            let mut stats = RelayStats::default();
            let mut pairs: Vec<Pair> = Vec::new();
            loop {
                match listener.accept() {
                    Ok((downstream, _)) => {
                        stats.connections += 1;
                        let upstream = match mode {
                            RelayMode::Answer(_) => None,
                            _ => match TcpStream::connect(upstream_address) {
                                Ok(stream) => Some(stream),
                                Err(e) => {
                                    println!("{thread_name}: could not reach upstream: {e}");
                                    None
                                }
                            },
                        };
                        let nonblocking = downstream.set_nonblocking(true).and_then(|()| {
                            upstream
                                .as_ref()
                                .map_or(Ok(()), |stream| stream.set_nonblocking(true))
                        });
                        if let Err(e) = nonblocking {
                            println!("{thread_name}: could not set nonblocking: {e}");
                        }
                        pairs.push(Pair {
                            downstream,
                            upstream,
                            forwarded: 0,
                            closed: false,
                        });
                    }
                    Err(error) => {
                        if error.kind() != ErrorKind::WouldBlock {
                            println!("{thread_name}: accept error: {error:?}");
                        }
                    }
                }
                for pair in pairs.iter_mut() {
                    pair.pump(&mode, &mut stats);
                }
                pairs.retain(|pair| !pair.closed);

                match stop_rx.try_next() {
                    Ok(Some(())) | Ok(None) => break,
                    Err(_) => thread::sleep(Duration::from_millis(1)),
                }
            }
            for pair in pairs.iter_mut() {
                pair.close();
            }
            let _ = stats_tx.try_send(stats);
        });

        Self {
            name,
            address,
            stop_tx,
            stats_rx,
        }
    }

    pub fn stop_and_get_stats(&mut self) -> Option<RelayStats> {
        self.stop_tx.try_send(()).ok()?;
        for _ in 0..1000 {
            if let Ok(Some(stats)) = self.stats_rx.try_next() {
                return Some(stats);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
    }
}
