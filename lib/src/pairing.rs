//! Request/response pairing.
//!
//! Responses pair with requests in strict FIFO order per connection key.
//! Anything else (a response with nothing outstanding, a correlated response
//! overtaking an older request) is recorded as a violation, and the queues
//! are never reordered to hide it. Requests still pending when their
//! connection closes are evicted without error.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
};

pub type RequestId = u64;

/// A connection, and for HTTP/2 a stream on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub connection: u64,
    pub stream: Option<u32>,
}

impl ConnectionKey {
    pub fn connection(connection: u64) -> Self {
        ConnectionKey {
            connection,
            stream: None,
        }
    }

    pub fn stream(connection: u64, stream: u32) -> Self {
        ConnectionKey {
            connection,
            stream: Some(stream),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream {
            Some(stream) => write!(f, "connection {} stream {}", self.connection, stream),
            None => write!(f, "connection {}", self.connection),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    Paired(RequestId),
    /// the response answers `received` while `expected` was sent first
    OutOfOrder {
        expected: RequestId,
        received: RequestId,
    },
    /// no outstanding request on this key
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    OutOfOrder {
        key: ConnectionKey,
        expected: RequestId,
        received: RequestId,
    },
    Orphan {
        key: ConnectionKey,
        /// correlation id carried by the response, if any
        request: Option<RequestId>,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::OutOfOrder {
                key,
                expected,
                received,
            } => write!(
                f,
                "{key}: response to request {received} arrived before the response to request {expected}"
            ),
            Violation::Orphan {
                key,
                request: Some(id),
            } => write!(f, "{key}: response for unknown request {id}"),
            Violation::Orphan { key, request: None } => {
                write!(f, "{key}: response without an outstanding request")
            }
        }
    }
}

/// Requests discarded because their connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub connection: u64,
    pub requests: Vec<RequestId>,
}

#[derive(Debug, Default)]
pub struct PairingTracker {
    pending: BTreeMap<ConnectionKey, VecDeque<RequestId>>,
    violations: Vec<Violation>,
    evictions: Vec<Eviction>,
}

impl PairingTracker {
    pub fn new() -> Self {
        PairingTracker::default()
    }

    pub fn on_request_sent(&mut self, key: ConnectionKey, id: RequestId) {
        trace!("PAIRING\t{key}: request {id} sent");
        self.pending.entry(key).or_default().push_back(id);
    }

    /// Pair an uncorrelated response with the oldest outstanding request
    pub fn on_response_received(&mut self, key: ConnectionKey) -> Pairing {
        match self.pending.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(id) => {
                self.drop_empty(key);
                trace!("PAIRING\t{key}: response paired with request {id}");
                Pairing::Paired(id)
            }
            None => {
                warn!("PAIRING\t{key}: orphan response");
                self.violations.push(Violation::Orphan { key, request: None });
                Pairing::Orphan
            }
        }
    }

    /// Pair a response carrying the id of the request it answers
    pub fn on_response_for(&mut self, key: ConnectionKey, id: RequestId) -> Pairing {
        let queue = match self.pending.get_mut(&key) {
            Some(queue) => queue,
            None => return self.orphan(key, id),
        };
        let position = match queue.iter().position(|pending| *pending == id) {
            Some(position) => position,
            None => return self.orphan(key, id),
        };

        let pairing = if position == 0 {
            queue.pop_front();
            Pairing::Paired(id)
        } else {
            let expected = queue[0];
            queue.remove(position);
            warn!("PAIRING\t{key}: response to {id} overtook request {expected}");
            self.violations.push(Violation::OutOfOrder {
                key,
                expected,
                received: id,
            });
            Pairing::OutOfOrder {
                expected,
                received: id,
            }
        };
        self.drop_empty(key);
        pairing
    }

    /// Discard every request pending on the connection (all its streams),
    /// recording one eviction when there was any
    pub fn on_connection_closed(&mut self, connection: u64) -> Vec<RequestId> {
        let keys: Vec<ConnectionKey> = self
            .pending
            .keys()
            .filter(|key| key.connection == connection)
            .copied()
            .collect();
        let requests: Vec<RequestId> = keys
            .iter()
            .filter_map(|key| self.pending.remove(key))
            .flatten()
            .collect();

        if !requests.is_empty() {
            debug!(
                "PAIRING\tconnection {connection} closed with {} pending requests",
                requests.len()
            );
            self.evictions.push(Eviction {
                connection,
                requests: requests.clone(),
            });
        }
        requests
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn evictions(&self) -> &[Eviction] {
        &self.evictions
    }

    /// number of requests evicted so far
    pub fn evicted_requests(&self) -> usize {
        self.evictions.iter().map(|e| e.requests.len()).sum()
    }

    pub fn outstanding(&self, key: ConnectionKey) -> usize {
        self.pending.get(&key).map_or(0, VecDeque::len)
    }

    /// outstanding requests over all streams of a connection
    pub fn outstanding_on(&self, connection: u64) -> usize {
        self.pending
            .iter()
            .filter(|(key, _)| key.connection == connection)
            .map(|(_, queue)| queue.len())
            .sum()
    }

    /// forget violations and evictions, keeping pending requests
    pub fn clear_records(&mut self) {
        self.violations.clear();
        self.evictions.clear();
    }

    fn orphan(&mut self, key: ConnectionKey, id: RequestId) -> Pairing {
        warn!("PAIRING\t{key}: response for unknown request {id}");
        self.violations.push(Violation::Orphan {
            key,
            request: Some(id),
        });
        Pairing::Orphan
    }

    fn drop_empty(&mut self, key: ConnectionKey) {
        if self.pending.get(&key).map_or(false, VecDeque::is_empty) {
            self.pending.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_pairing() {
        let mut tracker = PairingTracker::new();
        let key = ConnectionKey::connection(1);
        for id in 1..=3 {
            tracker.on_request_sent(key, id);
        }
        assert_eq!(tracker.outstanding(key), 3);
        assert_eq!(tracker.on_response_received(key), Pairing::Paired(1));
        assert_eq!(tracker.on_response_received(key), Pairing::Paired(2));
        assert_eq!(tracker.on_response_received(key), Pairing::Paired(3));
        assert_eq!(tracker.outstanding(key), 0);
        assert!(tracker.violations().is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let mut tracker = PairingTracker::new();
        tracker.on_request_sent(ConnectionKey::connection(1), 1);
        tracker.on_request_sent(ConnectionKey::connection(2), 2);
        assert_eq!(
            tracker.on_response_received(ConnectionKey::connection(2)),
            Pairing::Paired(2)
        );
        assert_eq!(
            tracker.on_response_received(ConnectionKey::connection(1)),
            Pairing::Paired(1)
        );
    }

    #[test]
    fn orphan_response() {
        let mut tracker = PairingTracker::new();
        let key = ConnectionKey::connection(7);
        assert_eq!(tracker.on_response_received(key), Pairing::Orphan);
        assert_eq!(
            tracker.violations(),
            &[Violation::Orphan { key, request: None }]
        );

        tracker.on_request_sent(key, 1);
        assert_eq!(tracker.on_response_for(key, 9), Pairing::Orphan);
        assert_eq!(tracker.outstanding(key), 1);
        assert_eq!(tracker.violations().len(), 2);
    }

    #[test]
    fn out_of_order_is_recorded() {
        let mut tracker = PairingTracker::new();
        let key = ConnectionKey::connection(1);
        tracker.on_request_sent(key, 1);
        tracker.on_request_sent(key, 2);

        assert_eq!(
            tracker.on_response_for(key, 2),
            Pairing::OutOfOrder {
                expected: 1,
                received: 2
            }
        );
        assert_eq!(tracker.on_response_for(key, 1), Pairing::Paired(1));
        assert_eq!(
            tracker.violations(),
            &[Violation::OutOfOrder {
                key,
                expected: 1,
                received: 2
            }]
        );
    }

    #[test]
    fn close_evicts_every_stream() {
        let mut tracker = PairingTracker::new();
        tracker.on_request_sent(ConnectionKey::stream(1, 1), 10);
        tracker.on_request_sent(ConnectionKey::stream(1, 3), 11);
        tracker.on_request_sent(ConnectionKey::connection(2), 12);

        let mut evicted = tracker.on_connection_closed(1);
        evicted.sort_unstable();
        assert_eq!(evicted, vec![10, 11]);
        assert_eq!(tracker.outstanding_on(1), 0);
        assert_eq!(tracker.outstanding_on(2), 1);
        assert_eq!(tracker.evictions().len(), 1);
        assert_eq!(tracker.evicted_requests(), 2);
        assert!(tracker.violations().is_empty());

        assert!(tracker.on_connection_closed(1).is_empty());
        assert_eq!(tracker.evictions().len(), 1);
    }
}
