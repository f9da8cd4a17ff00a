//! # tandem: drive both sides of the traffic around an HTTP intermediary
//!
//! This library plays the downstream client and the upstream origin server
//! around a system under test (a reverse proxy, a cache, a filter) with
//! byte-exact control over what goes on the wire, so that scenarios can
//! assert how the intermediary forwards, rewrites, caches or rejects traffic.
//!
//! ## Layers
//!
//! - the [`reactor::Reactor`] is a single-threaded loop over `mio`, it owns
//!   every [`endpoint::Endpoint`] (one socket each, plain TCP or TLS) and
//!   turns readiness into [`reactor::Notification`]s
//! - the [`message`] module models HTTP/1.x and HTTP/2 messages with an
//!   ordered header list, serializes them (valid or not) and parses them
//!   incrementally
//! - the [`pairing::PairingTracker`] associates responses with requests,
//!   strictly FIFO per connection
//! - a [`chain::Chain`] declares the expected exchanges, optionally rewritten
//!   by filters like the conditional cache one, and the
//!   [`expectation`] module compares them with what was observed
//! - the [`orchestrator::Orchestrator`] wires all of the above with the
//!   client and origin drivers and runs a scenario within a deadline
//!
//! ## A scenario
//!
//! ```no_run
//! use std::time::Duration;
//! use tandem_command_lib::config::Config;
//! use tandem_lib::{chain::{stock::Stock, Chain}, orchestrator::Orchestrator};
//!
//! let config = Config::default();
//! let mut orchestrator = Orchestrator::new(config.clone()).expect("could not create the reactor");
//! let server = orchestrator.add_server(config.server.clone());
//! let client = orchestrator.add_client(config.client.clone());
//! orchestrator.start().expect("could not start the services");
//!
//! let chain = Chain::from_steps(vec![Stock::transparent().base("GET", "/", true)]);
//! let report = orchestrator
//!     .run(&chain, Duration::from_secs(5))
//!     .expect("fatal error during the run");
//! assert!(report.is_success(), "{report}");
//! # let _ = (server, client);
//! ```

#[macro_use]
extern crate log;

pub use tandem_command_lib as tandem_command;

pub mod chain;
pub mod driver;
pub mod endpoint;
pub mod expectation;
pub mod message;
pub mod orchestrator;
pub mod pairing;
pub mod reactor;
pub mod ready;
pub mod socket;
pub mod tls;

pub use crate::ready::{Ready, Readiness};
