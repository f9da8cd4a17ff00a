//! tandem logs
//!
//! Like the proxy it is meant to test, the harness carries its own small
//! logging stack instead of a tracing subscriber: a [`Logger`] plugged into
//! the `log` facade, filtered by env-logger style directives and writing to
//! stdout, stderr or a file.
//!
//! Every scenario run shares the same global logger, so installing it twice
//! is tolerated by [`setup_default_logging`].

#[macro_use]
pub mod logs;

pub use crate::logging::logs::*;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("invalid log target {0}: {1}")]
    InvalidLogTarget(String, &'static str),
    #[error("invalid log directive {0}: {1}")]
    InvalidDirective(String, &'static str),
    #[error("could not open log file {0}: {1}")]
    OpenFile(String, std::io::Error),
    #[error("a global logger was already installed")]
    AlreadyInstalled,
}
