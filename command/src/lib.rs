//! Configuration and logging shared by the tandem crates.
//!
//! The engine itself lives in `tandem-lib`; this crate only holds what every
//! scenario needs before the first socket is opened: where to log, how long
//! to wait, and where the client and the origin server live.

#[macro_use]
pub mod logging;
pub mod config;
