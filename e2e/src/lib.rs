//! End to end scenarios: the orchestrator drives a client and an origin
//! around [`mock::relay`], a threaded TCP relay standing in for the
//! intermediary under test.

pub mod mock;
#[cfg(test)]
mod tests;

pub const BUFFER_SIZE: usize = 4096;
