
use std::{net::SocketAddr, panic::RefUnwindSafe, time::Duration};

use tandem_command_lib::config::Config;
use tandem_lib::{
    driver::{ClientId, ServerId},
    orchestrator::Orchestrator,
};

use crate::mock::relay::{RelayHandle, RelayMode};

#[derive(PartialEq, Eq, Debug)]
pub enum State {
    Success,
    Fail,
}

/// Run `test` up to `times` times, stop at the first result other than
/// `expected`
pub fn repeat_until_error_or<F>(times: usize, expected: State, test: F) -> State
where
    F: Fn() -> State + RefUnwindSafe,
{
    for i in 1..=times {
        let state = match std::panic::catch_unwind(&test) {
            Ok(state) => state,
            Err(_) => State::Fail,
        };
        if state != expected {
            println!("------------------------------------------------------------------");
            println!("Test not successful after {i} iterations");
            return state;
        }
        println!("Test {i}/{times} successful");
    }
    println!("All {times} tests successful");
    expected
}

/// An origin, a relay in front of it and a client connected to the relay
pub struct RelayTest {
    pub orchestrator: Orchestrator,
    pub client: ClientId,
    pub server: ServerId,
    pub relay: RelayHandle,
}

pub fn local_config() -> Config {
    let mut config = Config::default();
    let any: SocketAddr = "127.0.0.1:0".parse().expect("valid address");
    config.server.address = any;
    config.client.address = any;
    config.chain_timeout = Duration::from_secs(2);
    config
}

pub fn setup_relay_test(name: &str, config: Config, mode: RelayMode) -> RelayTest {
    tandem_command_lib::setup_test_logger!();
    let mut orchestrator = Orchestrator::new(config.clone()).expect("could not create the reactor");
    let server = orchestrator.add_server(config.server.clone());
    orchestrator
        .start_server(server)
        .expect("could not start the origin");
    let origin = orchestrator
        .server_address(server)
        .expect("the origin was just added");

    let relay = RelayHandle::spawn_detached(format!("{name}_RELAY"), origin, mode);
    log::info!("{name}: origin on {origin}, relay on {}", relay.address);
    let mut client_config = config.client;
    client_config.address = relay.address;
    let client = orchestrator.add_client(client_config);
    orchestrator.start().expect("could not start the client");

    RelayTest {
        orchestrator,
        client,
        server,
        relay,
    }
}
