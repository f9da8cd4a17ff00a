pub mod hyper_client;
pub mod relay;
