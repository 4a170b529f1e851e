use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::event_bus::BusError;
use crate::event_registry::RegistryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
