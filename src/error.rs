use std::fmt;

use crate::network::ChannelError;
use crate::worker::BrokerLocatorError;

#[derive(Debug, Clone, PartialEq)]
pub enum DodoError {
    ChannelError(String),
    ConnectionError(String),
    ProtocolError(String),
    TaskError(String),
    ConfigurationError(String),
}

impl fmt::Display for DodoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DodoError::ChannelError(msg) => write!(f, "Channel error: {msg}"),
            DodoError::ConnectionError(msg) => write!(f, "Connection error: {msg}"),
            DodoError::ProtocolError(msg) => write!(f, "Protocol error: {msg}"),
            DodoError::TaskError(msg) => write!(f, "Task error: {msg}"),
            DodoError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for DodoError {}

impl From<ChannelError> for DodoError {
    fn from(err: ChannelError) -> Self {
        DodoError::ChannelError(err.to_string())
    }
}

impl From<BrokerLocatorError> for DodoError {
    fn from(err: BrokerLocatorError) -> Self {
        DodoError::ConnectionError(err.to_string())
    }
}

impl From<config::ConfigError> for DodoError {
    fn from(err: config::ConfigError) -> Self {
        DodoError::ConfigurationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DodoError>;
