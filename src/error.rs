/// Failure of a single bus primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Bus transfer failed: {0}")]
    Transfer(String),
    #[error("Bus interface busy")]
    Busy,
    #[error("Bus transfer timed out")]
    Timeout,
    #[error("Receive buffer size mismatch - expected={expected} received={received}")]
    Length { expected: usize, received: usize },
}

/// Reason a state request was rejected at the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("String {0} does not exist")]
    IllegalString(usize),
    #[error("Driver already initialized")]
    AlreadyInitialized,
    #[error("Driver not initialized")]
    NotInitialized,
    #[error("Another request is pending")]
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot open config file {path:?}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Cannot read config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failure classes of the acquisition.
///
/// Only request failures surface to callers; the others are reported to the
/// diagnostic reporter and resolved by restarting the measurement cycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport failure: {0}")]
    Transport(#[from] BusError),
    #[error("PEC mismatch on string {string} device {device}")]
    Integrity { string: usize, device: usize },
    #[error("Bridged peripheral did not acknowledge on string {string} device {device}")]
    BridgeAck { string: usize, device: usize },
    #[error("Value out of range")]
    Range,
    #[error("Request rejected: {0}")]
    Request(#[from] RequestError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
