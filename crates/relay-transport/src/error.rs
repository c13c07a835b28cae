use relay_common::DispatchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("no consumers for subject {0}")]
    NoConsumers(String),

    #[error("subscriber queue full")]
    Backpressure,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("codec error: {0}")]
    Encoding(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Backpressure => DispatchError::BackpressureExceeded,
            TransportError::Serialization(m) | TransportError::Encoding(m) => {
                DispatchError::Terminal(m)
            }
            TransportError::Config(m) => DispatchError::Terminal(m),
            other => DispatchError::Transient(other.to_string()),
        }
    }
}
