use thiserror::Error;

#[derive(Error, Debug)]
pub enum LagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported Kafka version: {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Assignment decode error: {0}")]
    Decode(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("HTTP server error: {0}")]
    Http(String),

    #[error("Offset fetch failed for group '{group}' on {topic}/{partition}: {source}")]
    PartitionOffsets {
        group: String,
        topic: String,
        partition: i32,
        #[source]
        source: Box<LagError>,
    },
}

pub type Result<T> = std::result::Result<T, LagError>;

impl From<tokio::task::JoinError> for LagError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

impl From<reqwest::Error> for LagError {
    fn from(e: reqwest::Error) -> Self {
        Self::Delivery(e.to_string())
    }
}

/// Run a broker call under `timeout`, mapping expiry to [`LagError::Timeout`].
pub async fn with_timeout<T, F>(timeout: std::time::Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| LagError::Timeout(format!("{what} did not complete within {timeout:?}")))?
}
