use thiserror::Error;

/// Errors raised by an upstream pub/sub transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Unsubscribe error: {0}")]
    Unsubscribe(String),

    #[error("Dispose error: {0}")]
    Dispose(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<redis::RedisError> for TransportError {
    fn from(err: redis::RedisError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Relay error taxonomy.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Subscribe attempts exhausted for the topic.
    #[error("Failed to subscribe to {topic} after {attempts} attempt(s): {source}")]
    SubscribeFailure {
        topic: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// Asynchronous error on an already-active subscription.
    #[error("Transport runtime error: {0}")]
    TransportRuntime(TransportError),

    /// Client or subscription teardown failed.
    #[error("Disposal error: {0}")]
    Disposal(TransportError),

    /// Send failure or abrupt close on a viewer channel.
    #[error("Viewer channel error for {viewer_id}: {reason}")]
    ViewerChannel { viewer_id: String, reason: String },

    /// The coordinator loop has stopped and no longer accepts events.
    #[error("Relay coordinator is not running")]
    CoordinatorStopped,
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_failure_message() {
        let err = RelayError::SubscribeFailure {
            topic: "sensors/test".to_string(),
            attempts: 3,
            source: TransportError::Subscribe("refused".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("sensors/test"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("refused"));
    }
}
