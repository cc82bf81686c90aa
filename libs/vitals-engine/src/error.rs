use vitals_api::{ErrorKind, TransportError};

/// Which half of the broker connection failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    Subscribe,
    Publisher,
}

impl std::fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectStage::Subscribe => f.write_str("subscribe"),
            ConnectStage::Publisher => f.write_str("publisher"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to connect ({stage}): {source}")]
    Connect {
        stage: ConnectStage,
        source: TransportError,
    },

    #[error("receive error: {0}")]
    Receive(TransportError),

    #[error("undecodable record at offset {offset:?}: {source}")]
    Decode {
        offset: Option<u64>,
        source: TransportError,
    },

    #[error("publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        source: TransportError,
    },

    #[error("flush of '{topic}' failed: {source}")]
    Flush {
        topic: String,
        source: TransportError,
    },
}

impl RelayError {
    /// Whether the relay loop must stop.
    ///
    /// Per-record failures (decode, publish, flush) are logged and the loop
    /// moves on. A closed handle or a revoked session ends the run, whichever
    /// side it happens on.
    pub fn is_fatal(&self) -> bool {
        match self {
            RelayError::Config(_) | RelayError::Connect { .. } => true,
            RelayError::Receive(source)
            | RelayError::Publish { source, .. }
            | RelayError::Flush { source, .. } => handle_lost(source),
            RelayError::Decode { .. } => false,
        }
    }
}

fn handle_lost(source: &TransportError) -> bool {
    matches!(source.kind(), ErrorKind::Closed | ErrorKind::Auth)
}
