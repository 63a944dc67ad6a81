use std::time::Duration;

use crate::message::frame_decoder::DecodeError;

/// Why a session attempt ended.
///
/// Every variant is recoverable: the session goes through `Failed` back to
/// `Discovering` and the failure is counted towards a radio reset.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no device advertising a name containing {name:?} found within {timeout:?}")]
    DiscoveryTimeout { name: String, timeout: Duration },
    #[error("scan failed: {0:#}")]
    DiscoveryFailure(anyhow::Error),
    #[error("connect failed: {0:#}")]
    ConnectFailure(anyhow::Error),
    #[error("subscribe failed: {0:#}")]
    SubscribeFailure(anyhow::Error),
    #[error("poll write failed: {0:#}")]
    WriteFailure(anyhow::Error),
    #[error("decode failed: {0}")]
    DecodeFailure(#[from] DecodeError),
    #[error("no complete frame within {0:?}")]
    ResponseTimeout(Duration),
}

impl LinkError {
    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DiscoveryTimeout { .. } => "discovery_timeout",
            Self::DiscoveryFailure(_) => "discovery_failure",
            Self::ConnectFailure(_) => "connect_failure",
            Self::SubscribeFailure(_) => "subscribe_failure",
            Self::WriteFailure(_) => "write_failure",
            Self::DecodeFailure(_) => "decode_failure",
            Self::ResponseTimeout(_) => "response_timeout",
        }
    }
}
