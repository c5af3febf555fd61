use fcc_core::{Port, ValueError};
use thiserror::Error;

/// A malformed push notification or reply. The offending message is dropped
/// and the mirrored state is left as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("{notification}: {source}")]
    Malformed {
        notification: &'static str,
        source: ValueError,
    },
    #[error("{notification}: unknown port {port}")]
    UnknownPort {
        notification: &'static str,
        port: Port,
    },
    #[error("{notification}: no device attached on port {port}")]
    NoDevice {
        notification: &'static str,
        port: Port,
    },
    #[error("{notification}: {group} index {index} out of range (have {len})")]
    IndexOutOfRange {
        notification: &'static str,
        group: &'static str,
        index: usize,
        len: usize,
    },
    #[error("{notification}: unknown script {name}")]
    UnknownScript {
        notification: &'static str,
        name: String,
    },
    #[error("reply to {method}: {source}")]
    BadReply { method: String, source: ValueError },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("channel failure: {0}")]
    ChannelFailure(String),
    #[error("not connected")]
    NotConnected,
    #[error("unknown port {0}")]
    UnknownPort(Port),
    #[error("no device attached on port {0}")]
    NoDevice(Port),
    #[error("action unavailable: {0}")]
    ActionUnavailable(String),
}

impl SyncError {
    /// Channel failures tear the connection down; everything else is local.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, SyncError::ChannelFailure(_))
    }
}
