use std::fmt::{Display, Formatter};

use crate::fault::WsrmFault;

/// Local failure surface of the engine.
///
/// Protocol faults and communication faults carry the originating
///  [`WsrmFault`]; timeouts are a distinct, usually recoverable signal and are
///  never conflated with faults.
#[derive(Debug)]
pub enum TransferError {
    /// A protocol violation (sender-classified fault). Not retryable; the
    ///  connection terminates.
    Protocol(WsrmFault),

    /// A communication breakdown (receiver-classified fault), e.g. an
    ///  unresponsive peer. Possibly transient at a higher layer.
    Communication(WsrmFault),

    /// A blocking operation did not complete within its timeout. Recoverable
    ///  unless the operation was terminal - the caller decides.
    Timeout { operation: &'static str },

    /// The connection was aborted.
    Aborted,

    /// The operation is unavailable because the sequence is already closed.
    Closed,

    /// An unexpected internal or transport failure. Never a protocol fault.
    Internal(anyhow::Error),
}

impl TransferError {
    /// The fault behind this error, if it is fault-induced
    pub fn fault(&self) -> Option<&WsrmFault> {
        match self {
            TransferError::Protocol(fault) | TransferError::Communication(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout { .. })
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Protocol(fault) => write!(f, "protocol fault: {}", fault),
            TransferError::Communication(fault) => write!(f, "communication fault: {}", fault),
            TransferError::Timeout { operation } => write!(f, "timeout during {}", operation),
            TransferError::Aborted => write!(f, "the connection was aborted"),
            TransferError::Closed => write!(f, "the sequence is closed"),
            TransferError::Internal(error) => write!(f, "internal error: {:#}", error),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Internal(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}
