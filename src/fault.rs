use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use rustc_hash::FxHashMap;

use crate::config::ReliableMessagingVersion;
use crate::error::TransferError;
use crate::range_set::SequenceRangeSet;
use crate::sequence::{SequenceId, SequenceNumber};

pub const SUBCODE_SEQUENCE_TERMINATED: &str = "SequenceTerminated";
pub const SUBCODE_INVALID_ACKNOWLEDGEMENT: &str = "InvalidAcknowledgement";
pub const SUBCODE_UNKNOWN_SEQUENCE: &str = "UnknownSequence";
pub const SUBCODE_MESSAGE_NUMBER_ROLLOVER: &str = "MessageNumberRollover";
pub const SUBCODE_LAST_MESSAGE_NUMBER_EXCEEDED: &str = "LastMessageNumberExceeded";
pub const SUBCODE_SEQUENCE_CLOSED: &str = "SequenceClosed";
pub const SUBCODE_WSRM_REQUIRED: &str = "WsrmRequired";

/// SOAP fault classification. A `Sender` fault blames the message originator
///  for a protocol violation (not retryable); a `Receiver` fault blames the
///  recipient and may be transient.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum FaultCode {
    Sender,
    Receiver,
}

/// The closed set of fault conditions of the protocol, with their detail
///  payloads.
#[derive(Clone, PartialEq, Debug)]
pub enum WsrmFaultKind {
    SequenceTerminated,
    /// Detail: the offending acknowledgement ranges, echoed back to the peer
    InvalidAcknowledgement { ack: SequenceRangeSet },
    UnknownSequence,
    /// Detail: the maximum admissible message number
    MessageNumberRollover { max: SequenceNumber },
    LastMessageNumberExceeded,
    /// Only defined by the close-handshake dialect
    SequenceClosed,
    /// Only defined by the close-handshake dialect
    WsrmRequired,
}

/// A protocol fault: classification, stable subcode, human-readable reason,
///  the sequence it concerns and the detail payload.
///
/// Immutable once created; consumed by conversion to a [`TransferError`] or by
///  serialization at the wire boundary (XML rendering is external - this type
///  defines the subcode, namespace and action metadata the renderer needs).
#[derive(Clone, Debug)]
pub struct WsrmFault {
    code: FaultCode,
    kind: WsrmFaultKind,
    sequence_id: Option<SequenceId>,
    reason: String,
    is_remote: bool,
}

impl WsrmFault {
    /// The sequence ended abnormally: a protocol violation by the sender side
    pub fn sequence_terminated(sequence_id: SequenceId, reason: impl Into<String>) -> WsrmFault {
        WsrmFault {
            code: FaultCode::Sender,
            kind: WsrmFaultKind::SequenceTerminated,
            sequence_id: Some(sequence_id),
            reason: reason.into(),
            is_remote: false,
        }
    }

    /// The sequence ended abnormally because the peer stopped responding -
    ///  a communication breakdown, not a protocol violation
    pub fn sequence_terminated_communication(
        sequence_id: SequenceId,
        reason: impl Into<String>,
    ) -> WsrmFault {
        WsrmFault {
            code: FaultCode::Receiver,
            kind: WsrmFaultKind::SequenceTerminated,
            sequence_id: Some(sequence_id),
            reason: reason.into(),
            is_remote: false,
        }
    }

    pub fn invalid_acknowledgement(sequence_id: SequenceId, ack: SequenceRangeSet) -> WsrmFault {
        WsrmFault {
            code: FaultCode::Sender,
            reason: format!(
                "the acknowledgement {} references messages that were never transmitted",
                ack
            ),
            kind: WsrmFaultKind::InvalidAcknowledgement { ack },
            sequence_id: Some(sequence_id),
            is_remote: false,
        }
    }

    pub fn unknown_sequence(sequence_id: SequenceId) -> WsrmFault {
        WsrmFault {
            code: FaultCode::Sender,
            kind: WsrmFaultKind::UnknownSequence,
            sequence_id: Some(sequence_id),
            reason: "the sequence identifier is not known to this endpoint".to_string(),
            is_remote: false,
        }
    }

    pub fn message_number_rollover(sequence_id: SequenceId, max: SequenceNumber) -> WsrmFault {
        WsrmFault {
            code: FaultCode::Sender,
            reason: format!("the maximum message number {} would be exceeded", max),
            kind: WsrmFaultKind::MessageNumberRollover { max },
            sequence_id: Some(sequence_id),
            is_remote: false,
        }
    }

    pub fn last_message_number_exceeded(sequence_id: SequenceId) -> WsrmFault {
        WsrmFault {
            code: FaultCode::Sender,
            kind: WsrmFaultKind::LastMessageNumberExceeded,
            sequence_id: Some(sequence_id),
            reason: "a message number exceeds the number of the message marked as last".to_string(),
            is_remote: false,
        }
    }

    pub fn sequence_closed(sequence_id: SequenceId) -> WsrmFault {
        WsrmFault {
            code: FaultCode::Sender,
            kind: WsrmFaultKind::SequenceClosed,
            sequence_id: Some(sequence_id),
            reason: "the sequence is closed and cannot accept new messages".to_string(),
            is_remote: false,
        }
    }

    pub fn wsrm_required() -> WsrmFault {
        WsrmFault {
            code: FaultCode::Sender,
            kind: WsrmFaultKind::WsrmRequired,
            sequence_id: None,
            reason: "the endpoint requires reliable messaging headers on every message"
                .to_string(),
            is_remote: false,
        }
    }

    /// Reconstruct a fault transmitted by the peer. `None` if the subcode is
    ///  not part of the given dialect's vocabulary.
    pub fn from_wire_subcode(
        version: ReliableMessagingVersion,
        subcode: &str,
        sequence_id: Option<SequenceId>,
        peer_reason: impl Into<String>,
    ) -> Option<WsrmFault> {
        let entry = SUBCODES.get(subcode)?;
        if version == ReliableMessagingVersion::February2005 && entry.version11_only {
            return None;
        }
        Some(WsrmFault {
            code: entry.code,
            kind: (entry.make_kind)(),
            sequence_id,
            reason: peer_reason.into(),
            is_remote: true,
        })
    }

    pub fn code(&self) -> FaultCode {
        self.code
    }

    pub fn kind(&self) -> &WsrmFaultKind {
        &self.kind
    }

    pub fn sequence_id(&self) -> Option<SequenceId> {
        self.sequence_id
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn subcode(&self) -> &'static str {
        match self.kind {
            WsrmFaultKind::SequenceTerminated => SUBCODE_SEQUENCE_TERMINATED,
            WsrmFaultKind::InvalidAcknowledgement { .. } => SUBCODE_INVALID_ACKNOWLEDGEMENT,
            WsrmFaultKind::UnknownSequence => SUBCODE_UNKNOWN_SEQUENCE,
            WsrmFaultKind::MessageNumberRollover { .. } => SUBCODE_MESSAGE_NUMBER_ROLLOVER,
            WsrmFaultKind::LastMessageNumberExceeded => SUBCODE_LAST_MESSAGE_NUMBER_EXCEEDED,
            WsrmFaultKind::SequenceClosed => SUBCODE_SEQUENCE_CLOSED,
            WsrmFaultKind::WsrmRequired => SUBCODE_WSRM_REQUIRED,
        }
    }

    /// The reason shown to the application: a fault received from the wire
    ///  wraps the peer's stated reason, a locally raised fault uses its own.
    pub fn reason(&self) -> String {
        if self.is_remote {
            format!("the remote endpoint reported: {}", self.reason)
        } else {
            self.reason.clone()
        }
    }

    /// Convert into the local exception surface: sender faults are protocol
    ///  errors, receiver faults are communication errors.
    pub fn into_error(self) -> TransferError {
        match self.code {
            FaultCode::Sender => TransferError::Protocol(self),
            FaultCode::Receiver => TransferError::Communication(self),
        }
    }
}

impl Display for WsrmFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fault", self.subcode())?;
        if let Some(id) = &self.sequence_id {
            write!(f, " on sequence {}", id)?;
        }
        write!(f, ": {}", self.reason())
    }
}

/// How a dialect carries fault information in the envelope
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultEncoding {
    /// Older dialect: a dedicated header with the detail fields inlined as
    ///  header children
    DedicatedHeader,
    /// Newer dialect: SOAP 1.2 fault with a namespaced subcode and a detail
    ///  element
    Soap12SubcodeDetail,
}

pub fn fault_encoding(version: ReliableMessagingVersion) -> FaultEncoding {
    match version {
        ReliableMessagingVersion::February2005 => FaultEncoding::DedicatedHeader,
        ReliableMessagingVersion::Version11 => FaultEncoding::Soap12SubcodeDetail,
    }
}

/// Namespace qualifying the fault subcode on the wire
pub fn subcode_namespace(version: ReliableMessagingVersion) -> &'static str {
    match version {
        ReliableMessagingVersion::February2005 => "http://schemas.xmlsoap.org/ws/2005/02/rm",
        ReliableMessagingVersion::Version11 => "http://docs.oasis-open.org/ws-rx/wsrm/200702",
    }
}

/// Addressing action carried by fault messages of the dialect
pub fn fault_action(version: ReliableMessagingVersion) -> &'static str {
    match version {
        ReliableMessagingVersion::February2005 => {
            "http://schemas.xmlsoap.org/ws/2004/08/addressing/fault"
        }
        ReliableMessagingVersion::Version11 => {
            "http://docs.oasis-open.org/ws-rx/wsrm/200702/fault"
        }
    }
}

struct SubcodeEntry {
    code: FaultCode,
    version11_only: bool,
    make_kind: fn() -> WsrmFaultKind,
}

/// Subcode vocabulary, built once. Detail payloads travel separately on the
///  wire, so reconstructed kinds start with empty details.
static SUBCODES: LazyLock<FxHashMap<&'static str, SubcodeEntry>> = LazyLock::new(|| {
    fn sequence_terminated() -> WsrmFaultKind {
        WsrmFaultKind::SequenceTerminated
    }
    fn invalid_acknowledgement() -> WsrmFaultKind {
        WsrmFaultKind::InvalidAcknowledgement {
            ack: SequenceRangeSet::new(),
        }
    }
    fn unknown_sequence() -> WsrmFaultKind {
        WsrmFaultKind::UnknownSequence
    }
    fn message_number_rollover() -> WsrmFaultKind {
        WsrmFaultKind::MessageNumberRollover {
            max: SequenceNumber::MAX,
        }
    }
    fn last_message_number_exceeded() -> WsrmFaultKind {
        WsrmFaultKind::LastMessageNumberExceeded
    }
    fn sequence_closed() -> WsrmFaultKind {
        WsrmFaultKind::SequenceClosed
    }
    fn wsrm_required() -> WsrmFaultKind {
        WsrmFaultKind::WsrmRequired
    }

    let mut table: FxHashMap<&'static str, SubcodeEntry> = FxHashMap::default();
    table.insert(
        SUBCODE_SEQUENCE_TERMINATED,
        SubcodeEntry { code: FaultCode::Sender, version11_only: false, make_kind: sequence_terminated },
    );
    table.insert(
        SUBCODE_INVALID_ACKNOWLEDGEMENT,
        SubcodeEntry { code: FaultCode::Sender, version11_only: false, make_kind: invalid_acknowledgement },
    );
    table.insert(
        SUBCODE_UNKNOWN_SEQUENCE,
        SubcodeEntry { code: FaultCode::Sender, version11_only: false, make_kind: unknown_sequence },
    );
    table.insert(
        SUBCODE_MESSAGE_NUMBER_ROLLOVER,
        SubcodeEntry { code: FaultCode::Sender, version11_only: false, make_kind: message_number_rollover },
    );
    table.insert(
        SUBCODE_LAST_MESSAGE_NUMBER_EXCEEDED,
        SubcodeEntry { code: FaultCode::Sender, version11_only: false, make_kind: last_message_number_exceeded },
    );
    table.insert(
        SUBCODE_SEQUENCE_CLOSED,
        SubcodeEntry { code: FaultCode::Sender, version11_only: true, make_kind: sequence_closed },
    );
    table.insert(
        SUBCODE_WSRM_REQUIRED,
        SubcodeEntry { code: FaultCode::Sender, version11_only: true, make_kind: wsrm_required },
    );
    table
});
