use bytes::Bytes;

use crate::sequence::SequenceNumber;

/// An application message handed to the engine: an opaque payload plus the
///  sequence metadata the engine assigns and tracks.
///
/// The sequence number is assigned exactly once, by the transmission strategy
///  at admission, and is immutable afterwards.
#[derive(Clone, PartialEq, Debug)]
pub struct Message {
    payload: Bytes,
    sequence_number: Option<SequenceNumber>,
    last: bool,
}

impl Message {
    pub fn new(payload: Bytes) -> Message {
        Message {
            payload,
            sequence_number: None,
            last: false,
        }
    }

    /// An empty terminator for the dialect that closes a sequence with a
    ///  last-message sentinel
    pub fn last_marker() -> Message {
        Message {
            payload: Bytes::new(),
            sequence_number: None,
            last: true,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence_number
    }

    /// True for the message that terminates its sequence
    pub fn is_last(&self) -> bool {
        self.last
    }

    pub(crate) fn mark_last(&mut self) {
        self.last = true;
    }

    pub(crate) fn assign_sequence_number(&mut self, sequence_number: SequenceNumber) {
        assert!(
            self.sequence_number.is_none(),
            "sequence number is assigned exactly once"
        );
        self.sequence_number = Some(sequence_number);
    }
}

/// Snapshot handed to the transport for one (re)send of a window entry.
/// Produced each time the strategy selects a message for transmission; it
///  never outlives the window entry it was taken from.
#[derive(Clone, Debug)]
pub struct AttemptInfo {
    pub message: Message,

    pub sequence_number: SequenceNumber,

    /// How many times the message has been handed to the transport, counting
    ///  this selection. 0 on the snapshot returned by admission, before the
    ///  first transmission.
    pub attempt: u32,
}
