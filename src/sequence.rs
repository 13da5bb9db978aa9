use std::fmt::{Display, Formatter};

use uuid::Uuid;

/// Position of a message in its sequence. Numbering starts at 1; `ZERO` is the
///  terminal number of a sequence that was closed while still empty.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u64);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);
    pub const ONE: SequenceNumber = SequenceNumber(1);

    /// Upper bound for message numbers. Sequence numbers never wrap - assigning
    ///  a number beyond this bound is a message-number rollover fault.
    pub const MAX: SequenceNumber = SequenceNumber(i64::MAX as u64);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

/// Connection-scoped identifier of a sequence. Opaque to the engine; it tags
///  every fault and every acknowledgement exchanged for the sequence.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceId(Uuid);

impl SequenceId {
    pub fn new_random() -> SequenceId {
        SequenceId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> SequenceId {
        SequenceId(uuid)
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}
