//! Send side of a reliable message sequence: this crate delivers an ordered
//!  stream of opaque application messages exactly once, in order, across an
//!  unreliable, possibly-reordering, possibly-duplicating transport.
//!
//! ## Design goals
//!
//! * The abstraction is sending *messages* (defined-length chunks of data),
//!   not a byte stream
//! * Exactly-once, in-order delivery as observed by the send side: the
//!   connection does not report completion until every message from 1 through
//!   the terminal number is covered by acknowledgements without gaps
//! * A bounded sliding transmission window: at most a configured number of
//!   sent-but-unacknowledged messages is held at a time, and admission of
//!   further messages suspends until acknowledgements free capacity
//!   * the peer can additionally advertise a receive quota that tightens the
//!     window
//! * Acknowledgements are *ranges* of sequence numbers, arriving cumulatively
//!   and possibly with gaps; application is idempotent, and an ack that
//!   shrinks versus an earlier one is tracked as an anomaly but tolerated
//! * Per-message retransmission timers seeded from an estimated round trip
//!   time, doubled on every expiry up to a cap; a message that exhausts its
//!   retry budget means the peer is unreachable and terminates the connection
//! * All transport writes of a connection are serialized through a
//!   single-entrant guard: whoever acquires it drains every due entry before
//!   releasing, so concurrent triggers (new admissions, ack arrivals, timer
//!   firings) never produce overlapping writes and never lose work
//! * Everything the engine does not own is injected at a trait seam: the
//!   transport-send primitive, the ack-request primitive and the owner's
//!   fault/exception callbacks
//!
//! This crate deliberately ends where serialization begins: connection
//!  establishment, message protection and the XML/SOAP representation of
//!  headers and faults are the owning channel's business. The engine assigns
//!  and tracks sequence metadata and defines the fault vocabulary (subcodes,
//!  namespaces, actions) that the wire layer renders.
//!
//! ## The two dialects
//!
//! Two wire dialects exist and differ in the close handshake:
//!
//! * *February2005*: the sequence ends with a dedicated last-message
//!   sentinel. Closing admits an (empty) message marked as last into the
//!   window; it is transmitted, retried and acknowledged like any other
//!   message, and the sequence is complete when acknowledgements cover
//!   everything through the sentinel's number.
//! * *Version11*: the sequence ends with an explicit close handshake. Closing
//!   records the terminal number without transmitting anything; if
//!   acknowledgements are still outstanding, the peer is asked for an
//!   immediate acknowledgement and the connection waits for the window to
//!   drain.
//!
//! Faults are carried differently as well: February2005 transmits them in a
//!  dedicated header with inlined detail fields, Version11 as a SOAP 1.2
//!  fault with a namespaced subcode and a detail element. The subcode
//!  vocabulary is closed: `SequenceTerminated`, `InvalidAcknowledgement`,
//!  `UnknownSequence`, `MessageNumberRollover`, `LastMessageNumberExceeded`,
//!  `SequenceClosed` and `WsrmRequired` (the last two exist only in
//!  Version11).
//!
//! ## Failure taxonomy
//!
//! * Admission timeouts (window full for too long) are retryable and never
//!   fault the connection - except for the terminating message, whose
//!   admission timeout means the sequence can never complete
//! * An acknowledgement referencing never-transmitted numbers is a protocol
//!   violation and terminates the connection
//! * A non-monotonic acknowledgement is logged and tracked but tolerated
//! * An exhausted retry budget is a communication fault (the peer is
//!   unreachable), not a protocol violation
//! * Unexpected transport or internal failures propagate through a separate
//!   exception callback and are never conflated with protocol faults

pub mod config;
pub mod error;
pub mod fault;
pub mod guard;
pub mod message;
pub mod output_connection;
pub mod range_set;
pub mod send_pipeline;
pub mod sequence;
pub mod transmission_strategy;
