use std::fmt::{Debug, Formatter};
use bytes::Bytes;

/// An application-level message: the unit that is queued on the sender side, transferred in a
///  window of its own, and delivered as a whole on the receiver side.
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    /// assigned by the application, opaque to the protocol
    pub sequence_id: u32,
    pub payload: Bytes,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message(seq {}, {} bytes)", self.sequence_id, self.payload.len())
    }
}

impl Message {
    pub fn new(sequence_id: u32, payload: impl Into<Bytes>) -> Message {
        Message {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// A message with the default sequence id 0
    pub fn from_payload(payload: impl Into<Bytes>) -> Message {
        Self::new(0, payload)
    }
}
