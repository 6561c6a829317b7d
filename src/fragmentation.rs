//! Splitting a [Message] into the Data frames of one window, and putting it back together.
//!
//! The byte stream that is split is the message's sequence id (u32 BE) followed by its payload.
//!  Since the sequence id is always there, the stream is never empty, and every message has at
//!  least one fragment - an empty payload is transferred as a single fragment holding just the
//!  sequence id.
//!
//! The fragment index is the Data frame's descriptor. The receiver sizes its window and advances
//!  its cursor based on this index, so it is never reordered or renumbered after fragmentation.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::frame::{Frame, FrameKind};
use crate::message::Message;

const SEQUENCE_ID_LEN: usize = size_of::<u32>();

/// The number of fragments `fragment()` produces for a message, without actually splitting it
pub fn num_fragments(payload_len: usize, max_payload_len: usize) -> usize {
    (SEQUENCE_ID_LEN + payload_len).div_ceil(max_payload_len)
}

pub fn fragment(message: &Message, max_payload_len: usize) -> anyhow::Result<Vec<Frame>> {
    if max_payload_len == 0 {
        bail!("maximum payload length per frame must be at least 1");
    }

    let num_fragments = num_fragments(message.payload.len(), max_payload_len);
    if u32::try_from(num_fragments).is_err() {
        bail!("message of {} bytes exceeds the maximum number of fragments", message.payload.len());
    }

    let mut stream = BytesMut::with_capacity(SEQUENCE_ID_LEN + message.payload.len());
    stream.put_u32(message.sequence_id);
    stream.put_slice(&message.payload);
    let mut stream = stream.freeze();

    let mut frames = Vec::with_capacity(num_fragments);
    let mut descriptor = 0u32;
    while !stream.is_empty() {
        let chunk_len = stream.len().min(max_payload_len);
        frames.push(Frame::data(descriptor, stream.split_to(chunk_len)));
        descriptor = descriptor.wrapping_add(1);
    }

    debug_assert_eq!(frames.len(), num_fragments);
    Ok(frames)
}

/// Puts a message back together from its complete set of fragments, in any order.
///
/// This requires exactly one Data frame for every descriptor in `0..frames.len()`. Missing or
///  duplicate fragments are a bug in the caller's bookkeeping, not transport noise.
pub fn reassemble<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> anyhow::Result<Message> {
    let mut frames = frames.into_iter().collect::<Vec<_>>();
    if frames.is_empty() {
        bail!("incomplete reassembly: no fragments");
    }

    frames.sort_by_key(|frame| frame.descriptor);

    let mut stream = BytesMut::new();
    for (expected_descriptor, frame) in frames.iter().enumerate() {
        if frame.kind != FrameKind::Data {
            bail!("incomplete reassembly: {:?} is not a data frame", frame);
        }
        if frame.descriptor as usize != expected_descriptor {
            bail!("incomplete reassembly: expected fragment #{}, found #{}", expected_descriptor, frame.descriptor);
        }
        stream.put_slice(&frame.payload);
    }

    if stream.len() < SEQUENCE_ID_LEN {
        bail!("incomplete reassembly: {} bytes are too short for a message", stream.len());
    }

    let mut stream = stream.freeze();
    let sequence_id = stream.get_u32();
    Ok(Message {
        sequence_id,
        payload: stream,
    })
}

/// Reassembles a receiver's window, where every slot must be filled
pub fn reassemble_slots(slots: &[Option<Frame>]) -> anyhow::Result<Message> {
    if let Some(missing) = slots.iter().position(Option::is_none) {
        bail!("incomplete reassembly: fragment #{} of {} is missing", missing, slots.len());
    }
    reassemble(slots.iter().flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hello_world() -> Message {
        Message::new(69, Bytes::from_static(b"Hello world!!!"))
    }

    #[test]
    fn test_fragment_hello_world() {
        let frames = fragment(&hello_world(), 8).unwrap();

        assert_eq!(frames, vec![
            Frame::data(0, Bytes::from_static(&[0, 0, 0, 69, b'H', b'e', b'l', b'l'])),
            Frame::data(1, Bytes::from_static(b"o world!")),
            Frame::data(2, Bytes::from_static(b"!!")),
        ]);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::rotated(vec![1, 2, 0])]
    #[case::swapped(vec![0, 2, 1])]
    #[case::first_last(vec![2, 0, 1])]
    #[case::middle_first(vec![1, 0, 2])]
    fn test_reassemble_hello_world_any_order(#[case] order: Vec<usize>) {
        let frames = fragment(&hello_world(), 8).unwrap();
        let shuffled = order.iter()
            .map(|&i| frames[i].clone())
            .collect::<Vec<_>>();

        let message = reassemble(&shuffled).unwrap();
        assert_eq!(message.sequence_id, 69);
        assert_eq!(message.payload.as_ref(), b"Hello world!!!");
    }

    #[rstest]
    #[case::empty_payload(0, 1, 1)]
    #[case::empty_payload_big_frames(0, 1000, 1)]
    #[case::empty_payload_tiny_frames(0, 3, 2)]
    #[case::single_byte_frames(5, 1, 9)]
    #[case::exact_fit(4, 8, 1)]
    #[case::one_over(5, 8, 2)]
    #[case::many(10_000, 1400, 8)]
    fn test_num_fragments(#[case] payload_len: usize, #[case] max_payload_len: usize, #[case] expected: usize) {
        assert_eq!(num_fragments(payload_len, max_payload_len), expected);

        let message = Message::new(1, vec![7u8; payload_len]);
        let frames = fragment(&message, max_payload_len).unwrap();
        assert_eq!(frames.len(), expected);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.kind, FrameKind::Data);
            assert_eq!(frame.descriptor as usize, i);
            assert!(!frame.payload.is_empty());
            assert!(frame.payload.len() <= max_payload_len);
        }
    }

    #[rstest]
    #[case(0, 1)]
    #[case(0, 4)]
    #[case(1, 1)]
    #[case(1, 2)]
    #[case(17, 3)]
    #[case(100, 7)]
    #[case(100, 104)]
    #[case(5000, 1472)]
    fn test_reassemble_reverses_fragment(#[case] payload_len: usize, #[case] max_payload_len: usize) {
        let payload = (0..payload_len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let original = Message::new(0xdead_beef, payload);

        let mut frames = fragment(&original, max_payload_len).unwrap();
        frames.reverse();

        assert_eq!(reassemble(&frames).unwrap(), original);
    }

    #[test]
    fn test_fragment_zero_payload_len() {
        assert!(fragment(&hello_world(), 0).is_err());
    }

    #[test]
    fn test_reassemble_empty() {
        assert!(reassemble(&Vec::<Frame>::new()).is_err());
        assert!(reassemble_slots(&[]).is_err());
    }

    #[rstest]
    #[case::gap(vec![0, 2])]
    #[case::missing_first(vec![1, 2])]
    #[case::duplicate(vec![0, 1, 1])]
    fn test_reassemble_incomplete(#[case] descriptors: Vec<usize>) {
        let frames = fragment(&hello_world(), 8).unwrap();
        let selected = descriptors.iter()
            .map(|&i| frames[i].clone())
            .collect::<Vec<_>>();

        assert!(reassemble(&selected).is_err());
    }

    #[test]
    fn test_reassemble_control_frame() {
        let frames = vec![
            Frame::data(0, Bytes::from_static(&[0, 0, 0, 1])),
            Frame::control(FrameKind::Ack, 1),
        ];
        assert!(reassemble(&frames).is_err());
    }

    #[test]
    fn test_reassemble_too_short() {
        let frames = vec![Frame::data(0, Bytes::from_static(&[0, 0, 1]))];
        assert!(reassemble(&frames).is_err());
    }

    #[test]
    fn test_reassemble_slots() {
        let mut slots = fragment(&hello_world(), 8).unwrap()
            .into_iter()
            .map(Some)
            .collect::<Vec<_>>();
        assert_eq!(reassemble_slots(&slots).unwrap(), hello_world());

        slots[1] = None;
        assert!(reassemble_slots(&slots).is_err());
    }
}
