use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};

const FRAME_CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The kind of a frame, stored in its first byte. The wire values are part of the protocol and
///  must never change.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum FrameKind {
    /// a fragment of the message in the current window, descriptor is the fragment index
    Data = 0,
    /// cumulative ack: all fragments *below* the descriptor were received
    Ack = 1,
    /// sender requests a window of `descriptor` fragments
    SizeNegotiate = 2,
    /// receiver confirms the window size, echoing it in the descriptor
    SizeNegotiateAck = 3,
    /// sender has all fragments acknowledged and asks the receiver to deliver the message
    CommitFlush = 4,
    /// receiver delivered the message and cleared its window
    CommitFlushAck = 5,
}

/// A single frame, which is the payload of exactly one UDP datagram:
///
/// ```ascii
/// 0: kind (u8)
/// 1: descriptor (u32 BE) - fragment index, window length or terminal marker depending on kind
/// 5: payload (Data frames only, at least one byte)
/// *: CRC-32 of all preceding bytes (u32 BE)
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub descriptor: u32,
    /// empty for everything except [FrameKind::Data]
    pub payload: Bytes,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FrameKind::Data => write!(f, "Data(#{}, {} bytes)", self.descriptor, self.payload.len()),
            kind => write!(f, "{:?}({})", kind, self.descriptor),
        }
    }
}

impl Frame {
    pub const HEADER_LEN: usize = size_of::<u8>() + size_of::<u32>();
    pub const CHECKSUM_LEN: usize = size_of::<u32>();
    /// the length of a frame without payload, which is also the minimum length of a datagram
    ///  that can be a valid frame
    pub const CONTROL_FRAME_LEN: usize = Self::HEADER_LEN + Self::CHECKSUM_LEN;

    pub fn data(descriptor: u32, payload: Bytes) -> Frame {
        Frame {
            kind: FrameKind::Data,
            descriptor,
            payload,
        }
    }

    pub fn control(kind: FrameKind, descriptor: u32) -> Frame {
        debug_assert!(kind != FrameKind::Data, "data frames require a payload");
        Frame {
            kind,
            descriptor,
            payload: Bytes::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::CONTROL_FRAME_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(self.kind.into());
        buf.put_u32(self.descriptor);
        buf.put_slice(&self.payload);

        let checksum = FRAME_CHECKSUM.checksum(&buf[start..]);
        buf.put_u32(checksum);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a complete datagram. Every failure means the datagram is transport noise and must
    ///  be dropped; in particular, nothing in a datagram with a checksum mismatch is ever looked at.
    pub fn deser(datagram: &[u8]) -> anyhow::Result<Frame> {
        if datagram.len() < Self::CONTROL_FRAME_LEN {
            bail!("datagram of length {} is too short for a frame", datagram.len());
        }

        let (covered, mut checksum_buf) = datagram.split_at(datagram.len() - Self::CHECKSUM_LEN);
        let expected_checksum = checksum_buf.get_u32();
        let actual_checksum = FRAME_CHECKSUM.checksum(covered);
        if actual_checksum != expected_checksum {
            bail!("checksum mismatch: expected {:08x}, was {:08x}", expected_checksum, actual_checksum);
        }

        let mut buf = covered;
        let raw_kind = buf.get_u8();
        let kind = match FrameKind::try_from(raw_kind) {
            Ok(kind) => kind,
            Err(_) => bail!("unknown frame kind {}", raw_kind),
        };
        let descriptor = buf.get_u32();

        match kind {
            FrameKind::Data => {
                if buf.is_empty() {
                    bail!("data frame #{} without payload", descriptor);
                }
            }
            _ => {
                if !buf.is_empty() {
                    bail!("{:?} frame with {} bytes of unexpected payload", kind, buf.len());
                }
            }
        }

        Ok(Frame {
            kind,
            descriptor,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn with_checksum(raw: &[u8]) -> Vec<u8> {
        let mut result = raw.to_vec();
        result.extend_from_slice(&FRAME_CHECKSUM.checksum(raw).to_be_bytes());
        result
    }

    #[test]
    fn test_checksum_is_standard_crc32() {
        assert_eq!(FRAME_CHECKSUM.checksum(b"123456789"), 0xcbf4_3926);
    }

    #[rstest]
    #[case::data(Frame::data(3, Bytes::from_static(b"abc")), vec![0, 0,0,0,3, 97,98,99])]
    #[case::data_big_descriptor(Frame::data(0x0102_0304, Bytes::from_static(&[9])), vec![0, 1,2,3,4, 9])]
    #[case::ack(Frame::control(FrameKind::Ack, 7), vec![1, 0,0,0,7])]
    #[case::size_negotiate(Frame::control(FrameKind::SizeNegotiate, 300), vec![2, 0,0,1,44])]
    #[case::size_negotiate_ack(Frame::control(FrameKind::SizeNegotiateAck, 300), vec![3, 0,0,1,44])]
    #[case::commit_flush(Frame::control(FrameKind::CommitFlush, 5), vec![4, 0,0,0,5])]
    #[case::commit_flush_ack(Frame::control(FrameKind::CommitFlushAck, u32::MAX), vec![5, 255,255,255,255])]
    fn test_ser(#[case] frame: Frame, #[case] expected_without_checksum: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        assert_eq!(buf.as_ref(), with_checksum(&expected_without_checksum).as_slice());
        assert_eq!(buf.len(), frame.serialized_len());
        assert_eq!(frame.to_bytes().as_ref(), buf.as_ref());

        let deser = Frame::deser(&buf).unwrap();
        assert_eq!(deser, frame);
    }

    #[test]
    fn test_ser_appends_to_existing_buffer() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[99, 98]);
        Frame::control(FrameKind::Ack, 1).ser(&mut buf);

        assert_eq!(&buf[..2], &[99, 98]);
        assert_eq!(Frame::deser(&buf[2..]).unwrap(), Frame::control(FrameKind::Ack, 1));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_byte(vec![1])]
    #[case::just_too_short(vec![1, 0,0,0, 0,0,0,0])]
    #[case::unknown_kind(with_checksum(&[6, 0,0,0,1]))]
    #[case::unknown_kind_max(with_checksum(&[255, 0,0,0,1]))]
    #[case::data_without_payload(with_checksum(&[0, 0,0,0,1]))]
    #[case::control_with_payload(with_checksum(&[1, 0,0,0,1, 5]))]
    #[case::checksum_zeroed(vec![1, 0,0,0,7, 0,0,0,0])]
    fn test_deser_malformed(#[case] datagram: Vec<u8>) {
        assert!(Frame::deser(&datagram).is_err());
    }

    #[rstest]
    #[case::control(Frame::control(FrameKind::SizeNegotiate, 12))]
    #[case::data(Frame::data(2, Bytes::from_static(b"Hello world!!!")))]
    fn test_single_byte_corruption_is_detected(#[case] frame: Frame) {
        let encoded = frame.to_bytes();

        for pos in 0..encoded.len() {
            for mask in [0x01u8, 0x80, 0xff] {
                let mut corrupted = encoded.to_vec();
                corrupted[pos] ^= mask;
                assert!(Frame::deser(&corrupted).is_err(), "corruption at {} with mask {:02x} went undetected", pos, mask);
            }
        }
    }

    #[test]
    fn test_truncation_is_detected() {
        let encoded = Frame::data(0, Bytes::from_static(b"some payload")).to_bytes();
        for len in 0..encoded.len() {
            assert!(Frame::deser(&encoded[..len]).is_err());
        }
    }

    #[rstest]
    #[case(0, FrameKind::Data)]
    #[case(1, FrameKind::Ack)]
    #[case(2, FrameKind::SizeNegotiate)]
    #[case(3, FrameKind::SizeNegotiateAck)]
    #[case(4, FrameKind::CommitFlush)]
    #[case(5, FrameKind::CommitFlushAck)]
    fn test_kind_wire_values(#[case] raw: u8, #[case] kind: FrameKind) {
        assert_eq!(u8::from(kind), raw);
        assert_eq!(FrameKind::try_from(raw).unwrap(), kind);
    }
}
