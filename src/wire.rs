//! Wire format for shuffled particle records.
//!
//! A record travels as a fixed-length frame:
//!
//! ```text
//! [identifier bytes][0x00][payload bytes][zero-filled extra]
//! ```
//!
//! The terminator is mandatory; receivers rely on it to bound the
//! identifier, there is no separate length field on the wire. The whole
//! frame is capped at 255 bytes so single-byte length fields stay valid.
//!
//! Frames are carried inside a message with a fixed zerocopy header, the
//! same way RPC headers are encoded elsewhere in this stack.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constants::MAX_FRAME_LEN;

/// Fixed per-run record shape
///
/// All records in a run share one shape; it is established at init and
/// validated on every submission and every delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    /// Identifier length in bytes, 1..=254
    pub fname_len: u8,
    /// Payload length in bytes
    pub data_len: u8,
    /// Zero padding reserved per record for opaque per-rank metadata
    pub extra_len: u8,
}

impl FrameSpec {
    /// Total frame length: identifier + terminator + payload + padding
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.fname_len as usize + 1 + self.data_len as usize + self.extra_len as usize
    }

    /// Assemble a frame into a fixed stack buffer.
    ///
    /// Panics when the submitted lengths do not match the configured shape;
    /// a mismatch means the caller and the shuffler disagree about the
    /// record layout and nothing downstream can be trusted.
    pub fn encode(&self, fname: &[u8], data: &[u8]) -> FrameBuf {
        assert_eq!(
            fname.len(),
            self.fname_len as usize,
            "particle id length {} does not match configured fname_len {}",
            fname.len(),
            self.fname_len
        );
        assert_eq!(
            data.len(),
            self.data_len as usize,
            "particle data length {} does not match configured data_len {}",
            data.len(),
            self.data_len
        );

        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = fname.len();
        buf[..n].copy_from_slice(fname);
        // buf[n] is the 0x00 terminator, already zeroed
        buf[n + 1..n + 1 + data.len()].copy_from_slice(data);
        // extra padding stays zero-filled
        FrameBuf {
            buf,
            len: self.frame_len(),
        }
    }

    /// Split an inbound frame back into identifier and payload.
    ///
    /// Panics when the frame length or the terminator does not match the
    /// configured shape; an inbound size mismatch is fatal on the receiver.
    pub fn decode<'a>(&self, frame: &'a [u8]) -> (&'a [u8], &'a [u8]) {
        assert_eq!(
            frame.len(),
            self.frame_len(),
            "inbound frame is {} bytes, expected {}",
            frame.len(),
            self.frame_len()
        );
        let n = self.fname_len as usize;
        assert_eq!(frame[n], 0, "frame identifier terminator missing");
        let fname = &frame[..n];
        let data = &frame[n + 1..n + 1 + self.data_len as usize];
        (fname, data)
    }
}

/// A frame assembled on the stack (at most 255 bytes)
pub struct FrameBuf {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl FrameBuf {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Message kinds carried over the point-to-point transport
pub const MSG_DATA: u32 = 1;
pub const MSG_ACK: u32 = 2;

/// Fixed header prepended to every transport message.
///
/// `src` and `dst` are the originating rank and the final destination; a
/// multi-hop backend forwards a message whose `dst` is not the local rank.
/// Acks echo the header of the data message they answer, with `frame_len`
/// zero and `status` carrying the sink result.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub kind: u32,
    pub epoch: u32,
    pub src: i32,
    pub dst: i32,
    pub status: i32,
    pub frame_len: u32,
}

impl MsgHeader {
    pub const LEN: usize = size_of::<MsgHeader>();

    pub fn data(epoch: u32, src: i32, dst: i32, frame_len: usize) -> Self {
        Self {
            kind: MSG_DATA,
            epoch,
            src,
            dst,
            status: 0,
            frame_len: frame_len as u32,
        }
    }

    pub fn ack(of: &MsgHeader, status: i32) -> Self {
        Self {
            kind: MSG_ACK,
            epoch: of.epoch,
            src: of.src,
            dst: of.dst,
            status,
            frame_len: 0,
        }
    }
}

/// Serialize a header plus frame into one transport message.
pub fn pack_message(header: &MsgHeader, frame: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.frame_len as usize, frame.len());
    let mut bytes = Vec::with_capacity(MsgHeader::LEN + frame.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(frame);
    bytes
}

/// Split a transport message into its header and frame.
///
/// Panics on truncated input; a short message means the transport broke
/// its framing contract.
pub fn unpack_message(bytes: &[u8]) -> (MsgHeader, &[u8]) {
    let (header, frame) = MsgHeader::read_from_prefix(bytes)
        .unwrap_or_else(|_| panic!("truncated shuffle message ({} bytes)", bytes.len()));
    assert_eq!(
        frame.len(),
        header.frame_len as usize,
        "message frame is {} bytes, header says {}",
        frame.len(),
        header.frame_len
    );
    (header, frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let spec = FrameSpec {
            fname_len: 8,
            data_len: 16,
            extra_len: 4,
        };
        let fname = b"particle";
        let data = b"0123456789abcdef";
        let frame = spec.encode(fname, data);
        assert_eq!(frame.as_slice().len(), spec.frame_len());
        assert_eq!(frame.as_slice()[8], 0);

        let (f, d) = spec.decode(frame.as_slice());
        assert_eq!(f, fname);
        assert_eq!(d, data);
    }

    #[test]
    fn test_frame_extra_is_zero_filled() {
        let spec = FrameSpec {
            fname_len: 3,
            data_len: 2,
            extra_len: 5,
        };
        let frame = spec.encode(b"abc", b"xy");
        let tail = &frame.as_slice()[spec.frame_len() - 5..];
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "does not match configured fname_len")]
    fn test_encode_rejects_wrong_id_length() {
        let spec = FrameSpec {
            fname_len: 8,
            data_len: 4,
            extra_len: 0,
        };
        spec.encode(b"short", b"data");
    }

    #[test]
    #[should_panic(expected = "inbound frame is")]
    fn test_decode_rejects_wrong_frame_length() {
        let spec = FrameSpec {
            fname_len: 8,
            data_len: 4,
            extra_len: 0,
        };
        spec.decode(&[0u8; 10]);
    }

    #[test]
    fn test_message_round_trip() {
        let frame = [7u8; 21];
        let header = MsgHeader::data(3, 1, 2, frame.len());
        let bytes = pack_message(&header, &frame);
        assert_eq!(bytes.len(), MsgHeader::LEN + frame.len());

        let (h, f) = unpack_message(&bytes);
        assert_eq!(h, header);
        assert_eq!(f, &frame[..]);
    }

    #[test]
    fn test_ack_echoes_route() {
        let data = MsgHeader::data(9, 4, 6, 32);
        let ack = MsgHeader::ack(&data, -1);
        assert_eq!(ack.kind, MSG_ACK);
        assert_eq!(ack.epoch, 9);
        assert_eq!(ack.src, 4);
        assert_eq!(ack.dst, 6);
        assert_eq!(ack.status, -1);
        assert_eq!(ack.frame_len, 0);
    }
}
