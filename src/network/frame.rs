// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{AppError, AppResult};

/// Size of the length prefix itself.
pub const LENGTH_FIELD_SIZE: usize = 4;
/// Bytes counted by the length prefix before the payload starts: flags + message id.
pub const HEADER_SIZE: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    pub const REQUEST: FrameFlags = FrameFlags(1);
    pub const RESPONSE: FrameFlags = FrameFlags(2);
    pub const INTERNAL_CONTROL: FrameFlags = FrameFlags(4);

    pub const fn from_bits(bits: u16) -> FrameFlags {
        FrameFlags(bits)
    }
    pub const fn bits(self) -> u16 {
        self.0
    }
    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn is_request(self) -> bool {
        self.contains(FrameFlags::REQUEST)
    }
    pub fn is_response(self) -> bool {
        self.contains(FrameFlags::RESPONSE)
    }
    pub fn is_control(self) -> bool {
        self.contains(FrameFlags::INTERNAL_CONTROL)
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_request() {
            names.push("REQUEST");
        }
        if self.is_response() {
            names.push("RESPONSE");
        }
        if self.is_control() {
            names.push("INTERNAL_CONTROL");
        }
        write!(f, "FrameFlags({:#06x}: {})", self.0, names.join("|"))
    }
}

/// One protocol unit: `length:u32 | flags:u16 | message_id:i16 | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub message_id: i16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: FrameFlags, message_id: i16, payload: impl Into<Bytes>) -> Frame {
        Frame {
            flags,
            message_id,
            payload: payload.into(),
        }
    }

    /// Bytes this frame occupies on the wire, prefix included.
    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + HEADER_SIZE + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> AppResult<()> {
        encode_parts(self.flags, self.message_id, &self.payload, dst)
    }
}

/// Writes one frame without first building a [`Frame`] around the payload.
///
/// Nothing is written when the length does not fit the prefix.
pub fn encode_parts(
    flags: FrameFlags,
    message_id: i16,
    payload: &[u8],
    dst: &mut BytesMut,
) -> AppResult<()> {
    let length = u32::try_from(HEADER_SIZE + payload.len()).map_err(|_| {
        AppError::InvalidValue(format!(
            "payload of {} bytes does not fit a frame length prefix",
            payload.len()
        ))
    })?;
    dst.reserve(LENGTH_FIELD_SIZE + HEADER_SIZE + payload.len());
    dst.put_u32(length);
    dst.put_u16(flags.bits());
    dst.put_i16(message_id);
    dst.put_slice(payload);
    Ok(())
}

/// Splits frames out of a growing accumulator.
///
/// `decode` consumes exactly one frame (prefix included) when the accumulator
/// holds a complete one and leaves the accumulator untouched otherwise, so it can
/// be called in a loop after every read regardless of how the stream was chunked.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }

    /// Validates the length prefix and reports how many bytes the whole frame needs.
    fn check(&self, buffer: &BytesMut) -> AppResult<Option<usize>> {
        if buffer.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_FIELD_SIZE];
        prefix.copy_from_slice(&buffer[..LENGTH_FIELD_SIZE]);
        let body_size = i32::from_be_bytes(prefix);
        if body_size < HEADER_SIZE as i32 {
            return Err(AppError::ProtocolViolation(format!(
                "frame length {} is smaller than the {} byte header",
                body_size, HEADER_SIZE
            )));
        }
        let body_size = body_size as usize;
        if body_size > self.max_frame_size {
            return Err(AppError::ProtocolViolation(format!(
                "frame of length {} is too large",
                body_size
            )));
        }
        Ok(Some(LENGTH_FIELD_SIZE + body_size))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        let frame_size = match self.check(buffer)? {
            Some(size) => size,
            None => return Ok(None),
        };
        if buffer.len() < frame_size {
            buffer.reserve(frame_size - buffer.len());
            return Ok(None);
        }
        buffer.advance(LENGTH_FIELD_SIZE);
        let mut body = buffer.split_to(frame_size - LENGTH_FIELD_SIZE);
        let flags = FrameFlags::from_bits(body.get_u16());
        let message_id = body.get_i16();
        Ok(Some(Frame {
            flags,
            message_id,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> AppResult<()> {
        if HEADER_SIZE + frame.payload.len() > self.max_frame_size {
            return Err(AppError::InvalidValue(format!(
                "payload of {} bytes exceeds the frame size limit {}",
                frame.payload.len(),
                self.max_frame_size
            )));
        }
        frame.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(1024 * 1024)
    }

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec().encode(frame.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_layout_is_network_order() {
        let frame = Frame::new(FrameFlags::REQUEST, 0x0102, &b"abc"[..]);
        let buf = encoded(&frame);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 7, 0, 1, 0x01, 0x02, b'a', b'b', b'c'][..]
        );
        assert_eq!(buf.len(), frame.encoded_len());
    }

    #[rstest]
    #[case(FrameFlags::REQUEST, 0, &b""[..])]
    #[case(FrameFlags::RESPONSE, -1, &b"42"[..])]
    #[case(FrameFlags::INTERNAL_CONTROL | FrameFlags::REQUEST, i16::MIN, &[0u8][..])]
    #[case(FrameFlags::NONE, i16::MAX, &[7u8; 300][..])]
    fn split_at_every_boundary(
        #[case] flags: FrameFlags,
        #[case] message_id: i16,
        #[case] payload: &[u8],
    ) {
        let frame = Frame::new(flags, message_id, Bytes::copy_from_slice(payload));
        let wire = encoded(&frame);
        for split in 0..=wire.len() {
            let mut codec = codec();
            let mut acc = BytesMut::new();
            acc.extend_from_slice(&wire[..split]);
            let early = codec.decode(&mut acc).unwrap();
            if split < wire.len() {
                assert!(early.is_none(), "decoded early at split {}", split);
                acc.extend_from_slice(&wire[split..]);
                assert_eq!(codec.decode(&mut acc).unwrap(), Some(frame.clone()));
            } else {
                assert_eq!(early, Some(frame.clone()));
            }
            assert!(acc.is_empty());
        }
    }

    #[test]
    fn byte_at_a_time_with_several_frames() {
        let frames: Vec<Frame> = (0..5)
            .map(|i| Frame::new(FrameFlags::REQUEST, i, vec![i as u8; i as usize * 3]))
            .collect();
        let mut wire = BytesMut::new();
        for frame in &frames {
            frame.encode_into(&mut wire).unwrap();
        }

        let mut codec = codec();
        let mut acc = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            acc.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut acc).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut wire = BytesMut::new();
        Frame::new(FrameFlags::REQUEST, 1, &b"one"[..])
            .encode_into(&mut wire)
            .unwrap();
        Frame::new(FrameFlags::RESPONSE, 2, &b"two"[..])
            .encode_into(&mut wire)
            .unwrap();
        // trailing half of a third frame stays buffered
        wire.extend_from_slice(&[0, 0, 0, 9, 0]);

        let mut codec = codec();
        assert_eq!(codec.decode(&mut wire).unwrap().unwrap().message_id, 1);
        assert_eq!(codec.decode(&mut wire).unwrap().unwrap().message_id, 2);
        assert!(codec.decode(&mut wire).unwrap().is_none());
        assert_eq!(wire.len(), 5);
    }

    #[rstest]
    #[case(0)]
    #[case(-5)]
    #[case(3)]
    fn undersized_length_is_a_protocol_violation(#[case] length: i32) {
        let mut acc = BytesMut::new();
        acc.put_i32(length);
        acc.put_u32(0);
        assert!(matches!(
            codec().decode(&mut acc),
            Err(AppError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut acc = BytesMut::new();
        acc.put_u32(64 * 1024);
        let mut small = FrameCodec::new(1024);
        assert!(matches!(
            small.decode(&mut acc),
            Err(AppError::ProtocolViolation(_))
        ));
        let oversized = Frame::new(FrameFlags::REQUEST, 1, vec![0u8; 2048]);
        let mut dst = BytesMut::new();
        assert!(matches!(
            small.encode(oversized, &mut dst),
            Err(AppError::InvalidValue(_))
        ));
        assert!(dst.is_empty());
    }

    #[test]
    fn flags_compose() {
        let flags = FrameFlags::INTERNAL_CONTROL | FrameFlags::RESPONSE;
        assert!(flags.is_control());
        assert!(flags.is_response());
        assert!(!flags.is_request());
        assert_eq!(flags.bits(), 6);
    }
}
