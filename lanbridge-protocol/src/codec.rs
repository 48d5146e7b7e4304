//! Codec for encoding and decoding protocol frames
//!
//! Frame format (all integers big-endian):
//! ```text
//! ┌──────────────┬──────────┬────────────────┬─────────────┬───────┬─────────┐
//! │ Length (u32) │ Type(u8) │ Serial (u64)   │ UriLen (u8) │ Uri   │ Payload │
//! │ 4 bytes      │ 1 byte   │ 8 bytes        │ 1 byte      │ N     │ rest    │
//! └──────────────┴──────────┴────────────────┴─────────────┴───────┴─────────┘
//! ```
//! `Length` counts every byte after itself.

use crate::constants::{HEADER_SIZE, LENGTH_FIELD_SIZE, MAX_URI_LEN, RELAY_MAX_FRAME_SIZE};
use crate::frame::{Frame, FrameType};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Uri too long: {0} bytes (max: 255)")]
    UriTooLong(usize),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Length-prefixed frame codec
///
/// Decoding is resumable: an incomplete frame leaves the buffer untouched
/// and yields `Ok(None)` until the rest arrives.
#[derive(Debug, Clone, Copy)]
pub struct ProxyCodec {
    max_frame_size: usize,
}

impl Default for ProxyCodec {
    fn default() -> Self {
        Self {
            max_frame_size: RELAY_MAX_FRAME_SIZE,
        }
    }
}

impl ProxyCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for ProxyCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;

        if frame_length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame_length,
                max: self.max_frame_size,
            });
        }
        if frame_length < HEADER_SIZE {
            return Err(CodecError::Malformed(format!(
                "declared length {frame_length} shorter than header"
            )));
        }

        if src.len() < LENGTH_FIELD_SIZE + frame_length {
            src.reserve(LENGTH_FIELD_SIZE + frame_length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let mut body = src.split_to(frame_length);

        let type_byte = body.get_u8();
        let serial_number = body.get_u64();
        let uri_len = body.get_u8() as usize;

        let frame_type =
            FrameType::try_from(type_byte).map_err(CodecError::UnknownFrameType)?;

        if uri_len > body.len() {
            return Err(CodecError::Malformed(format!(
                "uri length {uri_len} exceeds remaining {} bytes",
                body.len()
            )));
        }

        let uri = if uri_len == 0 {
            None
        } else {
            let raw = body.split_to(uri_len);
            let uri = String::from_utf8(raw.to_vec())
                .map_err(|_| CodecError::Malformed("uri is not valid UTF-8".to_string()))?;
            Some(uri)
        };

        Ok(Some(Frame {
            frame_type,
            serial_number,
            uri,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for ProxyCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let uri = frame.uri.as_deref().unwrap_or("").as_bytes();
        if uri.len() > MAX_URI_LEN {
            return Err(CodecError::UriTooLong(uri.len()));
        }

        let frame_length = HEADER_SIZE + uri.len() + frame.payload.len();
        if frame_length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame_length,
                max: self.max_frame_size,
            });
        }
        let declared = u32::try_from(frame_length).map_err(|_| CodecError::FrameTooLarge {
            size: frame_length,
            max: self.max_frame_size,
        })?;

        dst.reserve(LENGTH_FIELD_SIZE + frame_length);
        dst.put_u32(declared);
        dst.put_u8(frame.frame_type.as_u8());
        dst.put_u64(frame.serial_number);
        dst.put_u8(uri.len() as u8);
        dst.put_slice(uri);
        dst.put_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::constants::CLIENT_MAX_FRAME_SIZE;
    use bytes::Bytes;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        ProxyCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_codec_round_trip() {
        let mut codec = ProxyCodec::new();
        let frames = vec![
            Frame::heartbeat(),
            Frame::auth("client-key"),
            Frame::connect_request("17", "192.168.1.10:80").with_serial_number(99),
            Frame::connect_tunnel("17", "client-key"),
            Frame::disconnect("17"),
            Frame::transfer("17", Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")),
        ];

        for frame in frames {
            let mut buf = BytesMut::new();
            codec.encode(frame.clone(), &mut buf).unwrap();
            assert_eq!(buf.len(), 4 + frame.encoded_len());
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame, decoded);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_empty_uri_round_trips_as_absent() {
        let frame = Frame::disconnect("");
        assert_eq!(frame.uri, None);

        let mut buf = encode(frame.clone());
        let decoded = ProxyCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_wire_layout() {
        let buf = encode(
            Frame::transfer("ab", Bytes::from_static(b"xyz")).with_serial_number(0x0102),
        );
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 15, // length
                0x05, // type
                0, 0, 0, 0, 0, 0, 0x01, 0x02, // serial
                2, b'a', b'b', // uri
                b'x', b'y', b'z',
            ]
        );
    }

    #[test]
    fn test_partial_frame_at_every_split_point() {
        let frame = Frame::transfer("31337", Bytes::from_static(b"hello world"));
        let full = encode(frame.clone());

        for split in 0..full.len() {
            let mut codec = ProxyCodec::new();
            let mut buf = BytesMut::from(&full[..split]);
            assert!(codec.decode(&mut buf).unwrap().is_none(), "split {split}");
            assert_eq!(buf.len(), split);

            buf.extend_from_slice(&full[split..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = ProxyCodec::new();
        let mut buf = BytesMut::new();

        let frames = vec![
            Frame::heartbeat().with_serial_number(1),
            Frame::heartbeat().with_serial_number(2),
            Frame::disconnect("3"),
        ];
        for frame in &frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        for expected in &frames {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(*expected, decoded);
        }
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_oversize_declared_length_rejected() {
        let mut codec = ProxyCodec::with_max_frame_size(CLIENT_MAX_FRAME_SIZE);
        let mut buf = BytesMut::new();
        buf.put_u32((CLIENT_MAX_FRAME_SIZE + 1) as u32);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_oversize_encode_rejected() {
        let mut codec = ProxyCodec::with_max_frame_size(CLIENT_MAX_FRAME_SIZE);
        let mut buf = BytesMut::new();
        let frame = Frame::transfer("1", Bytes::from(vec![0u8; CLIENT_MAX_FRAME_SIZE]));

        let err = codec.encode(frame, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_uri_too_long_rejected() {
        let mut buf = BytesMut::new();
        let err = ProxyCodec::new()
            .encode(Frame::auth("k".repeat(256)), &mut buf)
            .unwrap_err();
        assert!(matches!(err, CodecError::UriTooLong(256)));

        assert!(ProxyCodec::new()
            .encode(Frame::auth("k".repeat(255)), &mut buf)
            .is_ok());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = encode(Frame::heartbeat());
        buf[4] = 0x09;
        let err = ProxyCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::UnknownFrameType(0x09)));
    }

    #[test]
    fn test_malformed_lengths_rejected() {
        let mut short = BytesMut::new();
        short.put_u32(5);
        short.put_slice(&[1, 0, 0, 0, 0]);
        assert!(matches!(
            ProxyCodec::new().decode(&mut short),
            Err(CodecError::Malformed(_))
        ));

        let mut buf = encode(Frame::auth("abc"));
        // uriLen claims more bytes than the frame holds
        buf[13] = 200;
        assert!(matches!(
            ProxyCodec::new().decode(&mut buf),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_uri_and_payload() {
        let mut buf = encode(Frame::new(FrameType::Heartbeat).with_uri(""));
        assert_eq!(buf.len(), 14);
        let decoded = ProxyCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.uri, None);
        assert!(decoded.payload.is_empty());
    }
}
