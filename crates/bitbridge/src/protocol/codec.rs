//! Framed codec for controller/worker communication.
//!
//! Uses LengthDelimitedCodec for framing + the tagged binary encoding from
//! [`message`](super::message). Works over any AsyncRead/AsyncWrite.

use std::io;
use std::marker::PhantomData;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::ProtocolError;
use super::message::{
    Request, Response, decode_request, decode_response, encode_request, encode_response,
};

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A message with a wire encoding.
pub trait WireMessage: Sized {
    fn to_bytes(&self) -> Result<bytes::Bytes, ProtocolError>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

impl WireMessage for Request {
    fn to_bytes(&self) -> Result<bytes::Bytes, ProtocolError> {
        encode_request(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_request(bytes)
    }
}

impl WireMessage for Response {
    fn to_bytes(&self) -> Result<bytes::Bytes, ProtocolError> {
        encode_response(self)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_response(bytes)
    }
}

/// Failure to read or write one frame.
///
/// `Protocol` means a frame was announced larger than the limit or its
/// contents were invalid. Either way the peer's stream can no longer be
/// trusted and the connection should be closed.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Codec that frames messages with a 4-byte length prefix.
pub struct WireCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for WireCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WireCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            _phantom: PhantomData,
        }
    }
}

impl<T: WireMessage> Decoder for WireCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(header) = src.first_chunk::<4>() {
            let len = u32::from_be_bytes(*header) as usize;
            if len > self.max_frame_length {
                return Err(ProtocolError::FrameTooLarge {
                    len,
                    max: self.max_frame_length,
                }
                .into());
            }
        }
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(T::from_bytes(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<T: WireMessage> Encoder<T> for WireCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.to_bytes()?;
        if payload.len() > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_length,
            }
            .into());
        }
        tracing::trace!(frame_size_bytes = payload.len(), "Encoding frame");
        self.inner.encode(payload, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Failure, Value};

    #[test]
    fn codec_roundtrip_request() {
        let mut codec = WireCodec::<Request>::new();
        let mut buf = BytesMut::new();

        let req = Request::new("sum_32bit").arg(1000i32).arg(2000i32);
        codec.encode(req.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_roundtrip_response() {
        let mut codec = WireCodec::<Response>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Response::Success(Value::I32(3000)), &mut buf)
            .unwrap();
        codec
            .encode(
                Response::Failure(Failure::unknown_operation("unknown_op")),
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Response::Success(Value::I32(3000)))
        );
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Response::Failure(_))
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = WireCodec::<Request>::new();
        let mut full = BytesMut::new();
        codec
            .encode(Request::new("reverse_string").arg("abc"), &mut full)
            .unwrap();

        let mut buf = BytesMut::new();
        let split = full.len() - 3;
        buf.extend_from_slice(&full[..split]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[split..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.operation(), "reverse_string");
    }

    #[test]
    fn bad_frame_contents_are_protocol_errors() {
        let mut codec = WireCodec::<Request>::new();
        let mut buf = BytesMut::new();
        // one-byte frame holding a bogus version byte
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&[0xee]);

        match codec.decode(&mut buf) {
            Err(FrameError::Protocol(ProtocolError::VersionMismatch { found: 0xee, .. })) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = WireCodec::<Request>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Request::new("x".repeat(64)), &mut buf)
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::FrameTooLarge { max: 16, .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_incoming_frame_is_a_protocol_error() {
        let mut codec = WireCodec::<Request>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        // only the header has arrived
        buf.extend_from_slice(&1024u32.to_be_bytes());

        match codec.decode(&mut buf) {
            Err(FrameError::Protocol(ProtocolError::FrameTooLarge { len: 1024, max: 16 })) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
