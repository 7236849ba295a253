//! Codec for encoding and decoding Comet frames.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing,
//! shared by the RPC control plane and the raw TCP subscriber protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// The peer closed the stream in the middle of a frame.
    #[error("Connection closed with {0} bytes of a partial frame buffered")]
    UnexpectedEof(usize),

    /// The peer closed the stream before answering.
    #[error("Connection closed")]
    ConnectionClosed,

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding error (WebSocket push frames).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

/// Read the next frame from a stream, buffering partial reads in `buf`.
///
/// Returns `Ok(None)` when the peer closes the stream on a frame boundary.
///
/// # Errors
///
/// Returns an error on I/O failure, an invalid frame, or EOF inside a frame.
pub async fn read_frame<R, T>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        if let Some(frame) = decode_from(buf)? {
            return Ok(Some(frame));
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::UnexpectedEof(buf.len()));
        }
    }
}

/// Encode a frame and write it to a stream.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = encode(frame)?;
    writer.write_all(&data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::{PushFrame, TcpFrame};
    use crate::rpc::{RpcCall, RpcRequest};

    #[test]
    fn test_encode_decode_rpc_requests() {
        let requests = vec![
            RpcRequest::new(1, RpcCall::new_channel("u1")),
            RpcRequest::new(2, RpcCall::close_channel("u1")),
            RpcRequest::new(3, RpcCall::publish("u1", "hello", 0, "m1")),
            RpcRequest::new(4, RpcCall::migrate(vec!["a".into(), "b".into()], 160)),
        ];

        for request in requests {
            let encoded = encode(&request).unwrap();
            let decoded: RpcRequest = decode(&encoded).unwrap();
            assert_eq!(request, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = TcpFrame::handshake("u1", 30);
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode::<TcpFrame>(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = TcpFrame::Push(PushFrame {
            msg: "x".repeat(MAX_FRAME_SIZE + 1),
            expire: 0,
            mid: "m1".into(),
        });

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 8]);

        assert!(matches!(
            decode_from::<TcpFrame>(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = TcpFrame::handshake("u1", 30);
        let frame2 = TcpFrame::Heartbeat;

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        let decoded1: TcpFrame = decode_from(&mut buf).unwrap().unwrap();
        let decoded2: TcpFrame = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(frame1, decoded1);
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_over_split_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let encoded = encode(&TcpFrame::handshake("user:42", 10)).unwrap();

        let writer = tokio::spawn(async move {
            for chunk in encoded.chunks(3) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let mut buf = BytesMut::new();
        let frame: Option<TcpFrame> = read_frame(&mut server, &mut buf).await.unwrap();
        writer.await.unwrap();

        assert_eq!(frame, Some(TcpFrame::handshake("user:42", 10)));
        let eof: Option<TcpFrame> = read_frame(&mut server, &mut buf).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_eof_inside_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let encoded = encode(&TcpFrame::Heartbeat).unwrap();
        client.write_all(&encoded[..encoded.len() - 1]).await.unwrap();
        drop(client);

        let mut buf = BytesMut::new();
        let result: Result<Option<TcpFrame>, _> = read_frame(&mut server, &mut buf).await;
        assert!(matches!(result, Err(ProtocolError::UnexpectedEof(_))));
    }
}
