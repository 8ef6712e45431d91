use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Frame, Message, MAX_MESSAGE_SIZE};

/// Bytes after the length prefix that precede the payload: kind + channel.
const FRAME_HEADER: usize = 2;

/// Codec for encoding/decoding replication frames.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame: [4 bytes len][1 byte kind][1 byte channel][payload]
    ///
    /// `len` counts the kind and channel bytes plus the payload.
    pub fn encode(frame: &Frame) -> ProtocolResult<Vec<u8>> {
        let payload = Self::encode_payload(&frame.message)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + FRAME_HEADER) as u32;
        let mut buf = Vec::with_capacity(4 + FRAME_HEADER + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(frame.message.type_tag());
        buf.push(frame.channel);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a framed message. Returns (frame, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(Frame, usize)> {
        if data.len() < 4 + FRAME_HEADER {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = Self::frame_len(data[0..4].try_into().unwrap_or_default())?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let frame = Self::decode_body(&data[4..total])?;
        Ok((frame, total))
    }

    /// Serialize a message body (no framing).
    pub fn encode_payload(message: &Message) -> ProtocolResult<Vec<u8>> {
        match message {
            Message::Handshake(m) => serialize(m),
            Message::Have(m) => serialize(m),
            Message::Request(m) => serialize(m),
            Message::Data(m) => serialize(m),
            Message::Unavailable(m) => serialize(m),
            Message::Error(m) => serialize(m),
        }
    }

    /// Deserialize a message body of the given kind.
    pub fn decode_payload(kind: u8, payload: &[u8]) -> ProtocolResult<Message> {
        Ok(match kind {
            1 => Message::Handshake(deserialize(payload)?),
            2 => Message::Have(deserialize(payload)?),
            3 => Message::Request(deserialize(payload)?),
            4 => Message::Data(deserialize(payload)?),
            5 => Message::Unavailable(deserialize(payload)?),
            255 => Message::Error(deserialize(payload)?),
            other => return Err(ProtocolError::InvalidMessageType(other)),
        })
    }

    fn frame_len(prefix: [u8; 4]) -> ProtocolResult<usize> {
        let len = u32::from_be_bytes(prefix) as usize;
        if len < FRAME_HEADER {
            return Err(ProtocolError::FramingError(format!("frame length {len}")));
        }
        if len - FRAME_HEADER > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len - FRAME_HEADER,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(len)
    }

    fn decode_body(body: &[u8]) -> ProtocolResult<Frame> {
        let message = Self::decode_payload(body[0], &body[FRAME_HEADER..])?;
        Ok(Frame {
            channel: body[1],
            message,
        })
    }
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = FrameCodec::frame_len(prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::FramingError("stream ended mid-frame".into())
        } else {
            ProtocolError::Io(e)
        }
    })?;
    FrameCodec::decode_body(&body).map(Some)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = FrameCodec::encode(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn serialize<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn deserialize<T: DeserializeOwned>(payload: &[u8]) -> ProtocolResult<T> {
    bincode::deserialize(payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use vault_crypto::tree::{self, Node};
    use vault_crypto::{FeedLink, Keypair, Proof, SignedRoot};

    fn signed_root() -> SignedRoot {
        let keys = Keypair::generate();
        SignedRoot::sign(&keys.secret, 1, vec![tree::leaf(b"block")])
    }

    macro_rules! roundtrip_test {
        ($name:ident, $msg:expr) => {
            #[test]
            fn $name() {
                let frame = Frame::new(3, $msg);
                let encoded = FrameCodec::encode(&frame).unwrap();
                let (decoded, consumed) = FrameCodec::decode(&encoded).unwrap();
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, frame);
            }
        };
    }

    roundtrip_test!(handshake_roundtrip, {
        let keys = Keypair::generate();
        Message::Handshake(Handshake {
            version: PROTOCOL_VERSION,
            discovery_key: keys.public.discovery_key(),
            root: Some(signed_root()),
            link: Some(FeedLink::sign(&keys.secret, Keypair::generate().public)),
            live: true,
        })
    });

    roundtrip_test!(have_roundtrip, Message::Have(Have {
        ranges: vec![BlockRange { start: 0, end: 4 }, BlockRange { start: 9, end: 10 }],
        root: None,
    }));

    roundtrip_test!(request_roundtrip, Message::Request(Request { index: 7, length: 12 }));

    roundtrip_test!(data_roundtrip, Message::Data(Data {
        index: 2,
        length: 3,
        data: b"payload".to_vec(),
        proof: Proof {
            nodes: vec![Node { hash: tree::leaf(b"x").hash, size: 1 }],
        },
    }));

    roundtrip_test!(unavailable_roundtrip, Message::Unavailable(Unavailable { index: 5 }));

    roundtrip_test!(error_roundtrip, Message::Error(ErrorMessage {
        message: "verification failed".into(),
    }));

    #[test]
    fn channel_and_kind_in_header() {
        let frame = Frame::new(9, Message::Unavailable(Unavailable { index: 1 }));
        let encoded = FrameCodec::encode(&frame).unwrap();
        assert_eq!(encoded[4], 5);
        assert_eq!(encoded[5], 9);
        let len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - 4);
    }

    #[test]
    fn type_names_correct() {
        let msg = Message::Request(Request { index: 0, length: 1 });
        assert_eq!(msg.type_name(), "Request");
        let msg = Message::Error(ErrorMessage { message: String::new() });
        assert_eq!(msg.type_name(), "Error");
        assert_eq!(msg.type_tag(), 255);
    }

    #[test]
    fn decode_truncated() {
        let err = FrameCodec::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_short_length() {
        let data = [0u8, 0, 0, 1, 2, 0];
        let err = FrameCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }

    #[test]
    fn decode_unknown_kind() {
        let data = [0u8, 0, 0, 2, 42, 0];
        let err = FrameCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessageType(42)));
    }

    #[test]
    fn decode_oversized() {
        let len = (MAX_MESSAGE_SIZE + 3) as u32;
        let mut data = len.to_be_bytes().to_vec();
        data.extend_from_slice(&[1, 0]);
        let err = FrameCodec::decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn frames_over_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let first = Frame::new(0, Message::Request(Request { index: 1, length: 2 }));
        let second = Frame::new(1, Message::Unavailable(Unavailable { index: 1 }));
        write_frame(&mut a, &first).await.unwrap();
        write_frame(&mut a, &second).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_ending_mid_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let encoded = FrameCodec::encode(&Frame::new(
            0,
            Message::Error(ErrorMessage { message: "bye".into() }),
        ))
        .unwrap();
        a.write_all(&encoded[..encoded.len() - 1]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FramingError(_)));
    }
}
