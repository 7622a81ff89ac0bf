//! Request frame codec. A frame is: unsigned 4-byte length, 1-byte type
//! tag, 8-byte request id, 4-byte source worker id, then the type-specific
//! payload. The length covers everything after the length field itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use crate::comm::RequestId;
use crate::graph::WorkerId;
use crate::utils::GraphyneError;

pub(crate) const TAG_SEND_VERTICES: u8 = 0x01;
pub(crate) const TAG_SEND_WORKER_MESSAGES: u8 = 0x02;
pub(crate) const TAG_SEND_PARTITION_MUTATIONS: u8 = 0x03;
pub(crate) const TAG_SEND_AGGREGATORS: u8 = 0x04;
pub(crate) const TAG_ADD_EDGE: u8 = 0x05;
pub(crate) const TAG_REMOVE_EDGE: u8 = 0x06;
pub(crate) const TAG_ADD_VERTEX: u8 = 0x07;
pub(crate) const TAG_REMOVE_VERTEX: u8 = 0x08;
pub(crate) const TAG_FLUSH: u8 = 0x09;
pub(crate) const TAG_ACK: u8 = 0x0a;

/// Fixed-size part of a frame after the length field: tag + id + source.
const FRAME_HEADER_LEN: usize = 1 + 8 + 4;

/// One decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub tag: u8,
    pub request_id: RequestId,
    pub source: WorkerId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(
        tag: u8,
        request_id: RequestId,
        source: WorkerId,
        payload: Bytes,
    ) -> Self {
        Frame {
            tag,
            request_id,
            source,
            payload,
        }
    }

    /// An acknowledgement frame for the given request id.
    pub fn ack(request_id: RequestId, source: WorkerId) -> Self {
        Frame::new(TAG_ACK, request_id, source, Bytes::new())
    }

    /// Encodes the full frame including the length field.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + FRAME_HEADER_LEN + self.payload.len(),
        );
        buf.put_u32((FRAME_HEADER_LEN + self.payload.len()) as u32);
        buf.put_u8(self.tag);
        buf.put_u64(self.request_id);
        buf.put_u32(self.source);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Reads one frame off the connection. Cancellation-safe: partial bytes
    /// stay in `read_buf` across invocations, in the style of the length-
    /// framed control-plane reader.
    pub async fn read_from<Conn>(
        read_buf: &mut BytesMut,
        conn_read: &mut Conn,
    ) -> Result<Frame, GraphyneError>
    where
        Conn: AsyncReadExt + Unpin,
    {
        while read_buf.len() < 4 {
            let n = conn_read.read_buf(read_buf).await?;
            if n == 0 && read_buf.len() < 4 {
                return Err(GraphyneError::Io("connection closed".into()));
            }
        }
        let frame_len =
            u32::from_be_bytes(read_buf[..4].try_into().unwrap()) as usize;
        if frame_len < FRAME_HEADER_LEN {
            return Err(GraphyneError::ProtocolViolation(format!(
                "frame length {} below header size",
                frame_len
            )));
        }

        let frame_end = 4 + frame_len;
        if read_buf.capacity() < frame_end {
            read_buf.reserve(frame_end - read_buf.capacity());
        }
        while read_buf.len() < frame_end {
            let n = conn_read.read_buf(read_buf).await?;
            if n == 0 && read_buf.len() < frame_end {
                return Err(GraphyneError::Io("connection closed".into()));
            }
        }

        // no awaits past this point; consume the frame's bytes
        let mut frame_bytes = read_buf.split_to(frame_end).freeze();
        frame_bytes.advance(4);
        let tag = frame_bytes.get_u8();
        let request_id = frame_bytes.get_u64();
        let source = frame_bytes.get_u32();
        Ok(Frame {
            tag,
            request_id,
            source,
            payload: frame_bytes,
        })
    }
}

#[cfg(test)]
mod wire_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frame_round_trip() -> Result<(), GraphyneError> {
        let frame = Frame::new(
            TAG_SEND_WORKER_MESSAGES,
            77,
            3,
            Bytes::from_static(b"payload bytes"),
        );
        let encoded = frame.encode();

        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&encoded).await?;

        let mut read_buf = BytesMut::new();
        let decoded = Frame::read_from(&mut read_buf, &mut server).await?;
        assert_eq!(decoded, frame);
        Ok(())
    }

    #[tokio::test]
    async fn split_delivery_reassembles() -> Result<(), GraphyneError> {
        let frame = Frame::ack(42, 1);
        let encoded = frame.encode();

        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut read_buf = BytesMut::new();

        // deliver in two chunks with a read between them
        client.write_all(&encoded[..5]).await?;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            Frame::read_from(&mut read_buf, &mut server),
        )
        .await;
        assert!(pending.is_err()); // times out mid-frame

        client.write_all(&encoded[5..]).await?;
        let decoded = Frame::read_from(&mut read_buf, &mut server).await?;
        assert_eq!(decoded, frame);
        Ok(())
    }

    #[tokio::test]
    async fn undersized_frame_is_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(2); // below header size
        buf.put_slice(&[0, 0]);
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&buf).await.unwrap();

        let mut read_buf = BytesMut::new();
        let res = Frame::read_from(&mut read_buf, &mut server).await;
        assert!(matches!(
            res,
            Err(GraphyneError::ProtocolViolation(_))
        ));
    }
}
