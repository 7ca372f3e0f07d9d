//! Collector frame codec
//!
//! Frame format:
//! ```text
//! +------------------+----------+---------------------------+
//! | Length (4 bytes) | Type (1) | Body                      |
//! +------------------+----------+---------------------------+
//! ```
//!
//! `Length` is big-endian and counts the type byte plus the body.
//!
//! | type | frame    | body                                         |
//! |------|----------|----------------------------------------------|
//! | 1    | Ingest   | encoded record                               |
//! | 2    | Dispatch | graph id (u32 BE), node id (u32 BE), record  |
//! | 3    | Ack      | empty                                        |

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracehouse_core::Record;
use tracehouse_stream::{GraphId, NodeId};

use crate::error::{ClusterError, Result};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_LEN: usize = 4;

const TYPE_INGEST: u8 = 1;
const TYPE_DISPATCH: u8 = 2;
const TYPE_ACK: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A record from an agent, entering the local buffer
    Ingest(Record),
    /// A record resuming graph `graph_id` after node `node_id`
    Dispatch {
        graph_id: GraphId,
        node_id: NodeId,
        record: Record,
    },
    Ack,
}

impl Frame {
    fn type_byte(&self) -> u8 {
        match self {
            Frame::Ingest(_) => TYPE_INGEST,
            Frame::Dispatch { .. } => TYPE_DISPATCH,
            Frame::Ack => TYPE_ACK,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Ingest(record) => record.encoded_len(),
            Frame::Dispatch { record, .. } => 8 + record.encoded_len(),
            Frame::Ack => 0,
        }
    }
}

pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ClusterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < LENGTH_LEN {
            return Ok(None);
        }

        let length = (&src[..LENGTH_LEN]).get_u32() as usize;
        if length == 0 {
            return Err(ClusterError::Protocol("Empty frame".to_string()));
        }
        if length > self.max_frame_size {
            return Err(ClusterError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        let total_length = LENGTH_LEN + length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_LEN);
        let mut body = src.split_to(length);
        let frame_type = body.get_u8();

        let frame = match frame_type {
            TYPE_INGEST => Frame::Ingest(Record::from_bytes(&body)?),
            TYPE_DISPATCH => {
                if body.len() < 8 {
                    return Err(ClusterError::Protocol(
                        "Dispatch frame too short".to_string(),
                    ));
                }
                let graph_id = body.get_u32();
                let node_id = body.get_u32();
                Frame::Dispatch {
                    graph_id,
                    node_id,
                    record: Record::from_bytes(&body)?,
                }
            }
            TYPE_ACK => {
                if !body.is_empty() {
                    return Err(ClusterError::Protocol("Ack frame with a body".to_string()));
                }
                Frame::Ack
            }
            other => {
                return Err(ClusterError::Protocol(format!("Unknown frame type {other}")));
            }
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ClusterError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = 1 + item.body_len();
        if length > self.max_frame_size {
            return Err(ClusterError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        dst.reserve(LENGTH_LEN + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.type_byte());
        match item {
            Frame::Ingest(record) => record.encode(dst),
            Frame::Dispatch {
                graph_id,
                node_id,
                record,
            } => {
                dst.put_u32(graph_id);
                dst.put_u32(node_id);
                record.encode(dst);
            }
            Frame::Ack => {}
        }
        Ok(())
    }
}
