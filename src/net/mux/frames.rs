use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::net::mux::FrameError;
use crate::net::{Deserialize, Serialize};

const KIND_OPEN: u8 = 0x01;
const KIND_DATA: u8 = 0x02;
const KIND_FIN: u8 = 0x03;
const KIND_RESET: u8 = 0x04;
const KIND_CLOSE: u8 = 0x05;
const KIND_PING: u8 = 0x06;

/// Largest payload a single `Data` frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    Open { stream_id: u32 },
    Data { stream_id: u32, payload: Bytes },
    Fin { stream_id: u32 },
    Reset { stream_id: u32, code: u64 },
    Close { code: u64, reason: String },
    Ping,
}

impl MuxFrame {
    fn kind(&self) -> u8 {
        match self {
            MuxFrame::Open { .. } => KIND_OPEN,
            MuxFrame::Data { .. } => KIND_DATA,
            MuxFrame::Fin { .. } => KIND_FIN,
            MuxFrame::Reset { .. } => KIND_RESET,
            MuxFrame::Close { .. } => KIND_CLOSE,
            MuxFrame::Ping => KIND_PING,
        }
    }

    fn len(&self) -> usize {
        1 + match self {
            MuxFrame::Open { .. } | MuxFrame::Fin { .. } => 4,
            MuxFrame::Data { payload, .. } => 8 + payload.len(),
            MuxFrame::Reset { .. } => 12,
            MuxFrame::Close { reason, .. } => 10 + reason.len(),
            MuxFrame::Ping => 0,
        }
    }
}

impl Serialize<MuxFrame> for MuxFrame {
    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_u8(self.kind());

        match self {
            MuxFrame::Open { stream_id } | MuxFrame::Fin { stream_id } => {
                buf.put_u32(*stream_id);
            }
            MuxFrame::Data { stream_id, payload } => {
                buf.put_u32(*stream_id);
                buf.put_u32(payload.len() as u32);
                buf.put(&payload[..]);
            }
            MuxFrame::Reset { stream_id, code } => {
                buf.put_u32(*stream_id);
                buf.put_u64(*code);
            }
            MuxFrame::Close { code, reason } => {
                // Reasons are informational, so cut rather than fail.
                let reason = &reason.as_bytes()[..reason.len().min(u16::MAX as usize)];
                buf.put_u64(*code);
                buf.put_u16(reason.len() as u16);
                buf.put_slice(reason);
            }
            MuxFrame::Ping => {}
        }

        buf.freeze()
    }
}

impl Deserialize<MuxFrame> for MuxFrame {
    fn deserialize(buf: &mut Cursor<&BytesMut>) -> Result<Option<MuxFrame>, FrameError> {
        let Some(kind) = (buf.remaining() >= 1).then(|| buf.get_u8()) else {
            return Ok(None);
        };

        let frame = match kind {
            KIND_OPEN => (buf.remaining() >= 4).then(|| MuxFrame::Open {
                stream_id: buf.get_u32(),
            }),
            KIND_DATA => {
                let Some((stream_id, len)) =
                    (buf.remaining() >= 8).then(|| (buf.get_u32(), buf.get_u32() as usize))
                else {
                    return Ok(None);
                };
                if len > MAX_PAYLOAD_LEN {
                    return Err(FrameError::PayloadTooLarge(len));
                }
                (buf.remaining() >= len).then(|| MuxFrame::Data {
                    stream_id,
                    payload: buf.copy_to_bytes(len),
                })
            }
            KIND_FIN => (buf.remaining() >= 4).then(|| MuxFrame::Fin {
                stream_id: buf.get_u32(),
            }),
            KIND_RESET => (buf.remaining() >= 12).then(|| MuxFrame::Reset {
                stream_id: buf.get_u32(),
                code: buf.get_u64(),
            }),
            KIND_CLOSE => {
                let Some((code, len)) =
                    (buf.remaining() >= 10).then(|| (buf.get_u64(), buf.get_u16() as usize))
                else {
                    return Ok(None);
                };
                (buf.remaining() >= len)
                    .then(|| buf.copy_to_bytes(len))
                    .map(|reason| MuxFrame::Close {
                        code,
                        reason: String::from_utf8_lossy(&reason).to_string(),
                    })
            }
            KIND_PING => Some(MuxFrame::Ping),
            other => return Err(FrameError::UnknownKind(other)),
        };

        Ok(frame)
    }
}
