use crate::error::Error;
use bytes::BytesMut;

/// Mask covering the three reserved header bits, available to negotiated
/// extensions only.
pub const RSV_MASK: u8 = 0x70;
pub const RSV1: u8 = 0x40;
pub const RSV2: u8 = 0x20;
pub const RSV3: u8 = 0x10;

/// Control frame payloads are capped at 125 bytes by the RFC.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Opcodes 0x3-0x7 and 0xB-0xF are reserved by the RFC and rejected.
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::ReservedOpcode(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// A single parsed wire frame. The payload buffer is owned and travels
/// forward through the receive path by move.
#[derive(Debug)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    /// RSV bits of the header, already masked with `RSV_MASK`.
    pub rsv: u8,
    pub payload: BytesMut,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, rsv: u8, payload: BytesMut) -> Self {
        Self {
            final_fragment,
            opcode,
            rsv,
            payload,
        }
    }

    pub fn ping(payload: BytesMut) -> Self {
        Self::new(true, OpCode::Ping, 0, payload)
    }

    pub fn pong(payload: BytesMut) -> Self {
        Self::new(true, OpCode::Pong, 0, payload)
    }

    pub fn close(payload: BytesMut) -> Self {
        Self::new(true, OpCode::Close, 0, payload)
    }
}

/// Striped XOR of the payload with the 4-byte mask key, starting at
/// `offset` within the logical payload. The offset keeps the stripe aligned
/// when a payload is masked chunk by chunk.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}
