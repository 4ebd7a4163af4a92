use crate::error::Error;
use crate::frame::OpCode;
use bytes::BytesMut;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Converts an assembled payload into a Message variant. The UTF-8 check
    /// for text messages has already run in the receive path, so an
    /// ill-formed buffer here is a caller bug surfaced as `InvalidUtf8`.
    pub fn from_payload(opcode: OpCode, payload: BytesMut) -> Result<Self, Error> {
        match opcode {
            OpCode::Text => Ok(Message::Text(
                String::from_utf8(payload.to_vec()).map_err(|_| Error::InvalidUtf8)?,
            )),
            OpCode::Binary => Ok(Message::Binary(payload.to_vec())),
            _ => Err(Error::InvalidFrame("control opcode used as a message")),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    // Function to get the payload as binary (Vec<u8>)
    pub fn as_binary(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    // Function to get the payload as a String
    pub fn as_text(&self) -> Result<&str, Error> {
        match self {
            Message::Text(text) => Ok(text),
            Message::Binary(data) => std::str::from_utf8(data).map_err(|_| Error::InvalidUtf8),
        }
    }

    pub fn len(&self) -> usize {
        self.as_binary().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_binary().is_empty()
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
        }
    }
}
