use crate::error::Error;
use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, RSV_MASK};
use bytes::BytesMut;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Reads one complete RFC 6455 frame at a time from the server half of the
/// stream. Construction fixes the RSV bits the negotiated extensions may
/// use and the frame size limit; everything else arrives per call.
pub struct FrameReader<R> {
    buf_reader: BufReader<R>,
    allowed_rsv: u8,
    max_frame_size: usize,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read: R, allowed_rsv: u8, max_frame_size: usize) -> Self {
        Self {
            buf_reader: BufReader::new(read),
            allowed_rsv: allowed_rsv & RSV_MASK,
            max_frame_size,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed off the wire so far, headers included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads the next frame. `fragmented_in_progress` tells the reader
    /// whether the assembler is mid-message, which decides the legality of
    /// Continuation and fresh data opcodes.
    ///
    /// Returns `Ok(None)` on a clean EOF, meaning the stream ended before
    /// the first header byte; an EOF anywhere later is a framing error.
    pub async fn read_frame(
        &mut self,
        fragmented_in_progress: bool,
    ) -> Result<Option<Frame>, Error> {
        let mut header = [0u8; 2];

        let n = self.buf_reader.read(&mut header[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.read_exact(&mut header[1..]).await?;
        self.bytes_read += 2;

        // The first bit in the first byte tells us whether this frame is
        // the final fragment of a message.
        let final_fragment = (header[0] & 0b10000000) != 0;
        // The opcode is the low 4 bits of the first byte; reserved opcodes
        // are rejected right here.
        let opcode = OpCode::from(header[0] & 0b00001111)?;

        // RSV bits are only meaningful for negotiated extensions. Anything
        // outside the mask the connection negotiated fails the frame.
        let rsv = header[0] & RSV_MASK;
        if rsv & !self.allowed_rsv != 0 {
            return Err(Error::ProtocolViolation(
                "RSV bits set without a matching negotiated extension",
            ));
        }

        let masked = (header[1] & 0b10000000) != 0;
        let mut length = (header[1] & 0b01111111) as usize;

        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.read_exact(&mut be_bytes).await?;
            self.bytes_read += 2;
            length = u16::from_be_bytes(be_bytes) as usize;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.read_exact(&mut be_bytes).await?;
            self.bytes_read += 8;
            let wide = u64::from_be_bytes(be_bytes);
            if wide & (1 << 63) != 0 {
                return Err(Error::PayloadLengthOverflow);
            }
            length = wide as usize;
        }

        if length > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: length,
                limit: self.max_frame_size,
            });
        }

        // Control frames can't be fragmented and are capped at 125 bytes.
        if opcode.is_control() {
            if !final_fragment {
                return Err(Error::ProtocolViolation("fragmented control frame"));
            }
            if length > MAX_CONTROL_PAYLOAD {
                return Err(Error::ProtocolViolation(
                    "control frame payload larger than 125 bytes",
                ));
            }
        }

        // Continuation frames only make sense mid-message, and a fresh data
        // frame can't preempt a fragmented message in flight.
        match opcode {
            OpCode::Continue if !fragmented_in_progress => {
                return Err(Error::UnexpectedContinuation)
            }
            OpCode::Text | OpCode::Binary if fragmented_in_progress => {
                return Err(Error::FragmentedInProgress)
            }
            _ => {}
        }

        // Frames travel unmasked from server to client; a masked frame here
        // means the peer is confused about its role.
        if masked {
            return Err(Error::MaskedServerFrame);
        }

        let mut payload = BytesMut::zeroed(length);
        if length > 0 {
            self.read_exact(&mut payload).await?;
            self.bytes_read += length as u64;
        }

        Ok(Some(Frame::new(final_fragment, opcode, rsv, payload)))
    }

    // EOF after the first header byte means the peer vanished mid-frame,
    // which is a framing error rather than a clean end of stream.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.buf_reader.read_exact(buf).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::ReceiveFailed("stream ended inside a frame")
            } else {
                Error::from(e)
            }
        })?;
        Ok(())
    }
}
