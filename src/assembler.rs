use crate::error::Error;
use crate::frame::{Frame, OpCode};
use bytes::BytesMut;

/// A complete data message as reassembled off the wire, still carrying the
/// RSV bits of its first fragment for the inbound extension pipeline.
#[derive(Debug)]
pub struct AssembledMessage {
    pub opcode: OpCode,
    pub rsv: u8,
    pub payload: BytesMut,
}

/// What a pushed frame produced.
#[derive(Debug)]
pub enum Assembly {
    /// Ping, Pong or Close, handed through untouched.
    Control(Frame),
    /// A data message completed with this frame.
    Complete(AssembledMessage),
    /// A fragment was staged; more continuations expected.
    Partial,
}

struct FragmentedMessage {
    opcode: OpCode,
    rsv: u8,
    fragments: Vec<BytesMut>,
    total_len: usize,
}

/// Reassembles fragmented messages from the frame stream. Holds at most one
/// message in progress; limits are checked against the projected size
/// before any buffer is grown.
pub struct MessageAssembler {
    fragmented_message: Option<FragmentedMessage>,
    max_message_size: usize,
    max_fragment_count: usize,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize, max_fragment_count: usize) -> Self {
        Self {
            fragmented_message: None,
            max_message_size,
            max_fragment_count,
        }
    }

    /// Whether a fragmented message is currently staged; the frame reader
    /// uses this to judge continuation legality.
    pub fn in_progress(&self) -> bool {
        self.fragmented_message.is_some()
    }

    /// Drops any staged fragments. Called on errors and on terminal close,
    /// so a poisoned half-message never leaks into the next read.
    pub fn reset(&mut self) {
        self.fragmented_message = None;
    }

    pub fn push(&mut self, frame: Frame) -> Result<Assembly, Error> {
        if frame.opcode.is_control() {
            return Ok(Assembly::Control(frame));
        }

        match frame.opcode {
            // A lone FIN frame is a complete message as-is.
            OpCode::Text | OpCode::Binary if frame.final_fragment => {
                if self.fragmented_message.is_some() {
                    self.reset();
                    return Err(Error::FragmentedInProgress);
                }
                self.check_size(frame.payload.len())?;
                Ok(Assembly::Complete(AssembledMessage {
                    opcode: frame.opcode,
                    rsv: frame.rsv,
                    payload: frame.payload,
                }))
            }
            // FIN=0 with a data opcode starts a fragmented message; opcode
            // and RSV bits of this first fragment are what the message
            // reports once complete.
            OpCode::Text | OpCode::Binary => {
                if self.fragmented_message.is_some() {
                    self.reset();
                    return Err(Error::FragmentedInProgress);
                }
                self.check_size(frame.payload.len())?;
                self.fragmented_message = Some(FragmentedMessage {
                    opcode: frame.opcode,
                    rsv: frame.rsv,
                    total_len: frame.payload.len(),
                    fragments: vec![frame.payload],
                });
                Ok(Assembly::Partial)
            }
            OpCode::Continue => {
                let staged = match self.fragmented_message.as_mut() {
                    Some(staged) => staged,
                    None => return Err(Error::UnexpectedContinuation),
                };

                // Both limits are projected before the fragment is staged,
                // so an oversized message never allocates past the cap.
                if staged.fragments.len() + 1 > self.max_fragment_count {
                    self.reset();
                    return Err(Error::FragmentCountExceeded {
                        limit: self.max_fragment_count,
                    });
                }
                let projected = staged.total_len + frame.payload.len();
                if projected > self.max_message_size {
                    let limit = self.max_message_size;
                    self.reset();
                    return Err(Error::MessageTooLarge {
                        size: projected,
                        limit,
                    });
                }

                staged.total_len = projected;
                staged.fragments.push(frame.payload);

                if !frame.final_fragment {
                    return Ok(Assembly::Partial);
                }

                let staged = self
                    .fragmented_message
                    .take()
                    .ok_or(Error::UnexpectedContinuation)?;
                Ok(Assembly::Complete(coalesce(staged)))
            }
            _ => Err(Error::InvalidFrame("control opcode reached the assembler")),
        }
    }

    fn check_size(&mut self, len: usize) -> Result<(), Error> {
        if len > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: len,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

// The one allocation of the reassembly path: staged fragments collapse into
// a single buffer whose lifetime extends to the consumer.
fn coalesce(staged: FragmentedMessage) -> AssembledMessage {
    let mut fragments = staged.fragments.into_iter();
    let payload = match fragments.next() {
        Some(first) if staged.total_len == first.len() => first,
        Some(first) => {
            let mut payload = BytesMut::with_capacity(staged.total_len);
            payload.extend_from_slice(&first);
            for fragment in fragments {
                payload.extend_from_slice(&fragment);
            }
            payload
        }
        None => BytesMut::new(),
    };
    AssembledMessage {
        opcode: staged.opcode,
        rsv: staged.rsv,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Frame {
        Frame::new(fin, opcode, 0, BytesMut::from(payload))
    }

    #[test]
    fn test_lone_frame_is_a_message() {
        let mut assembler = MessageAssembler::new(1024, 8);
        let out = assembler
            .push(data_frame(true, OpCode::Text, b"hello"))
            .unwrap();
        match out {
            Assembly::Complete(message) => {
                assert_eq!(message.opcode, OpCode::Text);
                assert_eq!(&message.payload[..], b"hello");
            }
            other => panic!("expected complete message, got {:?}", other),
        }
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_fragments_reassemble_in_order() {
        let mut assembler = MessageAssembler::new(1024, 8);
        assert!(matches!(
            assembler.push(data_frame(false, OpCode::Text, b"Hel")).unwrap(),
            Assembly::Partial
        ));
        assert!(assembler.in_progress());
        assert!(matches!(
            assembler
                .push(data_frame(false, OpCode::Continue, b"lo, "))
                .unwrap(),
            Assembly::Partial
        ));
        let out = assembler
            .push(data_frame(true, OpCode::Continue, b"World"))
            .unwrap();
        match out {
            Assembly::Complete(message) => {
                assert_eq!(&message.payload[..], b"Hello, World");
                assert_eq!(message.opcode, OpCode::Text);
            }
            other => panic!("expected complete message, got {:?}", other),
        }
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_unsolicited_continuation_rejected() {
        let mut assembler = MessageAssembler::new(1024, 8);
        let err = assembler
            .push(data_frame(true, OpCode::Continue, b"abc"))
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedContinuation));
    }

    #[test]
    fn test_new_data_frame_mid_message_rejected() {
        let mut assembler = MessageAssembler::new(1024, 8);
        assembler.push(data_frame(false, OpCode::Text, b"a")).unwrap();
        let err = assembler
            .push(data_frame(true, OpCode::Text, b"b"))
            .unwrap_err();
        assert!(matches!(err, Error::FragmentedInProgress));
        // Errors reset the staged state.
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_projected_size_checked_before_growth() {
        let mut assembler = MessageAssembler::new(8, 8);
        assembler
            .push(data_frame(false, OpCode::Binary, b"12345"))
            .unwrap();
        let err = assembler
            .push(data_frame(true, OpCode::Continue, b"6789"))
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { size: 9, limit: 8 }));
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_fragment_count_capped() {
        let mut assembler = MessageAssembler::new(1024, 2);
        assembler.push(data_frame(false, OpCode::Text, b"a")).unwrap();
        assembler
            .push(data_frame(false, OpCode::Continue, b"b"))
            .unwrap();
        let err = assembler
            .push(data_frame(true, OpCode::Continue, b"c"))
            .unwrap_err();
        assert!(matches!(err, Error::FragmentCountExceeded { limit: 2 }));
    }

    #[test]
    fn test_control_frames_pass_through_mid_message() {
        let mut assembler = MessageAssembler::new(1024, 8);
        assembler.push(data_frame(false, OpCode::Text, b"a")).unwrap();
        let out = assembler.push(Frame::ping(BytesMut::new())).unwrap();
        assert!(matches!(out, Assembly::Control(_)));
        assert!(assembler.in_progress());
    }
}
