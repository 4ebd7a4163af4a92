use crate::error::Error;
use std::fmt;

/// Maximum UTF-8 length of a close reason: a close payload is capped at 125
/// bytes and the first two carry the code.
pub const MAX_CLOSE_REASON: usize = 123;

/// Checks a close code against the wire rules: 1000-4999, excluding the
/// reserved 1004, the never-on-the-wire 1005/1006, and the unassigned
/// 1015-2999 band.
pub fn is_valid_wire_code(code: u16) -> bool {
    match code {
        1000..=1003 => true,
        1007..=1014 => true,
        3000..=4999 => true,
        _ => false,
    }
}

/// Truncates a close reason to at most 123 UTF-8 bytes, backing up to the
/// nearest char boundary so no codepoint is ever split. Idempotent.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// The close code and reason carried by a close frame, local or remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    code: u16,
    reason: String,
}

impl CloseStatus {
    /// Builds a status destined for the wire; the code must be wire-valid
    /// and the reason is truncated to fit a control frame.
    pub fn new(code: u16, reason: &str) -> Result<Self, Error> {
        if !is_valid_wire_code(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        Ok(Self {
            code,
            reason: truncate_reason(reason).to_owned(),
        })
    }

    /// Status observed locally but never sent, e.g. 1006 for an abnormal
    /// closure. No wire validation.
    pub(crate) fn local(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: truncate_reason(reason).to_owned(),
        }
    }

    /// Parses the payload of a received close frame. An empty payload is the
    /// RFC's "no status present"; a single byte is a protocol violation, and
    /// so are reserved codes or an ill-formed UTF-8 reason.
    pub fn from_payload(payload: &[u8]) -> Result<Option<Self>, Error> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !is_valid_wire_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let reason = std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
                Ok(Some(Self {
                    code,
                    reason: reason.to_owned(),
                }))
            }
        }
    }

    /// Serializes to a close frame payload: 2-byte big-endian code followed
    /// by the UTF-8 reason.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&self.code.to_be_bytes());
        payload.extend_from_slice(self.reason.as_bytes());
        payload
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}
