use crate::error::Error;
use crate::frame::{OpCode, RSV_MASK};
use bytes::BytesMut;
use log::debug;
use std::sync::Arc;

/// One `token=value` (or bare `token`) parameter of an extension entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    pub name: String,
    pub value: Option<String>,
}

/// One comma-separated entry of a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEntry {
    pub name: String,
    pub params: Vec<ExtensionParam>,
}

/// Parses a `Sec-WebSocket-Extensions` value into ordered entries. Entries
/// are comma-separated, parameters semicolon-separated, values optionally
/// quoted.
pub fn parse_extensions_header(value: &str) -> Vec<ExtensionEntry> {
    let mut entries = Vec::new();
    for entry_str in value.split(',') {
        let mut parts = entry_str.split(';');
        let name = match parts.next() {
            Some(name) if !name.trim().is_empty() => name.trim().to_ascii_lowercase(),
            _ => continue,
        };
        let params = parts
            .map(|param| match param.split_once('=') {
                Some((key, val)) => ExtensionParam {
                    name: key.trim().to_ascii_lowercase(),
                    value: Some(val.trim().trim_matches('"').to_owned()),
                },
                None => ExtensionParam {
                    name: param.trim().to_ascii_lowercase(),
                    value: None,
                },
            })
            .filter(|param| !param.name.is_empty())
            .collect();
        entries.push(ExtensionEntry { name, params });
    }
    entries
}

/// An active, negotiated extension transform. Outbound transforms run in
/// configured order, inbound transforms in reverse; each instance owns all
/// per-connection state and is dropped at finalization.
pub trait Extension: Send {
    fn name(&self) -> &str;

    /// RSV bits this extension is allowed to set and consume; a subset of
    /// 0x70, disjoint from every other active extension.
    fn rsv_mask(&self) -> u8;

    /// Outbound transform. Takes ownership of the payload and returns the
    /// (possibly replaced) payload plus the RSV bits to set on the first
    /// frame of the message.
    fn encode(&mut self, opcode: OpCode, payload: BytesMut) -> Result<(BytesMut, u8), Error>;

    /// Inbound transform. `rsv` carries only the bits of this extension's
    /// mask observed on the message's first fragment.
    fn decode(
        &mut self,
        opcode: OpCode,
        rsv: u8,
        payload: BytesMut,
        max_message_size: usize,
    ) -> Result<BytesMut, Error>;

    /// Drops any in-flight per-message state.
    fn reset(&mut self);
}

impl std::fmt::Debug for dyn Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Configured-but-not-yet-negotiated extension: builds the offer header
/// entry and validates the server's answer into an active transform.
pub trait ExtensionFactory: Send + Sync {
    fn name(&self) -> &str;

    /// The `Sec-WebSocket-Extensions` entry offered for this extension.
    fn offer(&self) -> String;

    /// Accept step of the negotiation; inspects the server's parameters
    /// and, when agreeable, produces the active transform.
    fn accept(&self, params: &[ExtensionParam]) -> Result<Box<dyn Extension>, Error>;
}

/// The ordered set of extensions accepted for one connection, plus the
/// union of their RSV masks (which configures the frame reader).
pub struct ActiveExtensions {
    extensions: Vec<Box<dyn Extension>>,
    rsv_union: u8,
}

impl std::fmt::Debug for ActiveExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveExtensions")
            .field("extensions", &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("rsv_union", &self.rsv_union)
            .finish()
    }
}

impl ActiveExtensions {
    pub fn none() -> Self {
        Self {
            extensions: Vec::new(),
            rsv_union: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn rsv_union(&self) -> u8 {
        self.rsv_union
    }

    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    /// Runs the outbound pipeline in configured order, collecting the RSV
    /// bits for the message's first frame. An extension claiming bits
    /// outside its declared mask, or bits already taken by an earlier
    /// extension, is a fatal violation.
    pub fn encode(
        &mut self,
        opcode: OpCode,
        mut payload: BytesMut,
    ) -> Result<(BytesMut, u8), Error> {
        let mut rsv = 0u8;
        for extension in self.extensions.iter_mut() {
            let (next, bits) = extension.encode(opcode, payload)?;
            if bits & !extension.rsv_mask() != 0 {
                return Err(Error::ProtocolViolation(
                    "extension set RSV bits outside its declared mask",
                ));
            }
            if bits & rsv != 0 {
                return Err(Error::ProtocolViolation(
                    "extension set RSV bits already taken by an earlier extension",
                ));
            }
            rsv |= bits;
            payload = next;
        }
        Ok((payload, rsv))
    }

    /// Runs the inbound pipeline in reverse order, each extension consuming
    /// exactly the bits of its declared mask. Any bit left over afterwards
    /// was never negotiated.
    pub fn decode(
        &mut self,
        opcode: OpCode,
        rsv: u8,
        mut payload: BytesMut,
        max_message_size: usize,
    ) -> Result<BytesMut, Error> {
        let mut residual = rsv & RSV_MASK;
        for extension in self.extensions.iter_mut().rev() {
            let bits = residual & extension.rsv_mask();
            payload = extension.decode(opcode, bits, payload, max_message_size)?;
            residual &= !extension.rsv_mask();
        }
        if residual != 0 {
            return Err(Error::ProtocolViolation(
                "RSV bits set for an extension that was not negotiated",
            ));
        }
        Ok(payload)
    }

    pub fn reset_all(&mut self) {
        for extension in self.extensions.iter_mut() {
            extension.reset();
        }
    }
}

/// Builds the offer entries for the request header, in configured order.
pub fn build_offers(factories: &[Arc<dyn ExtensionFactory>]) -> Vec<String> {
    factories.iter().map(|factory| factory.offer()).collect()
}

/// Stateless negotiation step. Walks the server's response entries in
/// order, matches each against a configured factory, runs its accept step
/// and checks the RSV invariants.
pub fn negotiate(
    factories: &[Arc<dyn ExtensionFactory>],
    response: &[ExtensionEntry],
) -> Result<ActiveExtensions, Error> {
    let mut active: Vec<Box<dyn Extension>> = Vec::new();
    let mut used = vec![false; factories.len()];
    let mut rsv_union = 0u8;

    for entry in response {
        let position = factories
            .iter()
            .position(|factory| factory.name().eq_ignore_ascii_case(&entry.name));
        let index = match position {
            Some(index) => index,
            None => {
                return Err(Error::ExtensionNegotiationFailed(format!(
                    "server accepted unoffered extension `{}`",
                    entry.name
                )))
            }
        };
        if used[index] {
            return Err(Error::ExtensionNegotiationFailed(format!(
                "server accepted extension `{}` twice",
                entry.name
            )));
        }
        used[index] = true;

        let extension = factories[index].accept(&entry.params)?;
        let mask = extension.rsv_mask();
        if mask & !RSV_MASK != 0 {
            return Err(Error::ExtensionNegotiationFailed(format!(
                "extension `{}` declared bits outside the RSV mask",
                entry.name
            )));
        }
        if mask & rsv_union != 0 {
            return Err(Error::ExtensionNegotiationFailed(format!(
                "extension `{}` overlaps RSV bits of an earlier extension",
                entry.name
            )));
        }
        rsv_union |= mask;
        debug!("negotiated extension `{}`, rsv mask {:#04x}", entry.name, mask);
        active.push(extension);
    }

    Ok(ActiveExtensions {
        extensions: active,
        rsv_union,
    })
}
