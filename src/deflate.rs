use crate::config::DeflateOptions;
use crate::error::Error;
use crate::extensions::{Extension, ExtensionFactory, ExtensionParam};
use crate::frame::{OpCode, RSV1};
use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// The empty stored block a Sync flush appends; stripped from outbound
/// payloads and re-appended before inflation, per RFC 7692.
const DEFLATE_TRAILER: [u8; 4] = [0, 0, 255, 255];

fn calculate_buffer_size(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096 // 4 KB for small payloads
    } else if payload_size <= 65536 {
        16384 // 16 KB for medium payloads
    } else {
        65536 // 64 KB for large payloads
    }
}

/// Factory for the RFC 7692 permessage-deflate extension. Only the v1
/// no-context-takeover mode is implemented, so every message compresses
/// and inflates with a fresh context.
pub struct PerMessageDeflate {
    options: DeflateOptions,
}

impl PerMessageDeflate {
    pub fn new(options: DeflateOptions) -> Result<Self, Error> {
        options.validate()?;
        Ok(Self { options })
    }
}

impl ExtensionFactory for PerMessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn offer(&self) -> String {
        let mut offer = format!(
            "{}; {}; {}",
            PERMESSAGE_DEFLATE, CLIENT_NO_CONTEXT_TAKEOVER, SERVER_NO_CONTEXT_TAKEOVER
        );
        if self.options.client_max_window_bits < 15 {
            offer.push_str(&format!(
                "; {}={}",
                CLIENT_MAX_WINDOW_BITS, self.options.client_max_window_bits
            ));
        } else {
            // A bare parameter signals the server may pick any window.
            offer.push_str(&format!("; {}", CLIENT_MAX_WINDOW_BITS));
        }
        if self.options.server_max_window_bits < 15 {
            offer.push_str(&format!(
                "; {}={}",
                SERVER_MAX_WINDOW_BITS, self.options.server_max_window_bits
            ));
        }
        offer
    }

    fn accept(&self, params: &[ExtensionParam]) -> Result<Box<dyn Extension>, Error> {
        let mut client_bits = self.options.client_max_window_bits;
        let mut server_bits = self.options.server_max_window_bits;
        let mut server_no_context_takeover = false;
        let mut seen: Vec<&str> = Vec::new();

        for param in params {
            if seen.contains(&param.name.as_str()) {
                return Err(Error::ExtensionNegotiationFailed(format!(
                    "duplicate permessage-deflate parameter `{}`",
                    param.name
                )));
            }
            match param.name.as_str() {
                SERVER_NO_CONTEXT_TAKEOVER => server_no_context_takeover = true,
                // We always reset our compressor between messages, so the
                // server demanding it costs nothing.
                CLIENT_NO_CONTEXT_TAKEOVER => {}
                SERVER_MAX_WINDOW_BITS => {
                    let bits = parse_window_bits(param)?;
                    if bits > self.options.server_max_window_bits {
                        return Err(Error::ExtensionNegotiationFailed(format!(
                            "server_max_window_bits {} exceeds the offered {}",
                            bits, self.options.server_max_window_bits
                        )));
                    }
                    server_bits = bits;
                }
                CLIENT_MAX_WINDOW_BITS => {
                    let bits = parse_window_bits(param)?;
                    if bits > self.options.client_max_window_bits {
                        return Err(Error::ExtensionNegotiationFailed(format!(
                            "client_max_window_bits {} exceeds the offered {}",
                            bits, self.options.client_max_window_bits
                        )));
                    }
                    client_bits = bits;
                }
                other => {
                    return Err(Error::ExtensionNegotiationFailed(format!(
                        "unknown permessage-deflate parameter `{}`",
                        other
                    )))
                }
            }
            seen.push(param.name.as_str());
        }

        if self.options.require_server_no_context_takeover && !server_no_context_takeover {
            return Err(Error::ExtensionNegotiationFailed(
                "server did not acknowledge server_no_context_takeover".into(),
            ));
        }

        // zlib cannot emit an 8-bit LZ77 window; like every zlib-backed
        // endpoint, a negotiated 8 runs as 9. A 9-bit inflater still reads
        // streams compressed with 8.
        Ok(Box::new(DeflateExtension {
            level: Compression::new(self.options.compression_level),
            client_bits: client_bits.max(9),
            server_bits: server_bits.max(9),
            compression_threshold: self.options.compression_threshold,
        }))
    }
}

fn parse_window_bits(param: &ExtensionParam) -> Result<u8, Error> {
    let value = param.value.as_deref().ok_or(Error::InvalidMaxWindowBits)?;
    let bits = value.parse::<u8>().map_err(|_| Error::InvalidMaxWindowBits)?;
    if !(8..=15).contains(&bits) {
        return Err(Error::InvalidMaxWindowBits);
    }
    Ok(bits)
}

struct DeflateExtension {
    level: Compression,
    client_bits: u8,
    server_bits: u8,
    compression_threshold: usize,
}

impl Extension for DeflateExtension {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn rsv_mask(&self) -> u8 {
        RSV1
    }

    fn encode(&mut self, opcode: OpCode, payload: BytesMut) -> Result<(BytesMut, u8), Error> {
        if !opcode.is_data() || payload.len() < self.compression_threshold {
            return Ok((payload, 0));
        }
        let compressed = self.compress(&payload)?;
        Ok((compressed, RSV1))
    }

    fn decode(
        &mut self,
        opcode: OpCode,
        rsv: u8,
        payload: BytesMut,
        max_message_size: usize,
    ) -> Result<BytesMut, Error> {
        if rsv & RSV1 == 0 {
            return Ok(payload);
        }
        if !opcode.is_data() {
            return Err(Error::ProtocolViolation("RSV1 set on a control frame"));
        }
        self.inflate(&payload, max_message_size)
    }

    fn reset(&mut self) {
        // No-context-takeover: every message already runs on a fresh
        // compressor and decompressor, nothing carries over.
    }
}

impl DeflateExtension {
    fn compress(&self, payload: &[u8]) -> Result<BytesMut, Error> {
        let mut compressor =
            Compress::new_with_window_bits(self.level, false, self.client_bits);
        let mut output: Vec<u8> = Vec::with_capacity(payload.len() / 2 + 64);

        loop {
            let consumed = compressor.total_in() as usize;
            let before_in = compressor.total_in();
            let before_out = compressor.total_out();

            if output.capacity() == output.len() {
                output.reserve(calculate_buffer_size(payload.len() - consumed));
            }
            compressor
                .compress_vec(&payload[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::CompressionFailed(e.to_string()))?;

            if compressor.total_in() as usize == payload.len()
                && output.ends_with(&DEFLATE_TRAILER)
            {
                break;
            }
            if compressor.total_in() == before_in && compressor.total_out() == before_out {
                return Err(Error::CompressionFailed(
                    "deflate made no progress".to_string(),
                ));
            }
        }

        // The Sync flush always terminates with the empty stored block;
        // RFC 7692 frames travel without it.
        output.truncate(output.len() - DEFLATE_TRAILER.len());
        Ok(BytesMut::from(&output[..]))
    }

    fn inflate(&self, payload: &[u8], max_message_size: usize) -> Result<BytesMut, Error> {
        let mut input = BytesMut::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut decompressor = Decompress::new_with_window_bits(false, self.server_bits);
        let initial = calculate_buffer_size(payload.len()).min(max_message_size.saturating_add(1));
        let mut output: Vec<u8> = Vec::with_capacity(initial);

        loop {
            let consumed = decompressor.total_in() as usize;
            if consumed >= input.len() {
                break;
            }
            let before_in = decompressor.total_in();
            let before_out = decompressor.total_out();

            // The budget is enforced before growing the buffer: reserve at
            // most one byte past the cap so an overrun is detected without
            // unbounded allocation.
            if output.capacity() == output.len() {
                let budget = max_message_size.saturating_sub(output.len()).saturating_add(1);
                output.reserve(budget.min(calculate_buffer_size(input.len())));
            }
            let status = decompressor
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::DecompressionFailed(e.to_string()))?;

            if output.len() > max_message_size {
                return Err(Error::DecompressedMessageTooLarge {
                    limit: max_message_size,
                });
            }
            match status {
                Status::StreamEnd => break,
                _ => {
                    if decompressor.total_in() == before_in
                        && decompressor.total_out() == before_out
                    {
                        return Err(Error::DecompressionFailed(
                            "inflate made no progress on a truncated stream".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(BytesMut::from(&output[..]))
    }
}
