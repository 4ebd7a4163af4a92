use crate::error::Error;
use crate::frame::{apply_mask, OpCode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWrite, AsyncWriteExt};

// Mask keys are drawn from the CSPRNG in batches to amortize reseeding
// overhead across frames.
const MASK_BATCH: usize = 256;

// Payloads are XORed into a reusable scratch buffer chunk by chunk, so
// large frames never force an allocation proportional to the payload and
// plaintext never reaches the socket buffer.
const SCRATCH_CHUNK: usize = 16 * 1024;

/// Writes masked client frames. Not thread-safe; the connection serializes
/// all writers behind its send lock.
pub struct FrameWriter<W> {
    write_half: W,
    rng: StdRng,
    mask_batch: [u8; MASK_BATCH],
    mask_pos: usize,
    scratch: Vec<u8>,
    fragmentation_threshold: usize,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(write_half: W, fragmentation_threshold: usize) -> Self {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let mut mask_batch = [0u8; MASK_BATCH];
        rng.fill(&mut mask_batch[..]);
        Self {
            write_half,
            rng,
            mask_batch,
            mask_pos: 0,
            scratch: Vec::new(),
            fragmentation_threshold,
            bytes_written: 0,
        }
    }

    /// Total bytes put on the wire so far, headers and mask keys included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn next_mask(&mut self) -> [u8; 4] {
        if self.mask_pos + 4 > MASK_BATCH {
            self.rng.fill(&mut self.mask_batch[..]);
            self.mask_pos = 0;
        }
        let mask = [
            self.mask_batch[self.mask_pos],
            self.mask_batch[self.mask_pos + 1],
            self.mask_batch[self.mask_pos + 2],
            self.mask_batch[self.mask_pos + 3],
        ];
        self.mask_pos += 4;
        mask
    }

    /// Writes one logical message, fragmenting above the threshold: first
    /// fragment keeps the opcode and RSV bits, the rest are continuations
    /// with RSV=0, the last one carries FIN. Returns frames and wire bytes.
    pub async fn write_message(
        &mut self,
        opcode: OpCode,
        rsv: u8,
        payload: &[u8],
    ) -> Result<(usize, u64), Error> {
        if payload.len() <= self.fragmentation_threshold {
            let wire = self.write_frame(true, opcode, rsv, payload).await?;
            return Ok((1, wire));
        }

        let chunks = payload.chunks(self.fragmentation_threshold);
        let total_chunks = chunks.len();
        let mut frames = 0usize;
        let mut wire = 0u64;

        for (i, chunk) in chunks.enumerate() {
            let is_final = i == total_chunks - 1;
            let (chunk_opcode, chunk_rsv) = if i == 0 {
                (opcode, rsv)
            } else {
                (OpCode::Continue, 0)
            };
            wire += self
                .write_frame(is_final, chunk_opcode, chunk_rsv, chunk)
                .await?;
            frames += 1;
        }

        Ok((frames, wire))
    }

    /// Writes a single frame, always masked. Each fragment draws its own
    /// mask key.
    pub async fn write_frame(
        &mut self,
        final_fragment: bool,
        opcode: OpCode,
        rsv: u8,
        payload: &[u8],
    ) -> Result<u64, Error> {
        let mask = self.next_mask();

        // Header layout: FIN|RSV|opcode, then MASK|len7 with the optional
        // 16- or 64-bit big-endian extension, then the 4 mask-key bytes.
        let mut header = [0u8; 14];
        header[0] = (final_fragment as u8) << 7 | rsv | opcode.as_u8();

        let payload_len = payload.len();
        let mut header_len = 2;
        if payload_len <= 125 {
            header[1] = 0b1000_0000 | payload_len as u8;
        } else if payload_len <= 65535 {
            header[1] = 0b1000_0000 | 126;
            header[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
            header_len += 2;
        } else {
            header[1] = 0b1000_0000 | 127;
            header[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
            header_len += 8;
        }
        header[header_len..header_len + 4].copy_from_slice(&mask);
        header_len += 4;

        self.write_all(&header[..header_len]).await?;

        // Mask the payload through the scratch buffer, keeping the XOR
        // stripe aligned across chunks.
        let mut offset = 0;
        while offset < payload_len {
            let take = SCRATCH_CHUNK.min(payload_len - offset);
            self.scratch.clear();
            self.scratch.extend_from_slice(&payload[offset..offset + take]);
            apply_mask(&mut self.scratch, mask, offset);
            let chunk = std::mem::take(&mut self.scratch);
            self.write_all(&chunk).await?;
            self.scratch = chunk;
            offset += take;
        }

        self.write_half
            .flush()
            .await
            .map_err(|source| Error::SendFailed { source })?;

        let wire = (header_len + payload_len) as u64;
        self.bytes_written += wire;
        Ok(wire)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.write_half
            .write_all(buf)
            .await
            .map_err(|source| Error::SendFailed { source })
    }

    /// Best-effort half-close of the underlying stream during teardown.
    pub async fn shutdown(&mut self) {
        let _ = self.write_half.shutdown().await;
    }
}
