//! Raw-deflate contexts for permessage-deflate (RFC 7692).
//!
//! Compressed message payloads travel without the 4-byte `00 00 FF FF`
//! block that zlib emits on a SYNC flush: the sender strips it, the receiver
//! appends it back before inflating. Both contexts use raw deflate (negative
//! window bits in zlib terms) sized by the negotiated `*_max_window_bits`.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::{debug, error};

use crate::error::{Error, Result};

/// The SYNC-flush trailer stripped from (and re-appended to) every
/// compressed message payload.
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Attempts before giving up on producing a complete SYNC-flush output.
const MAX_COMPRESS_ATTEMPTS: usize = 4;

/// Extra output slack added per attempt beyond the deflate bound.
const ATTEMPT_SLACK: usize = 64;

/// Scratch chunk size for the inflate loop.
const INFLATE_CHUNK: usize = 4096;

/// Parameters negotiated for permessage-deflate during the handshake.
///
/// Defaults correspond to a bare `permessage-deflate` acceptance: context
/// takeover on both sides, 15-bit windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    /// Server resets its compression context after every message.
    pub server_no_context_takeover: bool,
    /// Client (we) reset the compression context after every message.
    pub client_no_context_takeover: bool,
    /// LZ77 window bits for client-to-server compression (8-15).
    pub client_max_window_bits: u8,
    /// LZ77 window bits for server-to-client compression (8-15).
    pub server_max_window_bits: u8,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            client_max_window_bits: 15,
            server_max_window_bits: 15,
        }
    }
}

/// Conservative upper bound on deflate output for `len` input bytes,
/// matching zlib's worst-case formula for stored blocks.
fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

/// Outgoing-message compressor.
pub struct Deflater {
    ctx: Compress,
    level: u32,
    window_bits: u8,
    reset_per_message: bool,
}

impl Deflater {
    /// Create a compressor from the negotiated parameters and the configured
    /// deflate level.
    #[must_use]
    pub fn new(params: &DeflateParams, level: u32) -> Self {
        Self {
            ctx: Compress::new_with_window_bits(
                Compression::new(level),
                false,
                params.client_max_window_bits,
            ),
            level,
            window_bits: params.client_max_window_bits,
            reset_per_message: params.client_no_context_takeover,
        }
    }

    /// Compress one message payload with a SYNC flush and strip the trailer.
    ///
    /// The first attempt sizes the output at the deflate bound plus 64 bytes
    /// of slack; each retry resets the context, re-feeds the input and adds
    /// another 64 bytes. An attempt succeeds only when all input was
    /// consumed and the output ends with `00 00 FF FF`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] when four attempts fail to produce a
    /// complete SYNC-flush output; the caller falls back to sending the
    /// message uncompressed.
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        for attempt in 0..MAX_COMPRESS_ATTEMPTS {
            if attempt > 0 {
                // A failed attempt consumed part of the input; rewind the
                // context so the retry re-feeds the message from the start.
                self.ctx.reset();
            }

            let bound = deflate_bound(input.len()) + ATTEMPT_SLACK * (attempt + 1);
            let mut out = vec![0u8; bound];

            let before_in = self.ctx.total_in();
            let before_out = self.ctx.total_out();
            let status = self
                .ctx
                .compress(input, &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            let consumed = (self.ctx.total_in() - before_in) as usize;
            let produced = (self.ctx.total_out() - before_out) as usize;

            if status == Status::BufError || consumed < input.len() || produced < 4 {
                debug!(
                    "deflate attempt {} incomplete (consumed {}/{}, produced {})",
                    attempt + 1,
                    consumed,
                    input.len(),
                    produced
                );
                continue;
            }

            if out[produced - 4..produced] != DEFLATE_TRAILER {
                // Output space ran out before the flush block was emitted.
                continue;
            }

            out.truncate(produced - 4);

            if self.reset_per_message {
                self.reinit();
            }
            return Ok(out);
        }

        error!("deflate produced no complete SYNC_FLUSH output after {MAX_COMPRESS_ATTEMPTS} attempts");
        Err(Error::Compression(
            "no complete SYNC_FLUSH output".to_string(),
        ))
    }

    /// Full teardown and re-creation of the context, used when
    /// `client_no_context_takeover` was negotiated.
    fn reinit(&mut self) {
        self.ctx = Compress::new_with_window_bits(
            Compression::new(self.level),
            false,
            self.window_bits,
        );
    }
}

/// Incoming-message decompressor.
pub struct Inflater {
    ctx: Decompress,
    reset_per_message: bool,
    max_output: usize,
}

impl Inflater {
    /// Create a decompressor from the negotiated parameters. `max_output`
    /// bounds the inflated size of a single message.
    #[must_use]
    pub fn new(params: &DeflateParams, max_output: usize) -> Self {
        Self {
            ctx: Decompress::new_with_window_bits(false, params.server_max_window_bits),
            reset_per_message: params.server_no_context_takeover,
            max_output,
        }
    }

    /// Inflate one message payload (which omits the SYNC-flush trailer).
    ///
    /// The trailer is appended, then the input is inflated through a fixed
    /// 4 KiB scratch buffer. The loop ends on stream end, or once all input
    /// is consumed and the scratch did not fill; a `BufError` with input
    /// remaining and scratch space free is a stall and fails the message.
    ///
    /// # Errors
    ///
    /// - [`Error::Decompression`] on corrupt input or a stall (close 1007).
    /// - [`Error::MessageTooLarge`] when the inflated size exceeds the
    ///   configured bound (close 1009).
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut src = Vec::with_capacity(input.len() + DEFLATE_TRAILER.len());
        src.extend_from_slice(input);
        src.extend_from_slice(&DEFLATE_TRAILER);

        let mut out = Vec::with_capacity(input.len().saturating_mul(2).clamp(64, INFLATE_CHUNK));
        let mut scratch = [0u8; INFLATE_CHUNK];
        let mut pos = 0usize;

        loop {
            let before_in = self.ctx.total_in();
            let before_out = self.ctx.total_out();
            let status = self
                .ctx
                .decompress(&src[pos..], &mut scratch, FlushDecompress::Sync)
                .map_err(|e| Error::Decompression(e.to_string()))?;
            let consumed = (self.ctx.total_in() - before_in) as usize;
            let produced = (self.ctx.total_out() - before_out) as usize;

            pos += consumed;
            out.extend_from_slice(&scratch[..produced]);
            if out.len() > self.max_output {
                return Err(Error::MessageTooLarge {
                    size: out.len(),
                    max: self.max_output,
                });
            }

            let input_done = pos == src.len();
            let scratch_had_room = produced < scratch.len();

            match status {
                Status::StreamEnd => break,
                Status::BufError => {
                    if !scratch_had_room {
                        continue;
                    }
                    if input_done {
                        break;
                    }
                    error!(
                        "inflate stalled ({} input bytes unconsumed)",
                        src.len() - pos
                    );
                    return Err(Error::Decompression("inflate made no progress".to_string()));
                }
                Status::Ok => {
                    if input_done && scratch_had_room {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    /// Apply the negotiated context-takeover policy after a completed
    /// message: an `inflateReset` when the server discards its context.
    pub fn finish_message(&mut self) {
        if self.reset_per_message {
            self.ctx.reset(false);
        }
    }
}
