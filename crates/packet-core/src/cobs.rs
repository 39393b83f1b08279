//! COBS framing codec.
//!
//! The firmware emits packets through Consistent Overhead Byte Stuffing so
//! that `0x00` never appears inside a frame and can serve as the on-wire
//! delimiter. This module is the host-side inverse, plus the encoder used by
//! the emulator and the round-trip tests.
//!
//! A frame arrives here with the trailing `0x00` delimiter already stripped.
//! Resynchronisation after a malformed frame is the framer's job (the next
//! delimiter restarts it); the decoder only reports the malformation.

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Ways a stripped frame can fail COBS decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CobsError {
    /// A chunk started with the code byte `0x00`, which COBS never produces.
    #[error("zero code byte at offset {offset}")]
    ZeroCode { offset: usize },
    /// A chunk promised more literal bytes than the frame still holds.
    #[error("truncated chunk at offset {offset}: code {code} needs {needed} bytes, {available} remain")]
    Truncated {
        offset: usize,
        code: u8,
        needed: usize,
        available: usize,
    },
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode one stripped COBS frame into its raw payload.
///
/// Chunk rules: a code byte `c` is followed by `c - 1` literal bytes. Every
/// chunk except a full-length one (`c == 0xFF`) implies a `0x00` after its
/// literals, suppressed when the chunk ends the frame. An empty input yields
/// an empty payload; callers drop those silently.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, CobsError> {
    let mut out = Vec::with_capacity(frame.len());
    let mut i = 0usize;
    while i < frame.len() {
        let code = frame[i];
        if code == 0x00 {
            return Err(CobsError::ZeroCode { offset: i });
        }
        let run = code as usize - 1;
        let start = i + 1;
        let available = frame.len() - start;
        if run > available {
            return Err(CobsError::Truncated {
                offset: i,
                code,
                needed: run,
                available,
            });
        }
        out.extend_from_slice(&frame[start..start + run]);
        i = start + run;
        // 0xFF marks a maximal chunk with no implicit zero; any other chunk
        // implies one unless the frame ends here.
        if code != 0xFF && i < frame.len() {
            out.push(0x00);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// COBS-encode `data` into a frame with no interior `0x00` bytes.
///
/// The output does not include the trailing `0x00` delimiter; the transport
/// appends it.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 1);
    let mut code_at = 0usize;
    out.push(0x00);
    let mut code = 1u8;
    for &b in data {
        if b == 0x00 {
            out[code_at] = code;
            code_at = out.len();
            out.push(0x00);
            code = 1;
        } else {
            out.push(b);
            code += 1;
            if code == 0xFF {
                out[code_at] = code;
                code_at = out.len();
                out.push(0x00);
                code = 1;
            }
        }
    }
    out[code_at] = code;
    out
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
