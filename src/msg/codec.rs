//! Fixed-header wire codec.
//!
//! Wire format:
//! ```text
//! ┌────────────────────┬──────┬───────┬──────┬──────────────┬──────────┐
//! │ inst:5|bulk:1|cran:2│  id  │ error │ rsvd │ word0 (LE32) │ word1    │
//! │        1B           │  1B  │  1B   │  1B  │ bulk size or │ (LE32)   │
//! │                     │      │       │      │ inline arg   │          │
//! └────────────────────┴──────┴───────┴──────┴──────────────┴──────────┘
//!  followed by `bulk size` payload bytes when the bulk flag is set
//! ```
//!
//! [`encode`]/[`decode`] are pure. [`FrameDecoder`] accumulates FIFO reads
//! into complete frames: a single read may hold part of a header, part of a
//! bulk payload, or several frames back to back.

use crate::error::{ErrorCode, ProtocolError};

use super::message::{Body, Cran, Header, MAX_INSTANCE, Message};

/// Fixed header size.
pub const HEADER_LEN: usize = 12;

const BULK_FLAG: u8 = 0b100;

/// Pack a header into its 12-byte wire form.
pub fn encode(header: &Header) -> Result<[u8; HEADER_LEN], ProtocolError> {
    if header.instance > MAX_INSTANCE {
        return Err(ProtocolError::InvalidInstance(header.instance));
    }

    let mut out = [0u8; HEADER_LEN];
    let bulk = if header.is_bulk() { BULK_FLAG } else { 0 };
    out[0] = (header.instance << 3) | bulk | header.cran as u8;
    out[1] = header.message_id;
    if header.cran == Cran::Response {
        out[2] = header.error.0;
    }

    let (word0, word1) = match header.body {
        Body::Inline([a, b]) => (a, b),
        Body::Bulk { size, arg } => (size, arg),
    };
    out[4..8].copy_from_slice(&word0.to_le_bytes());
    out[8..12].copy_from_slice(&word1.to_le_bytes());
    Ok(out)
}

/// Unpack the fixed header at the start of `frame`.
pub fn decode(frame: &[u8]) -> Result<Header, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedHeader);
    }

    let instance = frame[0] >> 3;
    let cran = Cran::from_bits(frame[0]);
    let error = if cran == Cran::Response {
        ErrorCode(frame[2])
    } else {
        ErrorCode::NONE
    };
    let word0 = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let word1 = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
    let body = if frame[0] & BULK_FLAG != 0 {
        Body::Bulk {
            size: word0,
            arg: word1,
        }
    } else {
        Body::Inline([word0, word1])
    };

    Ok(Header {
        instance,
        cran,
        message_id: frame[1],
        error,
        body,
    })
}

/// Encode a complete message: header followed by its bulk payload.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let declared = message.header.bulk_size();
    if declared as usize != message.payload.len() {
        return Err(ProtocolError::BulkLengthMismatch {
            declared,
            actual: message.payload.len(),
        });
    }

    let header = encode(&message.header)?;
    let mut out = Vec::with_capacity(HEADER_LEN + message.payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&message.payload);
    Ok(out)
}

/// Decode one complete frame held in `frame`.
pub fn decode_frame(frame: &[u8], max_bulk: u32) -> Result<Message, ProtocolError> {
    let header = decode(frame)?;
    let size = header.bulk_size();
    if size > max_bulk {
        return Err(ProtocolError::OversizedBulk(size));
    }
    let payload = &frame[HEADER_LEN..];
    if payload.len() != size as usize {
        return Err(ProtocolError::BulkLengthMismatch {
            declared: size,
            actual: payload.len(),
        });
    }
    Ok(Message {
        header,
        payload: payload.to_vec(),
    })
}

// ── Streaming decoder ────────────────────────────────────────

/// Decoder state machine.
enum DecoderState {
    /// Waiting for header bytes.
    ReadingHeader { collected: usize },
    /// Header received, reading the bulk payload.
    ReadingBulk { header: Header, expected: usize },
}

/// Streaming frame decoder for the RX FIFO.
pub struct FrameDecoder {
    state: DecoderState,
    header_buf: [u8; HEADER_LEN],
    payload: Vec<u8>,
    max_bulk: u32,
}

impl FrameDecoder {
    pub fn new(max_bulk: u32) -> Self {
        Self {
            state: DecoderState::ReadingHeader { collected: 0 },
            header_buf: [0; HEADER_LEN],
            payload: Vec::new(),
            max_bulk,
        }
    }

    /// Feed bytes into the decoder.
    ///
    /// `sink` receives every complete frame found in `data`, in order, and
    /// every framing violation. After a violation the decoder resynchronises
    /// on the next byte as the start of a new header.
    pub fn feed(&mut self, data: &[u8], mut sink: impl FnMut(Result<Message, ProtocolError>)) {
        let mut offset = 0;

        while offset < data.len() {
            match &mut self.state {
                DecoderState::ReadingHeader { collected } => {
                    let needed = HEADER_LEN - *collected;
                    let to_copy = needed.min(data.len() - offset);

                    self.header_buf[*collected..*collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    *collected += to_copy;
                    offset += to_copy;

                    if *collected < HEADER_LEN {
                        continue;
                    }

                    self.state = DecoderState::ReadingHeader { collected: 0 };
                    let header = match decode(&self.header_buf) {
                        Ok(h) => h,
                        Err(e) => {
                            sink(Err(e));
                            continue;
                        }
                    };

                    let size = header.bulk_size();
                    if size > self.max_bulk {
                        sink(Err(ProtocolError::OversizedBulk(size)));
                        continue;
                    }
                    if size == 0 {
                        sink(Ok(Message {
                            header,
                            payload: Vec::new(),
                        }));
                        continue;
                    }

                    self.payload.clear();
                    self.state = DecoderState::ReadingBulk {
                        header,
                        expected: size as usize,
                    };
                }

                DecoderState::ReadingBulk { header, expected } => {
                    let needed = *expected - self.payload.len();
                    let to_copy = needed.min(data.len() - offset);

                    self.payload
                        .extend_from_slice(&data[offset..offset + to_copy]);
                    offset += to_copy;

                    if self.payload.len() == *expected {
                        let header = *header;
                        self.state = DecoderState::ReadingHeader { collected: 0 };
                        sink(Ok(Message {
                            header,
                            payload: core::mem::take(&mut self.payload),
                        }));
                    }
                }
            }
        }
    }

    /// Whether a frame is partially assembled.
    pub fn is_mid_frame(&self) -> bool {
        match self.state {
            DecoderState::ReadingHeader { collected } => collected > 0,
            DecoderState::ReadingBulk { .. } => true,
        }
    }

    /// Reset decoder state (e.g. after a device reset).
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingHeader { collected: 0 };
        self.payload.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────
