//! Fuzz target: `FrameDecoder::feed`
//!
//! Drives arbitrary byte sequences into the streaming RX decoder, split at
//! an arbitrary point, and checks that every decoded frame respects the
//! bulk limit and re-encodes to the same bytes.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use scphost::msg::codec::{FrameDecoder, decode_frame, encode_frame};

const MAX_BULK: u32 = 4096;

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |&b| b as usize).min(data.len());
    let mut decoder = FrameDecoder::new(MAX_BULK);
    let mut frames = Vec::new();

    decoder.feed(&data[..split], |f| frames.push(f));
    decoder.feed(&data[split..], |f| frames.push(f));

    for message in frames.into_iter().flatten() {
        assert!(message.payload.len() <= MAX_BULK as usize);
        if let Ok(bytes) = encode_frame(&message) {
            assert_eq!(decode_frame(&bytes, MAX_BULK).ok(), Some(message));
        }
    }

    // After a reset the decoder must accept bytes cleanly again.
    decoder.reset();
    decoder.feed(data, |_| {});
});
