//! Fuzz target: `FrameDecoder::feed`
//!
//! Drives arbitrary byte sequences through the line decoder, split at a
//! fuzzer-chosen point, and checks that frames never exceed the configured
//! size and that a split stream decodes like a whole one.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use libfuzzer_sys::fuzz_target;
use sparkhost::rpc::codec::{FrameDecoder, FrameEvent};

const MAX_FRAME: usize = 256;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };

    let mut whole = FrameDecoder::new(MAX_FRAME);
    let expected: Vec<FrameEvent> = whole.feed(rest).collect();
    for event in &expected {
        if let FrameEvent::Frame(frame) = event {
            assert!(frame.payload().len() <= MAX_FRAME, "frame exceeds limit");
        }
    }

    let at = usize::from(split).min(rest.len());
    let mut chunked = FrameDecoder::new(MAX_FRAME);
    let mut events: Vec<FrameEvent> = chunked.feed(&rest[..at]).collect();
    events.extend(chunked.feed(&rest[at..]));
    assert_eq!(events, expected, "chunking changed the decoded stream");
});
