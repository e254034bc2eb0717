//! Fuzz target for Slic frame header decoding
//!
//! The decoder must return a header, ask for more bytes or fail; it must
//! never panic or report more bytes used than it was given.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem_core::slic::decode_header;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((header, used))) = decode_header(data, 1 << 20) {
        assert!(used <= data.len());
        assert_eq!(header.stream_id.is_some(), header.frame_type.has_stream_id());
    }
});
