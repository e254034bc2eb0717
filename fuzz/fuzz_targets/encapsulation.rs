//! Fuzz target for encapsulation and request frame reading
//!
//! Arbitrary bytes are read as an encapsulation under both encodings and as
//! a request frame; errors are fine, panics are not.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tandem_codec::{EncodingVersion, InputStream, OptionalFormat};
use tandem_core::IncomingRequest;

fuzz_target!(|data: &[u8]| {
    for encoding in [EncodingVersion::V1_0, EncodingVersion::V1_1] {
        let mut input = InputStream::new(data, encoding);
        if let Ok((whole, _)) = input.read_encapsulation_bytes() {
            assert!(whole.len() <= data.len());
        }

        let mut input = InputStream::new(data, encoding);
        if input.start_encapsulation().is_ok() {
            let _ = input.read_string_seq();
            let _ = input.read_optional(3, OptionalFormat::VSize);
            let _ = input.read_proxy();
            let _ = input.end_encapsulation();
        }
    }

    let frame = Bytes::copy_from_slice(data);
    if let Ok(request) = IncomingRequest::decode(&frame, false) {
        let _ = request.read_payload(|input| input.read_string());
    }
});
