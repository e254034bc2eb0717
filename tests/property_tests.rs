//! Property-based tests for tandem
//!
//! Uses proptest to check codec, Slic framing and request frame invariants
//! across large input spaces.

use proptest::prelude::*;
use tandem_codec::{EncodingVersion, FormatType, InputStream, OutputStream};

fn encodings() -> impl Strategy<Value = EncodingVersion> {
    prop_oneof![Just(EncodingVersion::V1_0), Just(EncodingVersion::V1_1)]
}

// ============================================================================
// Codec Properties
// ============================================================================

mod codec_properties {
    use super::*;

    proptest! {
        /// Primitives read back as written under both encodings
        #[test]
        fn primitives_roundtrip(
            encoding in encodings(),
            b in any::<bool>(),
            short in any::<i16>(),
            int in any::<i32>(),
            long in any::<i64>(),
            double in any::<f64>().prop_filter("comparable", |d| !d.is_nan()),
            text in ".{0,300}",
        ) {
            let mut out = OutputStream::new(encoding);
            out.write_bool(b);
            out.write_i16(short);
            out.write_i32(int);
            out.write_i64(long);
            out.write_f64(double);
            out.write_string(&text);
            let bytes = out.finish().unwrap();

            let mut input = InputStream::new(&bytes, encoding);
            prop_assert_eq!(input.read_bool().unwrap(), b);
            prop_assert_eq!(input.read_i16().unwrap(), short);
            prop_assert_eq!(input.read_i32().unwrap(), int);
            prop_assert_eq!(input.read_i64().unwrap(), long);
            prop_assert_eq!(input.read_f64().unwrap(), double);
            prop_assert_eq!(input.read_string().unwrap(), text);
            prop_assert!(input.is_empty());
        }

        /// Sizes use one byte up to 254 and five bytes above
        #[test]
        fn size_encoding_length(size in 0usize..=i32::MAX as usize) {
            let mut out = OutputStream::new(EncodingVersion::V1_1);
            out.write_size(size);
            let expected = if size < 255 { 1 } else { 5 };
            prop_assert_eq!(out.len(), expected);

            let bytes = out.finish().unwrap();
            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
            prop_assert_eq!(input.read_size().unwrap(), size);
        }

        /// Varulongs round-trip and never use more than eight bytes
        #[test]
        fn varulong_roundtrip(value in 0u64..=tandem_codec::VARULONG_MAX) {
            let mut out = OutputStream::new(EncodingVersion::V1_1);
            out.write_varulong(value).unwrap();
            prop_assert_eq!(out.len(), tandem_codec::varulong_len(value));
            prop_assert!(out.len() <= 8);

            let bytes = out.finish().unwrap();
            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
            prop_assert_eq!(input.read_varulong().unwrap(), value);
        }

        /// Sequences and dictionaries survive a round trip
        #[test]
        fn collections_roundtrip(
            encoding in encodings(),
            ints in prop::collection::vec(any::<i32>(), 0..64),
            strings in prop::collection::vec("[a-z]{0,12}", 0..16),
            dict in prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..8),
        ) {
            let mut out = OutputStream::new(encoding);
            out.write_i32_seq(&ints);
            out.write_string_seq(&strings);
            out.write_string_dict(&dict);
            let bytes = out.finish().unwrap();

            let mut input = InputStream::new(&bytes, encoding);
            prop_assert_eq!(input.read_i32_seq().unwrap(), ints);
            prop_assert_eq!(input.read_string_seq().unwrap(), strings);
            prop_assert_eq!(input.read_string_dict().unwrap(), dict);
            prop_assert!(input.is_empty());
        }

        /// Optionals read back by tag, skipping the ones not asked for
        #[test]
        fn optionals_skip_unknown_tags(
            first in any::<i32>(),
            second in ".{0,40}",
            third in any::<i64>(),
            ask_second_only in any::<bool>(),
        ) {
            let mut out = OutputStream::new(EncodingVersion::V1_1);
            out.start_encapsulation(EncodingVersion::V1_1, FormatType::Compact).unwrap();
            out.write_i32_opt(1, Some(first)).unwrap();
            out.write_string_opt(5, Some(&second)).unwrap();
            out.write_i64_opt(40, Some(third)).unwrap();
            out.end_encapsulation().unwrap();
            let bytes = out.finish().unwrap();

            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
            input.start_encapsulation().unwrap();
            if ask_second_only {
                prop_assert_eq!(input.read_string_opt(5).unwrap(), Some(second));
            } else {
                prop_assert_eq!(input.read_i32_opt(1).unwrap(), Some(first));
                prop_assert_eq!(input.read_i32_opt(2).unwrap(), None);
                prop_assert_eq!(input.read_string_opt(5).unwrap(), Some(second));
                prop_assert_eq!(input.read_i64_opt(40).unwrap(), Some(third));
            }
            input.end_encapsulation().unwrap();
            prop_assert!(input.is_empty());
        }

        /// An encapsulation's declared size covers exactly its bytes
        #[test]
        fn encapsulation_size_is_exact(
            encoding in encodings(),
            payload in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut out = OutputStream::new(EncodingVersion::V1_1);
            out.start_encapsulation(encoding, FormatType::Compact).unwrap();
            out.write_byte_seq(&payload);
            out.end_encapsulation().unwrap();
            let bytes = out.finish().unwrap();

            let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            prop_assert_eq!(declared as usize, bytes.len());

            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
            let (whole, read_encoding) = input.read_encapsulation_bytes().unwrap();
            prop_assert_eq!(whole.len(), bytes.len());
            prop_assert_eq!(read_encoding, encoding);
            prop_assert!(input.is_empty());
        }

        /// Declared sizes below the six header bytes are rejected
        #[test]
        fn short_encapsulation_size_rejected(declared in i32::MIN..6i32) {
            let mut out = OutputStream::new(EncodingVersion::V1_1);
            out.write_empty_encapsulation(EncodingVersion::V1_1);
            let mut bytes = out.finish().unwrap().to_vec();
            bytes[..4].copy_from_slice(&declared.to_le_bytes());

            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
            prop_assert!(input.start_encapsulation().is_err());
            let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
            prop_assert!(input.read_encapsulation_bytes().is_err());
        }

        /// Arbitrary bytes never panic the reader
        #[test]
        fn garbage_never_panics(
            encoding in encodings(),
            data in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut input = InputStream::new(&data, encoding);
            if input.start_encapsulation().is_ok() {
                let _ = input.read_string();
                let _ = input.read_string_dict();
                let _ = input.end_encapsulation();
            }
            let mut input = InputStream::new(&data, encoding);
            let _ = input.read_proxy();
        }
    }
}

// ============================================================================
// Slic Frame Properties
// ============================================================================

mod frame_properties {
    use super::*;
    use tandem_core::slic::{FrameType, decode_header, encode_header};

    const MAX_FRAME: usize = i32::MAX as usize;

    fn stream_types() -> impl Strategy<Value = FrameType> {
        prop_oneof![
            Just(FrameType::Stream),
            Just(FrameType::StreamLast),
            Just(FrameType::StreamReset),
            Just(FrameType::StreamUnidirectionalFin),
        ]
    }

    fn control_types() -> impl Strategy<Value = FrameType> {
        prop_oneof![
            Just(FrameType::Initialize),
            Just(FrameType::InitializeAck),
            Just(FrameType::Version),
            Just(FrameType::Ping),
            Just(FrameType::Pong),
        ]
    }

    proptest! {
        /// Stream frame headers round-trip, and the declared size counts the stream ID
        #[test]
        fn stream_header_roundtrip(
            frame_type in stream_types(),
            stream_id in 0u64..=tandem_codec::VARULONG_MAX,
            payload_len in 0usize..1_000_000,
        ) {
            let header = encode_header(frame_type, Some(stream_id), payload_len).unwrap();
            let (decoded, used) = decode_header(&header, MAX_FRAME).unwrap().unwrap();
            prop_assert_eq!(used, header.len());
            prop_assert_eq!(decoded.frame_type, frame_type);
            prop_assert_eq!(decoded.stream_id, Some(stream_id));
            prop_assert_eq!(decoded.payload_len, payload_len);
        }

        /// Connection-level frames carry no stream ID
        #[test]
        fn control_header_roundtrip(
            frame_type in control_types(),
            payload_len in 0usize..1_000_000,
        ) {
            let header = encode_header(frame_type, None, payload_len).unwrap();
            let (decoded, used) = decode_header(&header, MAX_FRAME).unwrap().unwrap();
            prop_assert_eq!(used, header.len());
            prop_assert_eq!(decoded.stream_id, None);
            prop_assert_eq!(decoded.payload_len, payload_len);
            prop_assert!(encode_header(frame_type, Some(0), payload_len).is_err());
        }

        /// Every strict prefix of a header asks for more bytes
        #[test]
        fn header_prefix_needs_more(
            stream_id in 0u64..=tandem_codec::VARULONG_MAX,
            payload_len in 0usize..100_000,
        ) {
            let header = encode_header(FrameType::Stream, Some(stream_id), payload_len).unwrap();
            for end in 0..header.len() {
                prop_assert!(decode_header(&header[..end], MAX_FRAME).unwrap().is_none());
            }
        }

        /// Sizes above the limit are rejected whatever the frame type
        #[test]
        fn oversized_frames_rejected(
            max in 1usize..10_000,
            extra in 1usize..10_000,
        ) {
            let header = encode_header(FrameType::Ping, None, max + extra).unwrap();
            prop_assert!(decode_header(&header, max).is_err());
        }

        /// Arbitrary bytes never panic the header decoder
        #[test]
        fn header_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..16)) {
            let _ = decode_header(&data, 1 << 20);
        }
    }
}

// ============================================================================
// Request Frame Properties
// ============================================================================

mod request_properties {
    use super::*;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use tandem_codec::Identity;
    use tandem_core::{IncomingRequest, OutgoingRequest, encapsulate};

    proptest! {
        /// Every request field survives encoding, and the payload is the
        /// encapsulation as written
        #[test]
        fn request_fields_survive(
            name in "[a-zA-Z0-9]{1,16}",
            category in "[a-z]{0,8}",
            facet in proptest::option::of("[a-z]{1,8}"),
            operation in "[a-zA-Z]{1,24}",
            idempotent in any::<bool>(),
            oneway in any::<bool>(),
            context in prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,10}", 0..4),
            body in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let payload = encapsulate(|out| {
                out.write_byte_seq(&body);
                Ok(())
            })
            .unwrap();

            let mut request = OutgoingRequest::new(
                Identity::with_category(name.clone(), category.clone()),
                operation.clone(),
                payload.clone(),
            );
            if let Some(facet) = &facet {
                request = request.with_facet(facet.clone());
            }
            for (key, value) in &context {
                request = request.with_context(key.clone(), value.clone());
            }
            if idempotent {
                request = request.idempotent();
            }
            let frame: Bytes = request.encode().unwrap();

            let decoded = IncomingRequest::decode(&frame, oneway).unwrap();
            prop_assert_eq!(&decoded.identity, &Identity::with_category(name, category));
            prop_assert_eq!(&decoded.facet, &facet);
            prop_assert_eq!(decoded.operation.as_str(), operation.as_str());
            prop_assert_eq!(decoded.idempotent, idempotent);
            prop_assert_eq!(decoded.oneway, oneway);
            prop_assert_eq!(&decoded.context, &context.into_iter().collect::<BTreeMap<_, _>>());
            prop_assert_eq!(&decoded.payload, &payload);

            let read = decoded.read_payload(|input| Ok(input.read_byte_seq()?.to_vec())).unwrap();
            prop_assert_eq!(read, body);
        }

        /// Truncated request frames are errors, never panics
        #[test]
        fn truncated_requests_rejected(cut in 0usize..64) {
            let request = OutgoingRequest::new(
                Identity::new("target"),
                "operation",
                encapsulate(|out| {
                    out.write_string("argument");
                    Ok(())
                })
                .unwrap(),
            );
            let frame = request.encode().unwrap();
            let cut = cut.min(frame.len() - 1);
            prop_assert!(IncomingRequest::decode(&frame.slice(..cut), false).is_err());
        }
    }
}
