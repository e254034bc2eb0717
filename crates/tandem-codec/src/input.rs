//! Input stream: decodes values from a borrowed buffer.
//!
//! Reads never go past the end of the innermost encapsulation. Decoded class
//! instances are stored in the stream's [`ValueGraph`], which the caller takes
//! over once decoding is complete.

use std::collections::BTreeMap;

use crate::decoder::{Decoder10, Decoder11, DecoderState, InstanceDecoder};
use crate::error::{CodecError, Result};
use crate::exception::UserException;
use crate::optional::{self, OPTIONAL_END_MARKER, OptionalFormat};
use crate::output::ENCAPSULATION_HEADER_SIZE;
use crate::proxy::{EndpointData, Identity, InvocationMode, ProxyData};
use crate::value::{TypeRegistry, ValueGraph, ValueId};
use crate::varint;
use crate::version::{EncodingVersion, ProtocolVersion};

/// Default limit on nested class instances
pub const DEFAULT_MAX_CLASS_DEPTH: usize = 100;

/// State of one (possibly implicit) encapsulation being read
#[derive(Debug)]
pub(crate) struct ReadEncaps {
    end: usize,
    pub(crate) encoding: EncodingVersion,
    pub(crate) state: DecoderState,
}

impl ReadEncaps {
    fn new(end: usize, encoding: EncodingVersion) -> Self {
        Self {
            end,
            encoding,
            state: DecoderState::new(encoding),
        }
    }
}

/// Decodes typed data from a byte slice.
#[derive(Debug)]
pub struct InputStream<'a> {
    data: &'a [u8],
    pos: usize,
    base: ReadEncaps,
    encaps: Vec<ReadEncaps>,
    registry: Option<&'a TypeRegistry>,
    pub(crate) graph: ValueGraph,
    max_class_depth: usize,
}

/// Dispatch to the decoder of the current encapsulation's encoding
macro_rules! with_decoder {
    ($input:expr, $method:ident ( $($arg:expr),* )) => {
        if $input.current().encoding == EncodingVersion::V1_0 {
            Decoder10::$method($input, $($arg),*)
        } else {
            Decoder11::$method($input, $($arg),*)
        }
    };
}

impl<'a> InputStream<'a> {
    /// Create a stream over `data` whose top level uses `encoding`
    #[must_use]
    pub fn new(data: &'a [u8], encoding: EncodingVersion) -> Self {
        Self {
            data,
            pos: 0,
            base: ReadEncaps::new(data.len(), encoding),
            encaps: Vec::new(),
            registry: None,
            graph: ValueGraph::new(),
            max_class_depth: DEFAULT_MAX_CLASS_DEPTH,
        }
    }

    /// Use `registry` to instantiate classes and user exceptions
    #[must_use]
    pub fn with_registry(mut self, registry: &'a TypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Limit how deeply class instances may nest
    #[must_use]
    pub fn with_max_class_depth(mut self, depth: usize) -> Self {
        self.max_class_depth = depth;
        self
    }

    pub(crate) fn current(&self) -> &ReadEncaps {
        self.encaps.last().unwrap_or(&self.base)
    }

    pub(crate) fn current_mut(&mut self) -> &mut ReadEncaps {
        match self.encaps.last_mut() {
            Some(encaps) => encaps,
            None => &mut self.base,
        }
    }

    pub(crate) fn registry(&self) -> Option<&'a TypeRegistry> {
        self.registry
    }

    pub(crate) fn max_class_depth(&self) -> usize {
        self.max_class_depth
    }

    /// Encoding of the innermost encapsulation
    #[must_use]
    pub fn encoding(&self) -> EncodingVersion {
        self.current().encoding
    }

    /// Read position in the underlying buffer
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Bytes left in the innermost encapsulation
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.current().end.saturating_sub(self.pos)
    }

    /// Check whether the innermost encapsulation is fully read
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Decoded instances
    #[must_use]
    pub fn graph(&self) -> &ValueGraph {
        &self.graph
    }

    /// Decoded instances, mutably
    pub fn graph_mut(&mut self) -> &mut ValueGraph {
        &mut self.graph
    }

    /// Take the decoded instances, leaving an empty graph
    pub fn take_graph(&mut self) -> ValueGraph {
        std::mem::take(&mut self.graph)
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Borrow the next `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedEnd` past the end of the encapsulation.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(CodecError::UnexpectedEnd {
                needed: len,
                remaining,
            });
        }
        let data = self.data;
        let bytes = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    /// Skip `len` bytes
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a boolean; any non-zero byte is `true`
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a 16-bit integer
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    /// Read a 32-bit integer
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Read a 64-bit integer
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Read a 32-bit float
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Read a 64-bit float
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Read a size.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidSize` for a negative extended size.
    pub fn read_size(&mut self) -> Result<usize> {
        let first = self.read_u8()?;
        if first < 0xFF {
            return Ok(usize::from(first));
        }
        let size = self.read_i32()?;
        usize::try_from(size).map_err(|_| CodecError::InvalidSize(i64::from(size)))
    }

    /// Skip a size
    pub fn skip_size(&mut self) -> Result<()> {
        self.read_size().map(|_| ())
    }

    /// Read a variable-length unsigned integer
    pub fn read_varulong(&mut self) -> Result<u64> {
        let remaining = &self.data[self.pos..self.current().end.max(self.pos)];
        let (value, len) = varint::decode_varulong(remaining)?;
        self.pos += len;
        Ok(value)
    }

    /// Read a size-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    // ------------------------------------------------------------------
    // Encapsulations
    // ------------------------------------------------------------------

    fn read_encapsulation_header(&mut self) -> Result<(usize, EncodingVersion)> {
        let size = self.read_i32()?;
        if size < ENCAPSULATION_HEADER_SIZE as i32 {
            return Err(CodecError::InvalidEncapsulation(
                format!("encapsulation size {size} is below the 6-byte header").into(),
            ));
        }
        let body = size as usize - 4;
        if body > self.remaining() {
            return Err(CodecError::UnexpectedEnd {
                needed: body,
                remaining: self.remaining(),
            });
        }
        let major = self.read_u8()?;
        let minor = self.read_u8()?;
        Ok((size as usize, EncodingVersion::new(major, minor)))
    }

    /// Enter an encapsulation and return its encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is malformed, overruns the enclosing
    /// region or names an unsupported encoding.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion> {
        let start = self.pos;
        let (size, encoding) = self.read_encapsulation_header()?;
        if !encoding.is_supported() {
            return Err(CodecError::UnsupportedEncoding(encoding));
        }
        self.encaps.push(ReadEncaps::new(start + size, encoding));
        Ok(encoding)
    }

    /// Leave the innermost encapsulation.
    ///
    /// Unread 1.1 optionals are skipped first; any other leftover bytes are
    /// an error (the 1.0 encoding tolerates a single trailing byte).
    pub fn end_encapsulation(&mut self) -> Result<()> {
        if self.encaps.is_empty() {
            return Err(CodecError::misuse("no encapsulation to end"));
        }
        if self.encoding().supports_optionals() {
            self.skip_optionals()?;
        }
        let end = self.current().end;
        if self.pos != end {
            if self.encoding().supports_optionals() || self.pos + 1 != end {
                return Err(CodecError::InvalidEncapsulation(
                    format!("{} byte(s) left unread", end - self.pos).into(),
                ));
            }
            self.pos = end;
        }
        if let Some(encaps) = self.encaps.pop() {
            encaps.state.check_finished()?;
        }
        Ok(())
    }

    /// Skip an encapsulation and return its encoding
    pub fn skip_encapsulation(&mut self) -> Result<EncodingVersion> {
        let start = self.pos;
        let (size, encoding) = self.read_encapsulation_header()?;
        self.pos = start + size;
        Ok(encoding)
    }

    /// Skip an encapsulation expected to hold no data.
    ///
    /// A 1.1 encapsulation may still carry optionals, which are ignored.
    pub fn skip_empty_encapsulation(&mut self) -> Result<EncodingVersion> {
        let start = self.pos;
        let (size, encoding) = self.read_encapsulation_header()?;
        if encoding == EncodingVersion::V1_0 && size != ENCAPSULATION_HEADER_SIZE {
            return Err(CodecError::InvalidEncapsulation(
                "1.0 encapsulation is not empty".into(),
            ));
        }
        self.pos = start + size;
        Ok(encoding)
    }

    /// Borrow a whole encapsulation, header included, without decoding it
    pub fn read_encapsulation_bytes(&mut self) -> Result<(&'a [u8], EncodingVersion)> {
        let start = self.pos;
        let (size, encoding) = self.read_encapsulation_header()?;
        self.pos = start + size;
        Ok((&self.data[start..start + size], encoding))
    }

    // ------------------------------------------------------------------
    // Sequences and dictionaries
    // ------------------------------------------------------------------

    /// Read a sequence size, checking that `size * min_element_size` bytes
    /// can still be available.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidSize` if the sequence cannot fit.
    pub fn read_and_check_seq_size(&mut self, min_element_size: usize) -> Result<usize> {
        let size = self.read_size()?;
        if size.saturating_mul(min_element_size) > self.remaining() {
            return Err(CodecError::InvalidSize(size as i64));
        }
        Ok(size)
    }

    /// Borrow a byte sequence
    pub fn read_byte_seq(&mut self) -> Result<&'a [u8]> {
        let size = self.read_and_check_seq_size(1)?;
        self.read_bytes(size)
    }

    /// Read a boolean sequence
    pub fn read_bool_seq(&mut self) -> Result<Vec<bool>> {
        self.read_seq(1, Self::read_bool)
    }

    /// Read a 16-bit integer sequence
    pub fn read_i16_seq(&mut self) -> Result<Vec<i16>> {
        self.read_seq(2, Self::read_i16)
    }

    /// Read a 32-bit integer sequence
    pub fn read_i32_seq(&mut self) -> Result<Vec<i32>> {
        self.read_seq(4, Self::read_i32)
    }

    /// Read a 64-bit integer sequence
    pub fn read_i64_seq(&mut self) -> Result<Vec<i64>> {
        self.read_seq(8, Self::read_i64)
    }

    /// Read a 32-bit float sequence
    pub fn read_f32_seq(&mut self) -> Result<Vec<f32>> {
        self.read_seq(4, Self::read_f32)
    }

    /// Read a 64-bit float sequence
    pub fn read_f64_seq(&mut self) -> Result<Vec<f64>> {
        self.read_seq(8, Self::read_f64)
    }

    /// Read a string sequence
    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        self.read_seq(1, Self::read_string)
    }

    /// Read a sequence whose elements occupy at least `min_element_size` bytes
    pub fn read_seq<T, F>(&mut self, min_element_size: usize, mut read_element: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let size = self.read_and_check_seq_size(min_element_size)?;
        let mut values = Vec::with_capacity(size);
        for _ in 0..size {
            values.push(read_element(self)?);
        }
        Ok(values)
    }

    /// Read a dictionary into a `BTreeMap`; later duplicates replace earlier keys
    pub fn read_dict<K, V, F>(&mut self, min_entry_size: usize, mut read_entry: F) -> Result<BTreeMap<K, V>>
    where
        K: Ord,
        F: FnMut(&mut Self) -> Result<(K, V)>,
    {
        let size = self.read_and_check_seq_size(min_entry_size)?;
        let mut dict = BTreeMap::new();
        for _ in 0..size {
            let (key, value) = read_entry(self)?;
            dict.insert(key, value);
        }
        Ok(dict)
    }

    /// Read a string to string dictionary
    pub fn read_string_dict(&mut self) -> Result<BTreeMap<String, String>> {
        self.read_dict(2, |input| Ok((input.read_string()?, input.read_string()?)))
    }

    // ------------------------------------------------------------------
    // Enums and proxies
    // ------------------------------------------------------------------

    /// Read an enumerator and check it against `max_value`
    pub fn read_enum(&mut self, max_value: i32) -> Result<i32> {
        let value = if self.encoding() == EncodingVersion::V1_0 {
            if max_value < 127 {
                i32::from(self.read_u8()?)
            } else if max_value < 32767 {
                i32::from(self.read_i16()?)
            } else {
                self.read_i32()?
            }
        } else {
            i32::try_from(self.read_size()?).map_err(|_| CodecError::invalid("enumerator out of range"))?
        };
        if value < 0 || value > max_value {
            return Err(CodecError::invalid(format!("enumerator {value} out of range")));
        }
        Ok(value)
    }

    /// Read a proxy; the null proxy decodes as `None`
    pub fn read_proxy(&mut self) -> Result<Option<ProxyData>> {
        let name = self.read_string()?;
        let category = self.read_string()?;
        if name.is_empty() {
            return Ok(None);
        }
        let mut proxy = ProxyData::new(Identity::with_category(name, category));
        proxy.facet = match self.read_and_check_seq_size(1)? {
            0 => String::new(),
            1 => self.read_string()?,
            n => {
                return Err(CodecError::invalid(format!(
                    "facet path with {n} elements"
                )));
            }
        };
        let mode = self.read_u8()?;
        proxy.mode = InvocationMode::from_u8(mode)
            .ok_or_else(|| CodecError::invalid(format!("invalid invocation mode {mode}")))?;
        proxy.secure = self.read_bool()?;
        if self.encoding() == EncodingVersion::V1_0 {
            proxy.protocol = ProtocolVersion::ICE1;
            proxy.encoding = EncodingVersion::V1_0;
        } else {
            proxy.protocol = ProtocolVersion {
                major: self.read_u8()?,
                minor: self.read_u8()?,
            };
            proxy.encoding = EncodingVersion::new(self.read_u8()?, self.read_u8()?);
        }
        let count = self.read_and_check_seq_size(8)?;
        for _ in 0..count {
            let transport = self.read_i16()?;
            let (encaps, encoding) = self.read_encapsulation_bytes()?;
            proxy.endpoints.push(EndpointData {
                transport,
                encoding,
                body: encaps[ENCAPSULATION_HEADER_SIZE..].to_vec(),
            });
        }
        if count == 0 {
            proxy.adapter_id = self.read_string()?;
        }
        Ok(Some(proxy))
    }

    // ------------------------------------------------------------------
    // Optionals
    // ------------------------------------------------------------------

    /// Position the stream on the optional member `tag`.
    ///
    /// Lower tags are skipped. Returns `false` without consuming anything if
    /// the member is absent, which is always the case with the 1.0 encoding.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidData` if the member has another format.
    pub fn read_optional(&mut self, tag: i32, format: OptionalFormat) -> Result<bool> {
        with_decoder!(self, read_optional(tag, format))
    }

    pub(crate) fn read_optional_header(&mut self, tag: i32, expected: OptionalFormat) -> Result<bool> {
        loop {
            if self.is_empty() {
                return Ok(false);
            }
            let start = self.pos;
            let header = self.read_u8()?;
            if header == OPTIONAL_END_MARKER {
                self.pos = start;
                return Ok(false);
            }
            let (inline, format) = optional::split_header(header)?;
            let found = if inline == optional::TAG_ESCAPE {
                self.read_size()? as i64
            } else {
                i64::from(inline)
            };
            if found > i64::from(tag) {
                self.pos = start;
                return Ok(false);
            }
            if found < i64::from(tag) {
                self.skip_optional(format)?;
                continue;
            }
            if format != expected {
                return Err(CodecError::invalid(format!(
                    "optional member {tag} has format {format:?}, expected {expected:?}"
                )));
            }
            return Ok(true);
        }
    }

    /// Skip the payload of an optional member of the given format
    pub fn skip_optional(&mut self, format: OptionalFormat) -> Result<()> {
        match format {
            OptionalFormat::Size => self.skip_size(),
            OptionalFormat::VSize => {
                let size = self.read_size()?;
                self.skip(size)
            }
            OptionalFormat::FSize => {
                let size = self.read_i32()?;
                let size = usize::try_from(size).map_err(|_| CodecError::InvalidSize(i64::from(size)))?;
                self.skip(size)
            }
            OptionalFormat::Class => self.read_value().map(|_| ()),
            fixed => self.skip(fixed.fixed_width().unwrap_or(0)),
        }
    }

    /// Skip every optional member up to the end marker or the end of the
    /// encapsulation
    pub fn skip_optionals(&mut self) -> Result<()> {
        loop {
            if self.is_empty() {
                return Ok(());
            }
            let header = self.read_u8()?;
            if header == OPTIONAL_END_MARKER {
                return Ok(());
            }
            let (inline, format) = optional::split_header(header)?;
            if inline == optional::TAG_ESCAPE {
                self.skip_size()?;
            }
            self.skip_optional(format)?;
        }
    }

    /// Read an optional boolean
    pub fn read_bool_opt(&mut self, tag: i32) -> Result<Option<bool>> {
        if self.read_optional(tag, OptionalFormat::F1)? {
            self.read_bool().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional byte
    pub fn read_u8_opt(&mut self, tag: i32) -> Result<Option<u8>> {
        if self.read_optional(tag, OptionalFormat::F1)? {
            self.read_u8().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional 16-bit integer
    pub fn read_i16_opt(&mut self, tag: i32) -> Result<Option<i16>> {
        if self.read_optional(tag, OptionalFormat::F2)? {
            self.read_i16().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional 32-bit integer
    pub fn read_i32_opt(&mut self, tag: i32) -> Result<Option<i32>> {
        if self.read_optional(tag, OptionalFormat::F4)? {
            self.read_i32().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional 64-bit integer
    pub fn read_i64_opt(&mut self, tag: i32) -> Result<Option<i64>> {
        if self.read_optional(tag, OptionalFormat::F8)? {
            self.read_i64().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional 32-bit float
    pub fn read_f32_opt(&mut self, tag: i32) -> Result<Option<f32>> {
        if self.read_optional(tag, OptionalFormat::F4)? {
            self.read_f32().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional 64-bit float
    pub fn read_f64_opt(&mut self, tag: i32) -> Result<Option<f64>> {
        if self.read_optional(tag, OptionalFormat::F8)? {
            self.read_f64().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional string
    pub fn read_string_opt(&mut self, tag: i32) -> Result<Option<String>> {
        if self.read_optional(tag, OptionalFormat::VSize)? {
            self.read_string().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional byte sequence
    pub fn read_byte_seq_opt(&mut self, tag: i32) -> Result<Option<&'a [u8]>> {
        if self.read_optional(tag, OptionalFormat::VSize)? {
            self.read_byte_seq().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional 32-bit integer sequence
    pub fn read_i32_seq_opt(&mut self, tag: i32) -> Result<Option<Vec<i32>>> {
        if self.read_optional(tag, OptionalFormat::VSize)? {
            self.skip_size()?;
            self.read_i32_seq().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional string sequence
    pub fn read_string_seq_opt(&mut self, tag: i32) -> Result<Option<Vec<String>>> {
        self.read_fsize_opt(tag, Self::read_string_seq)
    }

    /// Read an optional enumerator
    pub fn read_enum_opt(&mut self, tag: i32, max_value: i32) -> Result<Option<i32>> {
        if self.read_optional(tag, OptionalFormat::Size)? {
            self.read_enum(max_value).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read an optional proxy
    pub fn read_proxy_opt(&mut self, tag: i32) -> Result<Option<ProxyData>> {
        Ok(self.read_fsize_opt(tag, Self::read_proxy)?.flatten())
    }

    /// Read an optional whose body is framed by a four-byte size
    pub fn read_fsize_opt<T, F>(&mut self, tag: i32, read_body: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        if self.read_optional(tag, OptionalFormat::FSize)? {
            self.skip(4)?;
            read_body(self).map(Some)
        } else {
            Ok(None)
        }
    }

    // ------------------------------------------------------------------
    // Classes and exceptions
    // ------------------------------------------------------------------

    /// Read a class reference.
    ///
    /// The returned handle may designate an instance that is only decoded
    /// later (1.0 pending instances, 1.1 indirection tables); it resolves once
    /// decoding of the enclosing data completes.
    pub fn read_value(&mut self) -> Result<Option<ValueId>> {
        with_decoder!(self, read_value())
    }

    /// Read an optional class member
    pub fn read_value_opt(&mut self, tag: i32) -> Result<Option<ValueId>> {
        if self.read_optional(tag, OptionalFormat::Class)? {
            self.read_value()
        } else {
            Ok(None)
        }
    }

    /// Read the instances queued by the 1.0 encoding (no-op for 1.1)
    pub fn read_pending_values(&mut self) -> Result<()> {
        with_decoder!(self, read_pending_values())
    }

    /// Read a user exception.
    ///
    /// If no slice matches a registered exception type, the result is an
    /// [`UnknownUserException`](crate::UnknownUserException) carrying the
    /// most-derived type ID.
    pub fn read_exception(&mut self) -> Result<Box<dyn UserException>> {
        with_decoder!(self, read_exception())
    }

    /// Begin the next slice of the instance or exception being read
    pub fn start_slice(&mut self) -> Result<()> {
        with_decoder!(self, start_slice())
    }

    /// Finish the current slice
    pub fn end_slice(&mut self) -> Result<()> {
        with_decoder!(self, end_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputStream;
    use crate::version::FormatType;

    #[test]
    fn test_primitives_roundtrip() {
        let mut out = OutputStream::default();
        out.write_bool(true);
        out.write_i16(-2);
        out.write_i64(1 << 40);
        out.write_f64(2.5);
        out.write_string("héllo");
        let bytes = out.finish().unwrap();

        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert!(input.read_bool().unwrap());
        assert_eq!(input.read_i16().unwrap(), -2);
        assert_eq!(input.read_i64().unwrap(), 1 << 40);
        assert_eq!(input.read_f64().unwrap(), 2.5);
        assert_eq!(input.read_string().unwrap(), "héllo");
        assert!(input.is_empty());
    }

    #[test]
    fn test_read_past_end() {
        let mut input = InputStream::new(&[1, 2], EncodingVersion::V1_1);
        assert_eq!(
            input.read_i32(),
            Err(CodecError::UnexpectedEnd {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_encapsulation_bounds_reads() {
        let mut out = OutputStream::default();
        out.start_encapsulation(EncodingVersion::V1_1, FormatType::Compact)
            .unwrap();
        out.write_i16(7);
        out.end_encapsulation().unwrap();
        out.write_i32(99);
        let bytes = out.finish().unwrap();

        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert_eq!(input.start_encapsulation().unwrap(), EncodingVersion::V1_1);
        assert_eq!(input.read_i16().unwrap(), 7);
        assert!(input.read_i32().is_err());
        input.end_encapsulation().unwrap();
        assert_eq!(input.read_i32().unwrap(), 99);
    }

    #[test]
    fn test_encapsulation_size_below_header() {
        let bytes = [5, 0, 0, 0, 1, 1];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert!(matches!(
            input.start_encapsulation(),
            Err(CodecError::InvalidEncapsulation(_))
        ));
    }

    #[test]
    fn test_encapsulation_overrun() {
        let bytes = [20, 0, 0, 0, 1, 1, 0];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert!(matches!(
            input.start_encapsulation(),
            Err(CodecError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn test_unread_bytes_fail_end_encapsulation() {
        let bytes = [8, 0, 0, 0, 1, 1, OPTIONAL_END_MARKER, 0];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        input.start_encapsulation().unwrap();
        assert!(input.end_encapsulation().is_err());
    }

    #[test]
    fn test_trailing_byte_tolerated_in_1_0() {
        let bytes = [7, 0, 0, 0, 1, 0, 0];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        input.start_encapsulation().unwrap();
        input.end_encapsulation().unwrap();
        assert!(input.is_empty());
    }

    #[test]
    fn test_negative_size_rejected() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert_eq!(input.read_size(), Err(CodecError::InvalidSize(-1)));
    }

    #[test]
    fn test_sequence_size_checked_against_remaining() {
        let bytes = [200, 0, 0];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert_eq!(input.read_i32_seq(), Err(CodecError::InvalidSize(200)));
    }

    #[test]
    fn test_optionals_skip_and_rewind() {
        let mut out = OutputStream::new(EncodingVersion::V1_1);
        out.write_i32_opt(1, Some(10)).unwrap();
        out.write_string_opt(2, Some("skipped")).unwrap();
        out.write_i64_opt(5, Some(50)).unwrap();
        out.write_u8(OPTIONAL_END_MARKER);
        let bytes = out.finish().unwrap();

        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert_eq!(input.read_i32_opt(1).unwrap(), Some(10));
        // tag 3 is absent: tag 2 is skipped, tag 5 is left for later
        assert_eq!(input.read_i16_opt(3).unwrap(), None);
        assert_eq!(input.read_i64_opt(5).unwrap(), Some(50));
        assert_eq!(input.read_i32_opt(9).unwrap(), None);
        input.skip_optionals().unwrap();
        assert!(input.is_empty());
    }

    #[test]
    fn test_optional_format_mismatch() {
        let mut out = OutputStream::new(EncodingVersion::V1_1);
        out.write_i32_opt(1, Some(10)).unwrap();
        let bytes = out.finish().unwrap();
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert!(input.read_i64_opt(1).is_err());
    }

    #[test]
    fn test_optionals_absent_in_1_0() {
        let bytes = [(1 << 3) | 2, 5, 0, 0, 0];
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_0);
        assert_eq!(input.read_i32_opt(1).unwrap(), None);
        assert_eq!(input.position(), 0);
    }

    #[test]
    fn test_optionals_skipped_at_encapsulation_end() {
        let mut out = OutputStream::default();
        out.start_encapsulation(EncodingVersion::V1_1, FormatType::Compact)
            .unwrap();
        out.write_i32(1);
        out.write_string_opt(4, Some("new field")).unwrap();
        out.write_i32_seq_opt(40, Some(&[1, 2, 3])).unwrap();
        out.end_encapsulation().unwrap();
        let bytes = out.finish().unwrap();

        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        input.start_encapsulation().unwrap();
        assert_eq!(input.read_i32().unwrap(), 1);
        input.end_encapsulation().unwrap();
        assert_eq!(input.position(), bytes.len());
    }

    #[test]
    fn test_enum_range_checked() {
        let mut out = OutputStream::new(EncodingVersion::V1_1);
        out.write_enum(5, 10).unwrap();
        let bytes = out.finish().unwrap();
        assert_eq!(InputStream::new(&bytes, EncodingVersion::V1_1).read_enum(10).unwrap(), 5);
        assert!(InputStream::new(&bytes, EncodingVersion::V1_1).read_enum(4).is_err());
    }

    #[test]
    fn test_proxy_roundtrip_both_encodings() {
        let mut proxy = ProxyData::new(Identity::with_category("printer", "office"));
        proxy.facet = "admin".into();
        proxy.adapter_id = "PrinterAdapter".into();

        for encoding in [EncodingVersion::V1_0, EncodingVersion::V1_1] {
            let mut out = OutputStream::new(encoding);
            out.write_proxy(Some(&proxy)).unwrap();
            out.write_proxy(None).unwrap();
            let bytes = out.finish().unwrap();

            let mut input = InputStream::new(&bytes, encoding);
            let decoded = input.read_proxy().unwrap().unwrap();
            assert_eq!(decoded.identity, proxy.identity);
            assert_eq!(decoded.facet, "admin");
            assert_eq!(decoded.adapter_id, "PrinterAdapter");
            assert_eq!(input.read_proxy().unwrap(), None);
        }
    }

    #[test]
    fn test_proxy_with_endpoint() {
        let mut proxy = ProxyData::new(Identity::new("hello"));
        proxy.endpoints.push(EndpointData {
            transport: 1,
            encoding: EncodingVersion::V1_1,
            body: vec![1, 2, 3],
        });
        let mut out = OutputStream::default();
        out.write_proxy(Some(&proxy)).unwrap();
        let bytes = out.finish().unwrap();
        let decoded = InputStream::new(&bytes, EncodingVersion::V1_1)
            .read_proxy()
            .unwrap()
            .unwrap();
        assert_eq!(decoded, proxy);
    }

    #[test]
    fn test_string_dict() {
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), "1".to_string());
        dict.insert("b".to_string(), "2".to_string());
        let mut out = OutputStream::default();
        out.write_string_dict(&dict);
        let bytes = out.finish().unwrap();
        let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
        assert_eq!(input.read_string_dict().unwrap(), dict);
    }
}
